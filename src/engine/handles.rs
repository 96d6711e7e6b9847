//! Generation-checked handle registry
//!
//! Host objects (documents, layers, widgets) are referenced through slots in
//! an arena. A [`HandleId`] is a slot index plus the slot's generation at
//! creation time; a handle additionally records the owning document's session
//! generation. Either mismatch turns every later operation into a typed
//! failure instead of a dangling read. [`HandleRef`] is the owning form:
//! clone retains, drop releases, exactly once each.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use super::error::{HandleError, HandleResult};

/// Identity of one open document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentId(pub Uuid);

impl DocumentId {
    /// Create a fresh document identity.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for DocumentId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of host object a handle designates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HandleKind {
    /// The whole document.
    Document,
    /// A card layer.
    Card,
    /// A background layer.
    Background,
    /// A widget (button, field, …) on a layer.
    Widget,
    /// Marker standing for the element count of a collection.
    CollectionCount,
}

/// Descriptor for a host object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleDesc {
    /// Kind tag.
    pub kind: HandleKind,
    /// Terminology class name (`"card"`, `"button"`, …) used for property
    /// dispatch and the responder chain.
    pub class: String,
    /// Owning document.
    pub document: DocumentId,
    /// Session generation of the owning document at creation time.
    pub session: u64,
    /// Layer identifier within the document (0 for the document itself).
    pub layer: u64,
    /// Widget identifier within the layer (0 for non-widgets).
    pub widget: u64,
}

/// Slot index plus generation; the weak, copyable form of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HandleId {
    /// Arena slot index.
    pub index: u32,
    /// Slot generation at creation time.
    pub generation: u32,
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}.{}", self.index, self.generation)
    }
}

struct Slot {
    generation: u32,
    refs: u32,
    desc: Option<HandleDesc>,
}

struct Inner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    sessions: HashMap<DocumentId, u64>,
    autorelease: Vec<HandleId>,
}

/// Arena of refcounted, session-validated host-object handles.
pub struct HandleRegistry {
    inner: Mutex<Inner>,
}

impl HandleRegistry {
    /// Create an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                sessions: HashMap::new(),
                autorelease: Vec::new(),
            }),
        })
    }

    /// Begin (or restart) a session for `document`, returning the new session
    /// generation. All handles created under earlier generations of the same
    /// document become stale.
    pub fn begin_session(&self, document: DocumentId) -> u64 {
        let mut inner = self.inner.lock();
        let session = inner.sessions.entry(document).or_insert(0);
        *session += 1;
        *session
    }

    /// Current session generation for `document`, if the document is open.
    pub fn current_session(&self, document: DocumentId) -> Option<u64> {
        self.inner.lock().sessions.get(&document).copied()
    }

    /// Create a manually released handle (refcount starts at one; the
    /// returned [`HandleRef`] owns that reference).
    pub fn create(self: &Arc<Self>, desc: HandleDesc) -> HandleRef {
        let id = self.alloc(desc);
        HandleRef {
            registry: Arc::clone(self),
            id,
        }
    }

    /// Create an auto-released handle: one extra reference is parked in the
    /// auto-release pool and reclaimed at the worker's next quiescent point.
    pub fn create_auto(self: &Arc<Self>, desc: HandleDesc) -> HandleRef {
        let handle = self.create(desc);
        self.autorelease(handle.id);
        handle
    }

    fn alloc(&self, desc: HandleDesc) -> HandleId {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.free.pop() {
            let slot = &mut inner.slots[index as usize];
            slot.refs = 1;
            slot.desc = Some(desc);
            HandleId {
                index,
                generation: slot.generation,
            }
        } else {
            let index = inner.slots.len() as u32;
            inner.slots.push(Slot {
                generation: 1,
                refs: 1,
                desc: Some(desc),
            });
            HandleId {
                index,
                generation: 1,
            }
        }
    }

    /// Retain an extra reference. Stale handles fail without side effects.
    pub fn retain(&self, id: HandleId) -> HandleResult<()> {
        let mut inner = self.inner.lock();
        match inner.slot_mut(id) {
            Some(slot) => {
                slot.refs += 1;
                Ok(())
            }
            None => Err(HandleError::Stale(id)),
        }
    }

    /// Release one reference. Releasing a stale or zero-refcount handle is a
    /// reported no-op, never undefined behavior.
    pub fn release(&self, id: HandleId) -> HandleResult<()> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.slot_mut(id) else {
            warn!(handle = %id, "release of stale handle ignored");
            return Err(HandleError::Stale(id));
        };
        if slot.refs == 0 {
            warn!(handle = %id, "over-release ignored");
            return Err(HandleError::OverReleased(id));
        }
        slot.refs -= 1;
        if slot.refs == 0 {
            slot.desc = None;
            slot.generation = slot.generation.wrapping_add(1);
            inner.free.push(id.index);
        }
        Ok(())
    }

    /// Retain the handle on behalf of the auto-release pool; the reference is
    /// dropped at the next [`HandleRegistry::drain_autorelease`].
    pub fn autorelease(&self, id: HandleId) {
        let mut inner = self.inner.lock();
        if inner.slot_mut(id).map(|slot| slot.refs += 1).is_some() {
            inner.autorelease.push(id);
        }
    }

    /// Drain the auto-release pool. Called only from the worker thread at
    /// event-loop quiescent points; the registry lock keeps the drain
    /// exclusive with handle mutation from other threads.
    pub fn drain_autorelease(&self) {
        let pending = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.autorelease)
        };
        for id in pending {
            let _ = self.release(id);
        }
    }

    /// Number of entries waiting in the auto-release pool.
    pub fn autorelease_len(&self) -> usize {
        self.inner.lock().autorelease.len()
    }

    /// Look up the descriptor, validating both the slot generation and the
    /// owning document's session.
    pub fn lookup(&self, id: HandleId) -> HandleResult<HandleDesc> {
        let inner = self.inner.lock();
        let slot = inner
            .slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.refs > 0)
            .ok_or(HandleError::Stale(id))?;
        let desc = slot.desc.as_ref().ok_or(HandleError::Stale(id))?;
        match inner.sessions.get(&desc.document) {
            Some(&session) if session == desc.session => Ok(desc.clone()),
            _ => Err(HandleError::SessionExpired(id)),
        }
    }

    /// True when the handle is still live and its session matches.
    pub fn is_valid(&self, id: HandleId) -> bool {
        self.lookup(id).is_ok()
    }

    /// Two handles are equivalent when they are the same slot or describe the
    /// same host object.
    pub fn same_object(&self, lhs: HandleId, rhs: HandleId) -> bool {
        if lhs == rhs {
            return true;
        }
        match (self.lookup(lhs), self.lookup(rhs)) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// Human-readable description, safe on stale handles.
    pub fn describe(&self, id: HandleId) -> String {
        match self.lookup(id) {
            Ok(desc) => match desc.kind {
                HandleKind::Document => format!("document {}", desc.document),
                HandleKind::Card | HandleKind::Background => {
                    format!("{} id {}", desc.class, desc.layer)
                }
                HandleKind::Widget => {
                    format!("{} id {} of layer {}", desc.class, desc.widget, desc.layer)
                }
                HandleKind::CollectionCount => {
                    format!("the number of {}s", desc.class)
                }
            },
            Err(_) => format!("stale reference {}", id),
        }
    }

    /// Current refcount, for tests and diagnostics (0 for stale handles).
    pub fn refcount(&self, id: HandleId) -> u32 {
        let inner = self.inner.lock();
        inner
            .slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .map(|slot| slot.refs)
            .unwrap_or(0)
    }
}

impl Inner {
    fn slot_mut(&mut self, id: HandleId) -> Option<&mut Slot> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation && slot.desc.is_some())
    }
}

/// Owning reference into the registry.
///
/// Clone retains; drop releases. If the underlying slot went stale, both are
/// safe no-ops.
pub struct HandleRef {
    registry: Arc<HandleRegistry>,
    id: HandleId,
}

impl HandleRef {
    /// The weak id form.
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Descriptor lookup with session validation.
    pub fn desc(&self) -> HandleResult<HandleDesc> {
        self.registry.lookup(self.id)
    }

    /// True while the handle is live.
    pub fn is_valid(&self) -> bool {
        self.registry.is_valid(self.id)
    }

    /// Human-readable description.
    pub fn description(&self) -> String {
        self.registry.describe(self.id)
    }

    /// Equivalence test.
    pub fn same_object(&self, other: &HandleRef) -> bool {
        self.registry.same_object(self.id, other.id)
    }

    /// The registry this handle belongs to.
    pub fn registry(&self) -> &Arc<HandleRegistry> {
        &self.registry
    }
}

impl Clone for HandleRef {
    fn clone(&self) -> Self {
        let _ = self.registry.retain(self.id);
        Self {
            registry: Arc::clone(&self.registry),
            id: self.id,
        }
    }
}

impl Drop for HandleRef {
    fn drop(&mut self) {
        let _ = self.registry.release(self.id);
    }
}

impl fmt::Debug for HandleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HandleRef({})", self.id)
    }
}

impl PartialEq for HandleRef {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn widget_desc(document: DocumentId, session: u64, widget: u64) -> HandleDesc {
        HandleDesc {
            kind: HandleKind::Widget,
            class: "button".to_string(),
            document,
            session,
            layer: 1,
            widget,
        }
    }

    #[test]
    fn create_lookup_release_cycle() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);

        let handle = registry.create(widget_desc(doc, session, 7));
        assert!(handle.is_valid());
        assert_eq!(handle.desc().unwrap().widget, 7);

        let id = handle.id();
        drop(handle);
        assert!(!registry.is_valid(id));
        assert!(matches!(registry.lookup(id), Err(HandleError::Stale(_))));
    }

    #[test]
    fn clone_retains_and_drop_releases_once() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);

        let handle = registry.create(widget_desc(doc, session, 1));
        let id = handle.id();
        let copy = handle.clone();
        assert_eq!(registry.refcount(id), 2);
        drop(copy);
        assert_eq!(registry.refcount(id), 1);
        drop(handle);
        assert_eq!(registry.refcount(id), 0);
    }

    #[test]
    fn over_release_is_a_safe_error() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);
        let handle = registry.create(widget_desc(doc, session, 1));
        let id = handle.id();
        drop(handle);

        assert!(matches!(
            registry.release(id),
            Err(HandleError::Stale(_)) | Err(HandleError::OverReleased(_))
        ));
    }

    #[test]
    fn session_change_invalidates_handles() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);
        let handle = registry.create(widget_desc(doc, session, 1));
        assert!(handle.is_valid());

        registry.begin_session(doc);
        assert!(!handle.is_valid());
        assert!(matches!(
            handle.desc(),
            Err(HandleError::SessionExpired(_))
        ));
        // Dropping the stale handle must still be safe.
        drop(handle);
    }

    #[test]
    fn slot_reuse_bumps_generation() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);

        let first = registry.create(widget_desc(doc, session, 1));
        let first_id = first.id();
        drop(first);

        let second = registry.create(widget_desc(doc, session, 2));
        assert_eq!(second.id().index, first_id.index);
        assert_ne!(second.id().generation, first_id.generation);
        // The old id must not resolve to the new occupant.
        assert!(registry.lookup(first_id).is_err());
    }

    #[test]
    fn autorelease_pool_drains_at_quiescent_point() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);

        let handle = registry.create_auto(widget_desc(doc, session, 1));
        let id = handle.id();
        assert_eq!(registry.refcount(id), 2);
        drop(handle);
        assert_eq!(registry.refcount(id), 1);
        assert!(registry.is_valid(id));

        registry.drain_autorelease();
        assert!(!registry.is_valid(id));
        assert_eq!(registry.autorelease_len(), 0);
    }

    #[test]
    fn equivalence_compares_descriptors() {
        let registry = HandleRegistry::new();
        let doc = DocumentId::new();
        let session = registry.begin_session(doc);
        let a = registry.create(widget_desc(doc, session, 3));
        let b = registry.create(widget_desc(doc, session, 3));
        let c = registry.create(widget_desc(doc, session, 4));
        assert!(a.same_object(&b));
        assert!(!a.same_object(&c));
    }
}
