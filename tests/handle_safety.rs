//! Handle-registry safety: any interleaving of retain, release, auto-release
//! drains, and session restarts must fail cleanly, never dangle or crash.

use proptest::prelude::*;

use cardtalk::engine::{DocumentId, HandleDesc, HandleKind, HandleRegistry};

fn widget_desc(document: DocumentId, session: u64) -> HandleDesc {
    HandleDesc {
        kind: HandleKind::Widget,
        class: "button".into(),
        document,
        session,
        layer: 1,
        widget: 1,
    }
}

#[test]
fn release_beyond_retain_count_is_a_typed_failure() {
    let registry = HandleRegistry::new();
    let document = DocumentId::new();
    let session = registry.begin_session(document);
    let handle = registry.create(widget_desc(document, session));
    let id = handle.id();

    registry.retain(id).unwrap();
    registry.release(id).unwrap();
    drop(handle);
    // Slot is free now; further releases must report, not corrupt.
    assert!(registry.release(id).is_err());
    assert!(registry.release(id).is_err());
    assert_eq!(registry.refcount(id), 0);
}

#[test]
fn stale_ids_never_resolve_to_a_reused_slot() {
    let registry = HandleRegistry::new();
    let document = DocumentId::new();
    let session = registry.begin_session(document);

    let first = registry.create(widget_desc(document, session));
    let first_id = first.id();
    drop(first);

    let second = registry.create(widget_desc(document, session));
    assert_eq!(second.id().index, first_id.index);
    assert!(registry.lookup(first_id).is_err());
    assert!(registry.lookup(second.id()).is_ok());
}

#[test]
fn describing_a_stale_handle_is_safe() {
    let registry = HandleRegistry::new();
    let document = DocumentId::new();
    let session = registry.begin_session(document);
    let handle = registry.create(widget_desc(document, session));
    let id = handle.id();
    drop(handle);
    assert!(registry.describe(id).contains("stale"));
}

proptest! {
    /// Any op sequence leaves the registry consistent: lookups either
    /// resolve or fail typed, refcounts never underflow, and validity
    /// implies a live refcount.
    #[test]
    fn op_sequences_never_corrupt_the_registry(
        ops in proptest::collection::vec(0u8..5, 0..64)
    ) {
        let registry = HandleRegistry::new();
        let document = DocumentId::new();
        let session = registry.begin_session(document);
        let handle = registry.create(widget_desc(document, session));
        let id = handle.id();

        for op in ops {
            match op {
                0 => { let _ = registry.retain(id); }
                1 => { let _ = registry.release(id); }
                2 => registry.autorelease(id),
                3 => registry.drain_autorelease(),
                _ => { registry.begin_session(document); }
            }
            if registry.is_valid(id) {
                prop_assert!(registry.refcount(id) > 0);
            }
            // Never panics, regardless of staleness.
            let _ = registry.describe(id);
        }
        let _ = registry.lookup(id);
    }

    /// Auto-released handles survive exactly until the next drain.
    #[test]
    fn autorelease_balances_after_drain(extra in 0u32..8) {
        let registry = HandleRegistry::new();
        let document = DocumentId::new();
        let session = registry.begin_session(document);
        let handle = registry.create_auto(widget_desc(document, session));
        let id = handle.id();

        for _ in 0..extra {
            registry.retain(id).unwrap();
        }
        registry.drain_autorelease();
        prop_assert_eq!(registry.refcount(id), 1 + extra);

        for _ in 0..extra {
            registry.release(id).unwrap();
        }
        drop(handle);
        prop_assert_eq!(registry.refcount(id), 0);
    }
}
