//! Bounded system-event queue
//!
//! Pending system events for one document, strictly FIFO. Posting to a full
//! queue is a reported failure, never a block. While a script error is
//! posted and unacknowledged, idle-class events are refused so the host's
//! error display is not flooded by the idle ticker.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::error::QueueError;
use super::handles::HandleRef;
use crate::lang::Variant;

/// Default queue capacity when the config does not override it.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Scheduling class of a system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A user-driven event (mouse, key, host action).
    User,
    /// Periodic idle tick; refused while a script error awaits
    /// acknowledgement.
    Idle,
}

/// One pending system event.
#[derive(Debug, Clone)]
pub struct SystemEvent {
    /// Scheduling class.
    pub kind: EventKind,
    /// Message name dispatched to the target's responder chain.
    pub message: String,
    /// Target object; `None` dispatches nowhere and reports no-open-document.
    pub target: Option<HandleRef>,
    /// At most one parameter, ownership transferred to the engine.
    pub param: Option<Variant>,
}

impl SystemEvent {
    /// A user event with no parameter.
    pub fn user(message: impl Into<String>, target: Option<HandleRef>) -> Self {
        Self {
            kind: EventKind::User,
            message: message.into(),
            target,
            param: None,
        }
    }

    /// An idle tick aimed at `target`.
    pub fn idle(target: Option<HandleRef>) -> Self {
        Self {
            kind: EventKind::Idle,
            message: "idle".into(),
            target,
            param: None,
        }
    }

    /// Attach the single parameter.
    pub fn with_param(mut self, param: Variant) -> Self {
        self.param = Some(param);
        self
    }

    /// Short description for logging.
    pub fn describe(&self) -> String {
        match &self.target {
            Some(target) => format!("{} -> {}", self.message, target.description()),
            None => self.message.clone(),
        }
    }
}

/// The bounded FIFO, plus the error-acknowledgement gate.
#[derive(Debug)]
pub struct EventQueue {
    capacity: usize,
    items: VecDeque<SystemEvent>,
    error_pending: bool,
}

impl EventQueue {
    /// Create a queue with the given capacity (at least one slot).
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            items: VecDeque::new(),
            error_pending: false,
        }
    }

    /// Post an event. Fails without blocking when the queue is at capacity,
    /// or for idle events while an error awaits acknowledgement.
    pub fn post(&mut self, event: SystemEvent) -> Result<(), QueueError> {
        if self.error_pending && event.kind == EventKind::Idle {
            return Err(QueueError::ErrorPending);
        }
        if self.items.len() >= self.capacity {
            return Err(QueueError::Full(self.capacity));
        }
        self.items.push_back(event);
        Ok(())
    }

    /// Take the oldest pending event.
    pub fn pop(&mut self) -> Option<SystemEvent> {
        self.items.pop_front()
    }

    /// Discard everything pending (abort semantics).
    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// Number of pending events.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Mark a script error as posted; idle events are refused until
    /// [`EventQueue::acknowledge_error`].
    pub fn set_error_pending(&mut self) {
        self.error_pending = true;
    }

    /// Host acknowledged the posted error.
    pub fn acknowledge_error(&mut self) {
        self.error_pending = false;
    }

    /// True while a posted error awaits acknowledgement.
    pub fn error_pending(&self) -> bool {
        self.error_pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn posting_past_capacity_fails_without_blocking() {
        let mut queue = EventQueue::new(2);
        queue.post(SystemEvent::user("mouseup", None)).unwrap();
        queue.post(SystemEvent::user("mousedown", None)).unwrap();
        assert_eq!(
            queue.post(SystemEvent::user("keydown", None)),
            Err(QueueError::Full(2))
        );
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn events_drain_in_fifo_order() {
        let mut queue = EventQueue::new(4);
        for name in ["a", "b", "c"] {
            queue.post(SystemEvent::user(name, None)).unwrap();
        }
        let drained: Vec<String> = std::iter::from_fn(|| queue.pop())
            .map(|event| event.message)
            .collect();
        assert_eq!(drained, ["a", "b", "c"]);
    }

    #[test]
    fn idle_events_refused_while_error_pending() {
        let mut queue = EventQueue::new(4);
        queue.set_error_pending();
        assert_eq!(
            queue.post(SystemEvent::idle(None)),
            Err(QueueError::ErrorPending)
        );
        // User events still flow; the host may be reacting to the error.
        queue.post(SystemEvent::user("mouseup", None)).unwrap();

        queue.acknowledge_error();
        queue.post(SystemEvent::idle(None)).unwrap();
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn clear_discards_everything() {
        let mut queue = EventQueue::new(4);
        queue.post(SystemEvent::user("a", None)).unwrap();
        queue.post(SystemEvent::user("b", None)).unwrap();
        queue.clear();
        assert!(queue.is_empty());
    }
}
