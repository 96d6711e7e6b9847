//! Error types for the execution engine
//!
//! Domain errors use thiserror; conversions to `anyhow` happen at control
//! boundaries (the CLI binary). Script-level syntax/runtime errors are a
//! separate wire format defined in [`crate::lang::error`].

use thiserror::Error;

use super::handles::HandleId;

/// Handle-registry errors. All of these are safe failures: stale or
/// over-released handles report, they never touch freed state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleError {
    /// The slot was reused or freed since this handle was created.
    #[error("Stale handle {0}")]
    Stale(HandleId),

    /// The owning document's session generation changed.
    #[error("Handle {0} outlived its document session")]
    SessionExpired(HandleId),

    /// Release was called more times than retain.
    #[error("Handle {0} released while refcount was zero")]
    OverReleased(HandleId),
}

/// Convenience result alias for handle operations.
pub type HandleResult<T> = std::result::Result<T, HandleError>;

/// Event-queue errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueError {
    /// The bounded queue is at capacity; the post is refused, never blocked.
    #[error("Event queue full (capacity {0})")]
    Full(usize),

    /// A script error is posted and unacknowledged; idle-class events are
    /// refused until the host acknowledges it.
    #[error("Event refused while a script error is pending acknowledgement")]
    ErrorPending,

    /// The worker has terminated; nothing can be posted anymore.
    #[error("Engine terminated")]
    Terminated,
}

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Handle-registry failure.
    #[error("Handle error: {0}")]
    Handle(#[from] HandleError),

    /// Event-queue failure.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Terminology registration after setup, duplicate class names, or a
    /// malformed command grammar. These are host programming errors and fail
    /// immediately.
    #[error("Terminology error: {0}")]
    Terminology(String),

    /// The worker thread is gone (terminated or panicked).
    #[error("Worker unavailable: {0}")]
    WorkerGone(String),

    /// Document acquisition timed out.
    #[error("Could not acquire document within the timeout")]
    AcquireTimeout,

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A script error surfaced from a one-shot evaluation.
    #[error("Script error: {0}")]
    Script(#[from] crate::lang::ScriptError),
}

/// Result type using [`EngineError`].
pub type Result<T> = std::result::Result<T, EngineError>;
