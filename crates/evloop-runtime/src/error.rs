//! Runtime error types.

use crate::handle::{HandleId, HandleKind};

/// Errors reported by the event loop runtime.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// A thread pool worker could not be spawned
    #[error("Failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// The loop still owns handles or requests and cannot be closed
    #[error("Loop is busy: {handles} handle(s) still open")]
    Busy {
        /// Number of handles that have not been closed yet
        handles: usize,
    },

    /// The loop backing a remote handle has been closed
    #[error("Loop is closed")]
    Closed,

    /// No open handle with this id exists
    #[error("Invalid handle: {0}")]
    InvalidHandle(HandleId),

    /// The handle exists but is of another kind
    #[error("Handle {id} is not a {expected} handle")]
    WrongHandleKind {
        /// Offending handle
        id: HandleId,
        /// Kind the operation requires
        expected: HandleKind,
    },

    /// `close` was already requested for this handle
    #[error("Handle {0} is already closing")]
    AlreadyClosing(HandleId),

    /// Work requests complete on their own and cannot be closed
    #[error("Handle {0} cannot be closed")]
    NotClosable(HandleId),

    /// The work request already started or finished
    #[error("Work request {0} can no longer be cancelled")]
    NotCancellable(HandleId),

    /// `timer_again` on a timer that was never started
    #[error("Timer {0} was never started")]
    NotStarted(HandleId),
}

/// Result type for runtime operations
pub type RuntimeResult<T> = Result<T, RuntimeError>;
