//! Facade error types.

use crate::event_loop::EventLoop;
use evloop_runtime::RuntimeError;
use std::fmt;

/// Why a work request did not produce a value
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    /// Cancelled before a worker picked it up
    #[error("work was cancelled")]
    Cancelled,

    /// The work closure panicked
    #[error("work panicked: {0}")]
    Panicked(String),
}

/// Returned by [`EventLoop::close`] when the loop still has open handles.
/// Carries the loop back so the caller can finish its handles and retry.
///
/// The error owns that busy loop, so dropping it (for example after `?`
/// carried it out of `main`) drops the loop and panics like dropping a busy
/// [`EventLoop`] does. Take the loop back with [`into_loop`](Self::into_loop)
/// to avoid that.
#[derive(thiserror::Error)]
#[error("failed to close event loop: {source}")]
pub struct CloseError {
    event_loop: Box<EventLoop>,
    #[source]
    source: RuntimeError,
}

impl CloseError {
    pub(crate) fn new(event_loop: EventLoop, source: RuntimeError) -> Self {
        Self {
            event_loop: Box::new(event_loop),
            source,
        }
    }

    /// The underlying runtime error
    pub fn error(&self) -> &RuntimeError {
        &self.source
    }

    /// Take the loop back
    pub fn into_loop(self) -> EventLoop {
        *self.event_loop
    }
}

impl fmt::Debug for CloseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloseError")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}
