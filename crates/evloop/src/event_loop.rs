//! Loop owner
//!
//! [`EventLoop`] owns one runtime [`Loop`] for its whole life. Scheduling
//! operations live next to their trampolines in `work`, `notify` and
//! `timer`; this module holds construction, running and teardown.

use crate::error::CloseError;
use crate::notify::Notifier;
use evloop_runtime::{Loop, LoopConfig, RunMode, RuntimeResult};
use std::fmt;

/// Owns an event loop and schedules callbacks on it
///
/// Dropping an `EventLoop` that still has open handles (for example a
/// running interval) panics. Cancel outstanding timers and let pending work
/// finish with [`run`](Self::run) first, or use [`close`](Self::close) to
/// get an error instead.
pub struct EventLoop {
    pub(crate) inner: Loop,
    closed: bool,
}

impl EventLoop {
    /// Create a loop configured from the environment
    /// (`EVLOOP_THREADPOOL_SIZE`)
    pub fn new() -> RuntimeResult<Self> {
        Self::with_config(&LoopConfig::from_env())
    }

    /// Create a loop with explicit configuration
    pub fn with_config(config: &LoopConfig) -> RuntimeResult<Self> {
        Ok(Self {
            inner: Loop::new(config)?,
            closed: false,
        })
    }

    /// Block dispatching callbacks until `mode`'s condition is met. Returns
    /// `true` if work is still pending.
    ///
    /// A callback that panics on the loop thread unwinds out of `run`.
    pub fn run(&mut self, mode: RunMode) -> bool {
        self.inner.run(mode)
    }

    /// Make `run` return after the current iteration
    pub fn stop(&mut self) {
        self.inner.stop();
    }

    /// Whether pending work keeps the loop running
    pub fn alive(&self) -> bool {
        self.inner.alive()
    }

    /// Number of handles keeping the loop alive
    pub fn active_handles(&self) -> usize {
        self.inner.active_count()
    }

    /// Loop time in milliseconds
    pub fn now(&self) -> u64 {
        self.inner.now()
    }

    /// Number of worker threads
    pub fn threadpool_size(&self) -> usize {
        self.inner.threadpool_size()
    }

    /// Handle for sending callbacks to this loop from other threads
    pub fn notifier(&self) -> Notifier {
        Notifier::new(self.inner.remote())
    }

    /// Tear the loop down. Fails if handles are still open, handing the loop
    /// back inside the error.
    pub fn close(mut self) -> Result<(), CloseError> {
        match self.inner.close() {
            Ok(()) => {
                self.closed = true;
                Ok(())
            }
            Err(source) => Err(CloseError::new(self, source)),
        }
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("inner", &self.inner)
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match self.inner.close() {
            Ok(()) => self.closed = true,
            Err(err) if std::thread::panicking() => {
                tracing::warn!(error = %err, "event loop dropped while unwinding");
            }
            Err(err) => panic!("event loop dropped while busy: {err}"),
        }
    }
}
