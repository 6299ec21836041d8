//! Callback boxes
//!
//! A callback box owns the user closures of one scheduling call and, for
//! work requests, the result slot. It is moved into the runtime as an
//! [`Opaque`] value when the call is made and recovered by downcasting in the
//! trampolines. One-shot boxes are dropped by the completion (or close)
//! trampoline; the box never returns to the caller.

use crate::error::WorkError;
use evloop_runtime::{Opaque, WorkStatus};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Boxed one-shot callback
pub(crate) type Callback = Box<dyn FnOnce() + Send>;

/// Boxed repeating callback
pub(crate) type RepeatingCallback = Box<dyn FnMut() + Send>;

/// Owns a one-shot callback
pub(crate) struct CallbackBox {
    cb: Option<Callback>,
}

impl CallbackBox {
    pub(crate) fn new<F>(cb: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        Self {
            cb: Some(Box::new(cb)),
        }
    }

    /// Run the callback; later calls do nothing
    pub(crate) fn fire(&mut self) {
        if let Some(cb) = self.cb.take() {
            cb();
        }
    }

    pub(crate) fn into_opaque(self) -> Opaque {
        Box::new(self)
    }
}

/// Set once the timer is cancelled; no callback runs afterwards
pub(crate) const TIMER_CANCELLED: u8 = 0b01;
/// Set once the timer's box was dropped; the timer is gone from the loop
pub(crate) const TIMER_RELEASED: u8 = 0b10;

/// Lifecycle flags of one timer, shared between its box and its
/// [`TimerHandle`](crate::TimerHandle)s
#[derive(Debug, Clone, Default)]
pub(crate) struct TimerState(Arc<AtomicU8>);

impl TimerState {
    /// Mark the timer cancelled. Returns `false` if it was already
    /// cancelled or released, leaving the flags untouched.
    pub(crate) fn cancel(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |flags| {
                (flags == 0).then_some(TIMER_CANCELLED)
            })
            .is_ok()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) & TIMER_CANCELLED != 0
    }

    pub(crate) fn is_released(&self) -> bool {
        self.0.load(Ordering::Acquire) & TIMER_RELEASED != 0
    }

    fn set(&self, flag: u8) {
        self.0.fetch_or(flag, Ordering::AcqRel);
    }
}

/// Owns a timer callback plus the lifecycle flags shared with its handles
pub(crate) struct TimerBox {
    cb: TimerCallback,
    state: TimerState,
}

pub(crate) enum TimerCallback {
    Once(Option<Callback>),
    Repeating(RepeatingCallback),
}

impl TimerBox {
    pub(crate) fn once(cb: Callback, state: TimerState) -> Self {
        Self {
            cb: TimerCallback::Once(Some(cb)),
            state,
        }
    }

    pub(crate) fn repeating(cb: RepeatingCallback, state: TimerState) -> Self {
        Self {
            cb: TimerCallback::Repeating(cb),
            state,
        }
    }

    pub(crate) fn is_once(&self) -> bool {
        matches!(self.cb, TimerCallback::Once(_))
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Run the callback unless cancelled. Returns `true` if the timer should
    /// keep running afterwards.
    pub(crate) fn fire(&mut self) -> bool {
        if self.is_cancelled() {
            return false;
        }
        match &mut self.cb {
            TimerCallback::Once(cb) => {
                if let Some(cb) = cb.take() {
                    cb();
                }
                false
            }
            TimerCallback::Repeating(cb) => {
                cb();
                !self.is_cancelled()
            }
        }
    }

    pub(crate) fn into_opaque(self) -> Opaque {
        Box::new(self)
    }
}

impl Drop for TimerBox {
    fn drop(&mut self) {
        self.state.set(TIMER_RELEASED);
    }
}

type WorkClosure<T> = Box<dyn FnOnce() -> T + Send>;
type AfterClosure<T> = Box<dyn FnOnce(T) + Send>;
type ErrorClosure = Box<dyn FnOnce(WorkError) + Send>;

/// Owns a work request: the work closure, its result slot and the
/// completion callbacks
pub(crate) struct WorkBox<T> {
    work: Option<WorkClosure<T>>,
    /// Written on the worker thread, read on the loop thread after the box
    /// came back through the completion queue
    result: Option<T>,
    after: Option<AfterClosure<T>>,
    on_error: Option<ErrorClosure>,
}

impl<T: Send + 'static> WorkBox<T> {
    pub(crate) fn new(
        work: WorkClosure<T>,
        after: Option<AfterClosure<T>>,
        on_error: Option<ErrorClosure>,
    ) -> Self {
        Self {
            work: Some(work),
            result: None,
            after,
            on_error,
        }
    }

    /// Worker side: run the work closure into the result slot
    pub(crate) fn run(&mut self) {
        if let Some(work) = self.work.take() {
            self.result = Some(work());
        }
    }

    /// Loop side: hand the result (or the failure) to the completion
    /// callbacks. Consumes the box. A failure nobody asked to hear about is
    /// handed back to the caller.
    pub(crate) fn complete(self, status: WorkStatus) -> Result<(), WorkError> {
        let WorkBox {
            result,
            after,
            on_error,
            ..
        } = self;

        let outcome = match (status, result) {
            (WorkStatus::Completed, Some(value)) => Ok(value),
            (WorkStatus::Completed, None) => {
                Err(WorkError::Panicked("work produced no result".to_string()))
            }
            (WorkStatus::Cancelled, _) => Err(WorkError::Cancelled),
            (WorkStatus::Panicked(message), _) => Err(WorkError::Panicked(message)),
        };

        match outcome {
            Ok(value) => {
                if let Some(after) = after {
                    after(value);
                }
                Ok(())
            }
            Err(err) => match on_error {
                Some(on_error) => {
                    on_error(err);
                    Ok(())
                }
                None => Err(err),
            },
        }
    }

    pub(crate) fn into_opaque(self) -> Opaque {
        Box::new(self)
    }
}
