//! Timer scheduler: one-shot and repeating callbacks on the loop clock.

use crate::callback::{TimerBox, TimerState};
use crate::event_loop::EventLoop;
use evloop_runtime::{HandleId, Loop, Opaque, Remote};
use std::fmt;

/// Handle to a scheduled timer
///
/// Cancelling is idempotent and works from any thread, including from inside
/// the timer's own callback.
#[derive(Clone)]
pub struct TimerHandle {
    id: HandleId,
    state: TimerState,
    remote: Remote,
}

impl TimerHandle {
    /// The timer's handle id
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Whether the timer was cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state.is_cancelled()
    }

    /// Cancel the timer. Its callback will not run again; the loop stops
    /// and releases the timer on its next iteration. Returns `false` if the
    /// timer was already cancelled, or already finished and released (a
    /// timeout that fired, an interval that was cleared).
    pub fn cancel(&self) -> bool {
        if !self.state.cancel() {
            return false;
        }
        // Wake the loop so a far-off timer does not keep it alive. If the
        // loop is gone there is nothing left to stop.
        let posted = self
            .remote
            .async_init(Box::new(self.id), stop_cancelled)
            .and_then(|handle| handle.send());
        if let Err(err) = posted {
            tracing::trace!(id = %self.id, error = %err, "timer cancel not posted");
        }
        true
    }
}

impl fmt::Debug for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerHandle")
            .field("id", &self.id)
            .field("cancelled", &self.is_cancelled())
            .field("released", &self.state.is_released())
            .finish()
    }
}

impl EventLoop {
    /// Run `cb` once on the loop thread after `delay_ms` milliseconds. A
    /// delay of 0 fires on the next loop iteration.
    pub fn set_timeout<F>(&mut self, delay_ms: u64, cb: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let state = TimerState::default();
        let timer = TimerBox::once(Box::new(cb), state.clone());
        self.start_timer(timer, state, delay_ms, 0)
    }

    /// Run `cb` on the loop thread every `delay_ms` milliseconds, first after
    /// `delay_ms`, until the returned handle is cancelled. A period of 0 is
    /// treated as 1 ms.
    ///
    /// A running interval keeps the loop alive: `run(RunMode::Default)` does
    /// not return and dropping the loop panics until it is cancelled.
    pub fn set_interval<F>(&mut self, delay_ms: u64, cb: F) -> TimerHandle
    where
        F: FnMut() + Send + 'static,
    {
        let state = TimerState::default();
        let timer = TimerBox::repeating(Box::new(cb), state.clone());
        self.start_timer(timer, state, delay_ms, delay_ms.max(1))
    }

    /// Stop a timer right away. Returns `false` if it already fired (for a
    /// timeout) or was cleared.
    pub fn clear_timer(&mut self, handle: &TimerHandle) -> bool {
        handle.state.cancel();
        retire(&mut self.inner, handle.id)
    }

    fn start_timer(
        &mut self,
        timer: TimerBox,
        state: TimerState,
        timeout: u64,
        repeat: u64,
    ) -> TimerHandle {
        let id = self
            .inner
            .timer_start_new(timer.into_opaque(), fire_timer, timeout, repeat);
        TimerHandle {
            id,
            state,
            remote: self.inner.remote(),
        }
    }
}

/// Loop thread trampoline for both timer shapes
fn fire_timer(lp: &mut Loop, id: HandleId, data: &mut Opaque) {
    let Some(timer) = data.downcast_mut::<TimerBox>() else {
        retire(lp, id);
        return;
    };
    // A timeout is retired before its callback runs, so a panicking
    // callback still leaves nothing behind once the loop runs again.
    if timer.is_once() {
        retire(lp, id);
        timer.fire();
    } else if !timer.fire() {
        retire(lp, id);
    }
}

/// Stop and close a timer; its box is dropped by `release`. Returns `false`
/// if the timer was already closing or gone.
fn retire(lp: &mut Loop, id: HandleId) -> bool {
    if lp.timer_stop(id).is_err() {
        return false;
    }
    match lp.close_handle(id, Some(release)) {
        Ok(()) => true,
        Err(err) => {
            tracing::trace!(%id, error = %err, "timer already retired");
            false
        }
    }
}

/// Close trampoline for timers
fn release(_lp: &mut Loop, id: HandleId, data: Opaque) {
    drop(data);
    tracing::trace!(%id, "timer released");
}

/// Async trampoline posted by `TimerHandle::cancel`
fn stop_cancelled(lp: &mut Loop, id: HandleId, data: &mut Opaque) {
    if let Some(timer) = data.downcast_ref::<HandleId>().copied() {
        retire(lp, timer);
    }
    if let Err(err) = lp.close_handle(id, None) {
        tracing::warn!(%id, error = %err, "failed to close cancel handle");
    }
}
