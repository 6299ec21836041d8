//! Cross-thread notifier: run a callback on the loop thread, sent from any
//! thread.
//!
//! Every send registers its own async handle, signals it, and closes it after
//! the callback ran, so each send runs its callback exactly once. Pending
//! sends keep the loop alive.

use crate::callback::CallbackBox;
use crate::event_loop::EventLoop;
use evloop_runtime::{HandleId, Loop, Opaque, Remote, RuntimeResult};

/// Sends callbacks to an [`EventLoop`] from any thread
#[derive(Debug, Clone)]
pub struct Notifier {
    remote: Remote,
}

impl Notifier {
    pub(crate) fn new(remote: Remote) -> Self {
        Self { remote }
    }

    /// Queue `cb` to run once on the loop thread. Fails with
    /// [`RuntimeError::Closed`](evloop_runtime::RuntimeError::Closed) if the
    /// loop is gone; `cb` is dropped without running in that case.
    pub fn send<F>(&self, cb: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        send_via(&self.remote, CallbackBox::new(cb))
    }

    /// Whether the loop has been closed
    pub fn is_closed(&self) -> bool {
        self.remote.is_closed()
    }
}

impl EventLoop {
    /// Queue `cb` to run once on a later loop iteration
    pub fn async_send<F>(&mut self, cb: F) -> RuntimeResult<()>
    where
        F: FnOnce() + Send + 'static,
    {
        send_via(&self.inner.remote(), CallbackBox::new(cb))
    }
}

fn send_via(remote: &Remote, callback: CallbackBox) -> RuntimeResult<()> {
    let handle = remote.async_init(callback.into_opaque(), fire_once)?;
    handle.send()
}

/// Loop thread trampoline: retire the handle, then run the callback. The
/// box is released at the end of the iteration, or on the next `run` if the
/// callback panicked.
fn fire_once(lp: &mut Loop, id: HandleId, data: &mut Opaque) {
    if let Err(err) = lp.close_handle(id, Some(release)) {
        tracing::warn!(%id, error = %err, "failed to close notifier handle");
    }
    if let Some(callback) = data.downcast_mut::<CallbackBox>() {
        callback.fire();
    }
}

/// Close trampoline; the box is dropped here
fn release(_lp: &mut Loop, id: HandleId, data: Opaque) {
    drop(data);
    tracing::trace!(%id, "notifier released");
}
