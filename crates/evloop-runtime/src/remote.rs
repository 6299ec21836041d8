//! Cross-thread access to a loop
//!
//! A [`Remote`] can register async handles from any thread, and an
//! [`AsyncHandle`] can wake the loop from any thread. Signals that arrive
//! before the loop got around to the previous one coalesce into a single
//! callback invocation.

use crate::event_loop::Event;
use crate::handle::{AsyncFn, Handle, HandleId, Opaque, Registry};
use crate::{RuntimeError, RuntimeResult};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// State shared between a loop and its remotes
pub(crate) struct Shared {
    pub registry: Mutex<Registry>,
    pub event_tx: Sender<Event>,
}

impl Shared {
    pub(crate) fn new(event_tx: Sender<Event>) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            event_tx,
        }
    }

    /// Register an async handle; fails once the loop is closed
    pub(crate) fn async_init(self: &Arc<Self>, data: Opaque, cb: AsyncFn) -> RuntimeResult<AsyncHandle> {
        let id = HandleId::next();
        let pending = Arc::new(AtomicBool::new(false));
        {
            let mut registry = self.registry.lock();
            if registry.closed {
                // `data` is dropped after the lock is released
                drop(registry);
                drop(data);
                return Err(RuntimeError::Closed);
            }
            registry.insert(id, Handle::async_handle(data, cb, pending.clone()));
        }
        tracing::trace!(%id, "async handle registered");
        Ok(AsyncHandle {
            id,
            pending,
            shared: Arc::clone(self),
        })
    }
}

/// Thread-safe handle to a loop
#[derive(Clone)]
pub struct Remote {
    pub(crate) shared: Arc<Shared>,
}

impl Remote {
    /// Register an async handle from any thread. The handle stays active,
    /// keeping the loop alive, until it is closed on the loop thread.
    pub fn async_init(&self, data: Opaque, cb: AsyncFn) -> RuntimeResult<AsyncHandle> {
        self.shared.async_init(data, cb)
    }

    /// Whether the loop has been closed
    pub fn is_closed(&self) -> bool {
        self.shared.registry.lock().closed
    }
}

impl fmt::Debug for Remote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Remote")
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Wakes the loop and runs the handle's callback there
#[derive(Clone)]
pub struct AsyncHandle {
    id: HandleId,
    pending: Arc<AtomicBool>,
    shared: Arc<Shared>,
}

impl AsyncHandle {
    /// The handle's id on the loop
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Signal the handle. Safe from any thread. Signals sent after the handle
    /// was closed are ignored by the loop.
    pub fn send(&self) -> RuntimeResult<()> {
        if self.pending.swap(true, Ordering::AcqRel) {
            // Already signalled, the loop has not run the callback yet
            return Ok(());
        }
        self.shared
            .event_tx
            .send(Event::Async(self.id))
            .map_err(|_| RuntimeError::Closed)
    }
}

impl fmt::Debug for AsyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncHandle")
            .field("id", &self.id)
            .field("pending", &self.pending.load(Ordering::Acquire))
            .finish()
    }
}
