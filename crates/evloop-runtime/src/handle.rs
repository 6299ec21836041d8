//! Handles, callback signatures and the handle registry
//!
//! Every scheduling call creates one handle. The caller's state travels with
//! the handle as an [`Opaque`] value which the runtime never inspects: it is
//! moved into the registry (or onto a worker thread for work requests), lent
//! to the callback while it runs, and moved back out to the caller when the
//! handle completes or closes.

use crate::event_loop::Loop;
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Caller-owned state attached to a handle.
pub type Opaque = Box<dyn Any + Send>;

/// Runs on a worker thread with the request's state.
pub type WorkFn = fn(&mut Opaque);

/// Runs on the loop thread once a work request finished, was cancelled or
/// panicked. Receives the request's state back by value.
pub type AfterWorkFn = fn(&mut Loop, HandleId, Opaque, WorkStatus);

/// Runs on the loop thread when an async handle was signalled.
pub type AsyncFn = fn(&mut Loop, HandleId, &mut Opaque);

/// Runs on the loop thread when a timer expires.
pub type TimerFn = fn(&mut Loop, HandleId, &mut Opaque);

/// Runs on the loop thread once a closed handle is released. Receives the
/// handle's state back by value.
pub type CloseFn = fn(&mut Loop, HandleId, Opaque);

/// Unique identifier for a handle
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    /// Generate a new unique HandleId
    pub(crate) fn next() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the numeric ID value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Kind of a handle
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleKind {
    /// Thread pool work request
    Work,
    /// Cross-thread wake handle
    Async,
    /// One-shot or repeating timer
    Timer,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HandleKind::Work => "work",
            HandleKind::Async => "async",
            HandleKind::Timer => "timer",
        };
        f.write_str(name)
    }
}

/// Completion status of a work request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkStatus {
    /// The work function ran to completion
    Completed,
    /// The request was cancelled before a worker picked it up
    Cancelled,
    /// The work function panicked; carries the panic message
    Panicked(String),
}

impl WorkStatus {
    /// Whether the work function returned normally
    pub fn is_completed(&self) -> bool {
        matches!(self, WorkStatus::Completed)
    }
}

pub(crate) const WORK_QUEUED: u8 = 0;
pub(crate) const WORK_RUNNING: u8 = 1;
pub(crate) const WORK_CANCELLED: u8 = 2;

/// Kind-specific handle state
pub(crate) enum HandleInner {
    Work {
        after: AfterWorkFn,
        /// Shared with the job in flight; see `WORK_*`
        state: Arc<AtomicU8>,
    },
    Async {
        cb: AsyncFn,
        /// Set by `AsyncHandle::send`, cleared right before the callback runs
        pending: Arc<AtomicBool>,
    },
    Timer(TimerState),
}

#[derive(Default)]
pub(crate) struct TimerState {
    pub cb: Option<TimerFn>,
    /// Loop time (ms) of the next expiry
    pub due: u64,
    /// Repeat period in ms, 0 for one-shot
    pub repeat: u64,
    /// Start sequence; heap entries with another sequence are stale
    pub seq: u64,
}

/// A registered handle
pub(crate) struct Handle {
    pub kind: HandleKind,
    /// `None` while lent to a callback or while a work request is in flight
    pub data: Option<Opaque>,
    /// Active handles keep `Loop::run` going
    pub active: bool,
    pub closing: bool,
    pub close_cb: Option<CloseFn>,
    pub inner: HandleInner,
}

impl Handle {
    pub(crate) fn work(after: AfterWorkFn, state: Arc<AtomicU8>) -> Self {
        Self {
            kind: HandleKind::Work,
            data: None,
            active: true,
            closing: false,
            close_cb: None,
            inner: HandleInner::Work { after, state },
        }
    }

    pub(crate) fn async_handle(data: Opaque, cb: AsyncFn, pending: Arc<AtomicBool>) -> Self {
        Self {
            kind: HandleKind::Async,
            data: Some(data),
            active: true,
            closing: false,
            close_cb: None,
            inner: HandleInner::Async { cb, pending },
        }
    }

    pub(crate) fn timer(data: Opaque) -> Self {
        Self {
            kind: HandleKind::Timer,
            data: Some(data),
            active: false,
            closing: false,
            close_cb: None,
            inner: HandleInner::Timer(TimerState::default()),
        }
    }

    pub(crate) fn timer_state(&self) -> Option<&TimerState> {
        match &self.inner {
            HandleInner::Timer(timer) => Some(timer),
            _ => None,
        }
    }

    pub(crate) fn timer_state_mut(&mut self) -> Option<&mut TimerState> {
        match &mut self.inner {
            HandleInner::Timer(timer) => Some(timer),
            _ => None,
        }
    }
}

/// All handles that have not been released yet
///
/// Shared between the loop thread and remotes, so every access happens under
/// a lock. Never call user code or drop an [`Opaque`] while holding it.
#[derive(Default)]
pub(crate) struct Registry {
    handles: FxHashMap<HandleId, Handle>,
    /// Number of active, non-closing handles
    active: usize,
    /// Set once the loop is closed; no handle may be added afterwards
    pub closed: bool,
}

impl Registry {
    pub(crate) fn insert(&mut self, id: HandleId, handle: Handle) {
        if handle.active {
            self.active += 1;
        }
        self.handles.insert(id, handle);
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&Handle> {
        self.handles.get(&id)
    }

    pub(crate) fn get_mut(&mut self, id: HandleId) -> Option<&mut Handle> {
        self.handles.get_mut(&id)
    }

    /// Look up a handle of a given kind that is not closing
    pub(crate) fn open_mut(
        &mut self,
        id: HandleId,
        expected: HandleKind,
    ) -> Result<&mut Handle, crate::RuntimeError> {
        let handle = self
            .handles
            .get_mut(&id)
            .ok_or(crate::RuntimeError::InvalidHandle(id))?;
        if handle.kind != expected {
            return Err(crate::RuntimeError::WrongHandleKind { id, expected });
        }
        if handle.closing {
            return Err(crate::RuntimeError::AlreadyClosing(id));
        }
        Ok(handle)
    }

    /// Flip a handle's active flag, keeping the active count in sync
    pub(crate) fn set_active(&mut self, id: HandleId, active: bool) {
        if let Some(handle) = self.handles.get_mut(&id) {
            if handle.active != active {
                handle.active = active;
                if active {
                    self.active += 1;
                } else {
                    self.active -= 1;
                }
            }
        }
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Option<Handle> {
        let handle = self.handles.remove(&id)?;
        if handle.active {
            self.active -= 1;
        }
        Some(handle)
    }

    /// Take every handle out, leaving the registry empty
    pub(crate) fn drain(&mut self) -> FxHashMap<HandleId, Handle> {
        self.active = 0;
        std::mem::take(&mut self.handles)
    }

    pub(crate) fn active_count(&self) -> usize {
        self.active
    }

    pub(crate) fn len(&self) -> usize {
        self.handles.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_timer_data() -> Opaque {
        Box::new(())
    }

    #[test]
    fn test_handle_ids_are_unique() {
        let a = HandleId::next();
        let b = HandleId::next();
        assert_ne!(a, b);
        assert!(b > a);
        assert_eq!(format!("{}", a), format!("#{}", a.as_u64()));
    }

    #[test]
    fn test_registry_active_count_tracks_transitions() {
        let mut registry = Registry::default();
        let id = HandleId::next();
        registry.insert(id, Handle::timer(noop_timer_data()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.active_count(), 0);

        registry.set_active(id, true);
        registry.set_active(id, true);
        assert_eq!(registry.active_count(), 1);

        registry.set_active(id, false);
        assert_eq!(registry.active_count(), 0);

        registry.set_active(id, true);
        let removed = registry.remove(id);
        assert!(removed.is_some());
        assert_eq!(registry.active_count(), 0);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_registry_open_mut_checks_kind_and_closing() {
        let mut registry = Registry::default();
        let id = HandleId::next();
        registry.insert(id, Handle::timer(noop_timer_data()));

        assert!(registry.open_mut(id, HandleKind::Timer).is_ok());
        assert!(matches!(
            registry.open_mut(id, HandleKind::Async),
            Err(crate::RuntimeError::WrongHandleKind { .. })
        ));

        if let Some(handle) = registry.get_mut(id) {
            handle.closing = true;
        }
        assert!(matches!(
            registry.open_mut(id, HandleKind::Timer),
            Err(crate::RuntimeError::AlreadyClosing(_))
        ));

        let missing = HandleId::next();
        assert!(matches!(
            registry.open_mut(missing, HandleKind::Timer),
            Err(crate::RuntimeError::InvalidHandle(_))
        ));
    }

    #[test]
    fn test_work_status_is_completed() {
        assert!(WorkStatus::Completed.is_completed());
        assert!(!WorkStatus::Cancelled.is_completed());
        assert!(!WorkStatus::Panicked("boom".to_string()).is_completed());
    }
}
