//! The event loop
//!
//! One thread owns a [`Loop`] and drives it with [`Loop::run`]. Each
//! iteration runs, in order:
//!
//! 1. expired timers,
//! 2. the poll phase: block (bounded by the next timer) for wake events,
//!    which are async signals and thread pool completions,
//! 3. close callbacks of handles closed since the last iteration.
//!
//! Callbacks receive `&mut Loop`, so they can start, stop and close handles
//! themselves. A callback's state is taken out of the registry while it runs
//! and put back afterwards; nothing else can observe it in between.

use crate::config::LoopConfig;
use crate::handle::{
    AfterWorkFn, AsyncFn, CloseFn, Handle, HandleId, HandleInner, HandleKind, Opaque, TimerFn,
    WorkFn, WorkStatus, WORK_CANCELLED, WORK_QUEUED,
};
use crate::pool::{ThreadPool, WorkJob};
use crate::remote::{AsyncHandle, Remote, Shared};
use crate::timer::TimerHeap;
use crate::{RuntimeError, RuntimeResult};
use crossbeam::channel::{self, Receiver, RecvTimeoutError, TryRecvError};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Upper bound on wake events handled in one poll phase, so timers and close
/// callbacks are not starved by a flood of signals
const MAX_EVENTS_PER_POLL: usize = 1024;

/// Message posted to the loop thread
pub(crate) enum Event {
    /// An async handle was signalled
    Async(HandleId),
    /// A work request left the thread pool
    WorkDone {
        id: HandleId,
        data: Opaque,
        status: WorkStatus,
    },
}

/// How long [`Loop::run`] keeps going
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Run until no active handles remain (or `stop` is called)
    #[default]
    Default,
    /// Run one iteration, blocking for events if there is pending work
    Once,
    /// Run one iteration without blocking
    NoWait,
}

/// A single-threaded event loop with a worker pool
pub struct Loop {
    shared: Arc<Shared>,
    event_rx: Receiver<Event>,
    pool: ThreadPool,
    timers: TimerHeap,
    /// Handles waiting for their close callback
    closing: VecDeque<HandleId>,
    /// Loop start; `time` is measured from here
    epoch: Instant,
    /// Cached loop time in ms
    time: u64,
    stop_flag: bool,
    closed: bool,
}

impl Loop {
    /// Create a loop and start its thread pool
    pub fn new(config: &LoopConfig) -> RuntimeResult<Self> {
        let (event_tx, event_rx) = channel::unbounded::<Event>();
        let pool = ThreadPool::spawn(config, &event_tx)?;
        let shared = Arc::new(Shared::new(event_tx));

        tracing::debug!(threads = pool.size(), "event loop created");
        Ok(Self {
            shared,
            event_rx,
            pool,
            timers: TimerHeap::default(),
            closing: VecDeque::new(),
            epoch: Instant::now(),
            time: 0,
            stop_flag: false,
            closed: false,
        })
    }

    /// Thread-safe handle for registering and signalling async handles
    pub fn remote(&self) -> Remote {
        Remote {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of worker threads
    pub fn threadpool_size(&self) -> usize {
        self.pool.size()
    }

    // ========================================================================
    // Running
    // ========================================================================

    /// Drive the loop. Returns `true` if active handles remain.
    pub fn run(&mut self, mode: RunMode) -> bool {
        let mut alive = self.alive();
        if !alive {
            self.update_time();
        }

        while alive && !self.stop_flag {
            self.update_time();
            self.run_timers();

            let timeout = match mode {
                RunMode::NoWait => Some(Duration::ZERO),
                RunMode::Once | RunMode::Default => self.poll_timeout(),
            };
            self.poll(timeout);

            if mode == RunMode::Once {
                // Timers that became due while blocked in poll
                self.update_time();
                self.run_timers();
            }

            self.run_closing_handles();
            alive = self.alive();

            if mode != RunMode::Default {
                break;
            }
        }

        self.stop_flag = false;
        alive
    }

    /// Make `run` return after the current iteration
    pub fn stop(&mut self) {
        self.stop_flag = true;
    }

    /// Whether active handles or pending close callbacks remain
    pub fn alive(&self) -> bool {
        self.active_count() > 0 || !self.closing.is_empty()
    }

    /// Number of handles keeping the loop alive
    pub fn active_count(&self) -> usize {
        self.shared.registry.lock().active_count()
    }

    /// Number of handles not released yet, active or not
    pub fn handle_count(&self) -> usize {
        self.shared.registry.lock().len()
    }

    /// Cached loop time in milliseconds, updated at the start of each iteration
    pub fn now(&self) -> u64 {
        self.time
    }

    /// Refresh the cached loop time
    pub fn update_time(&mut self) {
        self.time = self.epoch.elapsed().as_millis() as u64;
    }

    /// Release the loop. Fails with [`RuntimeError::Busy`] while any handle
    /// is still open; the loop stays usable in that case.
    pub fn close(&mut self) -> RuntimeResult<()> {
        if self.closed {
            return Ok(());
        }
        {
            let mut registry = self.shared.registry.lock();
            if !registry.is_empty() {
                return Err(RuntimeError::Busy {
                    handles: registry.len(),
                });
            }
            registry.closed = true;
        }
        self.pool.shutdown();
        self.closed = true;
        tracing::debug!("event loop closed");
        Ok(())
    }

    /// Whether `close` succeeded
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn poll_timeout(&mut self) -> Option<Duration> {
        if self.stop_flag || !self.alive() || !self.closing.is_empty() {
            return Some(Duration::ZERO);
        }
        let registry = self.shared.registry.lock();
        let next_due = self.timers.next_due(|entry| {
            registry
                .get(entry.id)
                .and_then(|handle| handle.timer_state().map(|t| handle.active && t.seq == entry.seq))
                .unwrap_or(false)
        });
        drop(registry);
        next_due.map(|due| Duration::from_millis(due.saturating_sub(self.time)))
    }

    fn poll(&mut self, timeout: Option<Duration>) {
        let first = match timeout {
            None => self.event_rx.recv().ok(),
            Some(timeout) if timeout.is_zero() => match self.event_rx.try_recv() {
                Ok(event) => Some(event),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
            },
            Some(timeout) => match self.event_rx.recv_timeout(timeout) {
                Ok(event) => Some(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
            },
        };

        let Some(first) = first else {
            return;
        };
        self.dispatch(first);

        for _ in 1..MAX_EVENTS_PER_POLL {
            match self.event_rx.try_recv() {
                Ok(event) => self.dispatch(event),
                Err(_) => break,
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        match event {
            Event::Async(id) => self.run_async(id),
            Event::WorkDone { id, data, status } => self.finish_work(id, data, status),
        }
    }

    // ========================================================================
    // Work requests
    // ========================================================================

    /// Run `work` on a worker thread, then `after` on the loop thread. The
    /// request keeps the loop alive until `after` has run.
    pub fn queue_work(&mut self, data: Opaque, work: WorkFn, after: AfterWorkFn) -> HandleId {
        let id = HandleId::next();
        let state = Arc::new(AtomicU8::new(WORK_QUEUED));
        self.shared
            .registry
            .lock()
            .insert(id, Handle::work(after, Arc::clone(&state)));

        let job = WorkJob {
            id,
            data,
            work,
            state,
        };
        if let Err(job) = self.pool.submit(job) {
            // Pool already shut down; complete as cancelled. The loop owns
            // the receiving end, so this send cannot fail.
            job.state.store(WORK_CANCELLED, Ordering::Release);
            let _ = self.shared.event_tx.send(Event::WorkDone {
                id,
                data: job.data,
                status: WorkStatus::Cancelled,
            });
        }
        tracing::trace!(%id, "work queued");
        id
    }

    /// Cancel a work request that no worker has picked up yet. Its `after`
    /// callback still runs, with [`WorkStatus::Cancelled`].
    pub fn cancel_work(&mut self, id: HandleId) -> RuntimeResult<()> {
        let mut registry = self.shared.registry.lock();
        let handle = registry.get_mut(id).ok_or(RuntimeError::InvalidHandle(id))?;
        let HandleInner::Work { state, .. } = &handle.inner else {
            return Err(RuntimeError::WrongHandleKind {
                id,
                expected: HandleKind::Work,
            });
        };
        state
            .compare_exchange(WORK_QUEUED, WORK_CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RuntimeError::NotCancellable(id))?;
        tracing::trace!(%id, "work cancelled");
        Ok(())
    }

    fn finish_work(&mut self, id: HandleId, data: Opaque, status: WorkStatus) {
        let handle = self.shared.registry.lock().remove(id);
        match handle.map(|h| h.inner) {
            Some(HandleInner::Work { after, .. }) => after(self, id, data, status),
            _ => tracing::warn!(%id, "completion for unknown work request dropped"),
        }
    }

    // ========================================================================
    // Async handles
    // ========================================================================

    /// Register an async handle from the loop thread
    pub fn async_init(&mut self, data: Opaque, cb: AsyncFn) -> RuntimeResult<AsyncHandle> {
        self.shared.async_init(data, cb)
    }

    fn run_async(&mut self, id: HandleId) {
        let taken = {
            let mut registry = self.shared.registry.lock();
            match registry.get_mut(id) {
                Some(handle) if !handle.closing => match &handle.inner {
                    HandleInner::Async { cb, pending } => {
                        pending.store(false, Ordering::Release);
                        let cb: AsyncFn = *cb;
                        handle.data.take().map(|data| (cb, data))
                    }
                    _ => None,
                },
                _ => None,
            }
        };

        match taken {
            Some((cb, data)) => {
                if let Err(payload) = self.run_callback(id, cb, data) {
                    panic::resume_unwind(payload);
                }
            }
            None => tracing::trace!(%id, "signal for closed async handle ignored"),
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Register a stopped timer
    pub fn timer_init(&mut self, data: Opaque) -> HandleId {
        let id = HandleId::next();
        self.shared.registry.lock().insert(id, Handle::timer(data));
        id
    }

    /// Register and start a timer in one step
    pub fn timer_start_new(&mut self, data: Opaque, cb: TimerFn, timeout: u64, repeat: u64) -> HandleId {
        let id = HandleId::next();
        let mut handle = Handle::timer(data);
        let due = self.time.saturating_add(timeout);
        let seq = self.timers.schedule(id, due);
        if let Some(timer) = handle.timer_state_mut() {
            timer.cb = Some(cb);
            timer.due = due;
            timer.repeat = repeat;
            timer.seq = seq;
        }
        handle.active = true;
        self.shared.registry.lock().insert(id, handle);
        tracing::trace!(%id, timeout, repeat, "timer started");
        id
    }

    /// Start (or restart) a timer: fire after `timeout` ms, then every
    /// `repeat` ms unless `repeat` is 0
    pub fn timer_start(&mut self, id: HandleId, cb: TimerFn, timeout: u64, repeat: u64) -> RuntimeResult<()> {
        let due = self.time.saturating_add(timeout);
        let mut registry = self.shared.registry.lock();
        let handle = registry.open_mut(id, HandleKind::Timer)?;
        let seq = self.timers.schedule(id, due);
        if let Some(timer) = handle.timer_state_mut() {
            timer.cb = Some(cb);
            timer.due = due;
            timer.repeat = repeat;
            timer.seq = seq;
        }
        registry.set_active(id, true);
        tracing::trace!(%id, timeout, repeat, "timer started");
        Ok(())
    }

    /// Stop a timer. Stopping an inactive timer is a no-op.
    pub fn timer_stop(&mut self, id: HandleId) -> RuntimeResult<()> {
        let mut registry = self.shared.registry.lock();
        let handle = registry.get_mut(id).ok_or(RuntimeError::InvalidHandle(id))?;
        if handle.kind != HandleKind::Timer {
            return Err(RuntimeError::WrongHandleKind {
                id,
                expected: HandleKind::Timer,
            });
        }
        registry.set_active(id, false);
        Ok(())
    }

    /// Restart a repeating timer with its repeat period as the timeout.
    /// A timer whose repeat is 0 is just stopped.
    pub fn timer_again(&mut self, id: HandleId) -> RuntimeResult<()> {
        let (cb, repeat) = {
            let mut registry = self.shared.registry.lock();
            let handle = registry.open_mut(id, HandleKind::Timer)?;
            let timer = handle.timer_state().ok_or(RuntimeError::WrongHandleKind {
                id,
                expected: HandleKind::Timer,
            })?;
            (timer.cb.ok_or(RuntimeError::NotStarted(id))?, timer.repeat)
        };
        if repeat == 0 {
            return self.timer_stop(id);
        }
        self.timer_start(id, cb, repeat, repeat)
    }

    /// Change the repeat period; takes effect at the next expiry
    pub fn timer_set_repeat(&mut self, id: HandleId, repeat: u64) -> RuntimeResult<()> {
        let mut registry = self.shared.registry.lock();
        let handle = registry.open_mut(id, HandleKind::Timer)?;
        if let Some(timer) = handle.timer_state_mut() {
            timer.repeat = repeat;
        }
        Ok(())
    }

    /// Repeat period in ms
    pub fn timer_get_repeat(&self, id: HandleId) -> RuntimeResult<u64> {
        self.with_timer(id, |_, timer| timer.repeat)
    }

    /// Milliseconds until the timer fires, 0 if inactive or already due
    pub fn timer_due_in(&self, id: HandleId) -> RuntimeResult<u64> {
        let now = self.time;
        self.with_timer(id, |active, timer| {
            if active {
                timer.due.saturating_sub(now)
            } else {
                0
            }
        })
    }

    fn with_timer<R>(&self, id: HandleId, f: impl FnOnce(bool, &crate::handle::TimerState) -> R) -> RuntimeResult<R> {
        let registry = self.shared.registry.lock();
        let handle = registry.get(id).ok_or(RuntimeError::InvalidHandle(id))?;
        let timer = handle.timer_state().ok_or(RuntimeError::WrongHandleKind {
            id,
            expected: HandleKind::Timer,
        })?;
        Ok(f(handle.active, timer))
    }

    fn run_timers(&mut self) {
        let now = self.time;
        // Collected up front: timers started by these callbacks wait for the
        // next iteration even with a zero timeout.
        let mut expired = self.timers.pop_expired(now).into_iter();

        while let Some(entry) = expired.next() {
            let taken = {
                let mut registry = self.shared.registry.lock();
                let Some(handle) = registry.get_mut(entry.id) else {
                    continue;
                };
                if !handle.active || handle.closing {
                    continue;
                }
                let Some(timer) = handle.timer_state() else {
                    continue;
                };
                if timer.seq != entry.seq {
                    continue;
                }
                let (cb, repeat) = (timer.cb, timer.repeat);
                let data = handle.data.take();

                if repeat > 0 {
                    let due = now.saturating_add(repeat);
                    let seq = self.timers.schedule(entry.id, due);
                    if let Some(timer) = handle.timer_state_mut() {
                        timer.due = due;
                        timer.seq = seq;
                    }
                } else {
                    registry.set_active(entry.id, false);
                }
                cb.zip(data)
            };

            if let Some((cb, data)) = taken {
                if let Err(payload) = self.run_callback(entry.id, cb, data) {
                    // Expired timers behind the panicking one fire on the
                    // next `run`
                    self.timers.requeue(expired);
                    panic::resume_unwind(payload);
                }
            }
        }
    }

    // ========================================================================
    // Closing
    // ========================================================================

    /// Close a timer or async handle. The handle stops at once; `close_cb`
    /// runs with the handle's state at the end of the current iteration.
    pub fn close_handle(&mut self, id: HandleId, close_cb: Option<CloseFn>) -> RuntimeResult<()> {
        {
            let mut registry = self.shared.registry.lock();
            let handle = registry.get_mut(id).ok_or(RuntimeError::InvalidHandle(id))?;
            if handle.kind == HandleKind::Work {
                return Err(RuntimeError::NotClosable(id));
            }
            if handle.closing {
                return Err(RuntimeError::AlreadyClosing(id));
            }
            handle.closing = true;
            handle.close_cb = close_cb;
            registry.set_active(id, false);
        }
        self.closing.push_back(id);
        tracing::trace!(%id, "handle closing");
        Ok(())
    }

    /// Whether the handle is active
    pub fn is_active(&self, id: HandleId) -> bool {
        self.shared
            .registry
            .lock()
            .get(id)
            .map(|handle| handle.active)
            .unwrap_or(false)
    }

    /// Whether `close` was called on the handle and it has not been released yet
    pub fn is_closing(&self, id: HandleId) -> bool {
        self.shared
            .registry
            .lock()
            .get(id)
            .map(|handle| handle.closing)
            .unwrap_or(false)
    }

    fn run_closing_handles(&mut self) {
        // Handles closed by these callbacks are released next iteration
        let batch: Vec<HandleId> = self.closing.drain(..).collect();
        for id in batch {
            let Some(handle) = self.shared.registry.lock().remove(id) else {
                continue;
            };
            tracing::trace!(%id, kind = %handle.kind, "handle released");
            match (handle.close_cb, handle.data) {
                (Some(close_cb), Some(data)) => close_cb(self, id, data),
                (_, data) => drop(data),
            }
        }
    }

    /// Lend `data` to a timer or async callback. The state goes back into the
    /// registry even if the callback panics; the panic is handed to the
    /// caller to resume once the loop is consistent again.
    fn run_callback(
        &mut self,
        id: HandleId,
        cb: fn(&mut Loop, HandleId, &mut Opaque),
        mut data: Opaque,
    ) -> std::thread::Result<()> {
        let result = panic::catch_unwind(AssertUnwindSafe(|| cb(self, id, &mut data)));
        self.restore_data(id, data);
        result
    }

    /// Put a callback's state back after the callback returned
    fn restore_data(&mut self, id: HandleId, data: Opaque) {
        let mut registry = self.shared.registry.lock();
        match registry.get_mut(id) {
            Some(handle) => handle.data = Some(data),
            None => {
                drop(registry);
                drop(data);
            }
        }
    }
}

impl fmt::Debug for Loop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Loop")
            .field("time", &self.time)
            .field("handles", &self.handle_count())
            .field("active", &self.active_count())
            .field("threadpool_size", &self.pool.size())
            .field("closed", &self.closed)
            .finish()
    }
}

impl Drop for Loop {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Dropped without a successful close: release whatever is left.
        let leftover = {
            let mut registry = self.shared.registry.lock();
            registry.closed = true;
            registry.drain()
        };
        if !leftover.is_empty() {
            tracing::debug!(handles = leftover.len(), "dropping loop with open handles");
        }
        drop(leftover);
        self.pool.shutdown();
    }
}
