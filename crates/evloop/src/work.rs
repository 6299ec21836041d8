//! Work scheduler: run a closure on the thread pool, get its value back on
//! the loop thread.

use crate::callback::WorkBox;
use crate::error::WorkError;
use crate::event_loop::EventLoop;
use evloop_runtime::{HandleId, Loop, Opaque, RuntimeResult, WorkStatus};

/// Identifies a submitted work request, for [`EventLoop::cancel_work`]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct WorkHandle {
    id: HandleId,
}

impl WorkHandle {
    /// The request's handle id
    pub fn id(&self) -> HandleId {
        self.id
    }
}

impl EventLoop {
    /// Run `work` on a worker thread. Nothing runs on the loop thread
    /// afterwards; a panic in `work` is logged.
    pub fn queue_work<W>(&mut self, work: W) -> WorkHandle
    where
        W: FnOnce() + Send + 'static,
    {
        self.submit_work(WorkBox::<()>::new(Box::new(work), None, None))
    }

    /// Run `work` on a worker thread, then `after` on the loop thread with
    /// the value `work` returned. If `work` is cancelled or panics, `after`
    /// is skipped and the failure is logged.
    pub fn queue_work_then<T, W, A>(&mut self, work: W, after: A) -> WorkHandle
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
    {
        self.submit_work(WorkBox::new(Box::new(work), Some(Box::new(after)), None))
    }

    /// Like [`queue_work_then`](Self::queue_work_then), with `on_error`
    /// called on the loop thread instead of `after` when `work` was
    /// cancelled or panicked. Exactly one of the two runs.
    pub fn queue_work_or_else<T, W, A, E>(&mut self, work: W, after: A, on_error: E) -> WorkHandle
    where
        T: Send + 'static,
        W: FnOnce() -> T + Send + 'static,
        A: FnOnce(T) + Send + 'static,
        E: FnOnce(WorkError) + Send + 'static,
    {
        self.submit_work(WorkBox::new(
            Box::new(work),
            Some(Box::new(after)),
            Some(Box::new(on_error)),
        ))
    }

    /// Cancel a request no worker has started yet. Its error path runs with
    /// [`WorkError::Cancelled`] on a later loop iteration.
    pub fn cancel_work(&mut self, handle: &WorkHandle) -> RuntimeResult<()> {
        self.inner.cancel_work(handle.id)
    }

    fn submit_work<T: Send + 'static>(&mut self, work: WorkBox<T>) -> WorkHandle {
        let id = self
            .inner
            .queue_work(work.into_opaque(), run_work::<T>, after_work::<T>);
        WorkHandle { id }
    }
}

/// Worker thread trampoline
fn run_work<T: Send + 'static>(data: &mut Opaque) {
    if let Some(work) = data.downcast_mut::<WorkBox<T>>() {
        work.run();
    }
}

/// Loop thread trampoline; the box is dropped when this returns
fn after_work<T: Send + 'static>(_lp: &mut Loop, id: HandleId, data: Opaque, status: WorkStatus) {
    match data.downcast::<WorkBox<T>>() {
        Ok(work) => {
            if let Err(err) = work.complete(status) {
                tracing::warn!(%id, error = %err, "work failed without an error callback");
            }
        }
        Err(_) => tracing::error!(%id, "work completion carried foreign state"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evloop_runtime::{LoopConfig, RunMode};
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn small_loop(threads: usize) -> EventLoop {
        EventLoop::with_config(&LoopConfig::default().with_threadpool_size(threads)).unwrap()
    }

    #[test]
    fn test_queue_work_runs_off_loop_thread() {
        let mut lp = small_loop(2);
        let loop_thread = thread::current().id();
        let worker_thread = Arc::new(Mutex::new(None));
        let w = worker_thread.clone();

        lp.queue_work(move || {
            *w.lock() = Some(thread::current().id());
        });
        assert!(!lp.run(RunMode::Default));

        let seen = worker_thread.lock().take();
        assert!(seen.is_some());
        assert_ne!(seen, Some(loop_thread));
        lp.close().unwrap();
    }

    #[test]
    fn test_queue_work_then_delivers_value_on_loop_thread() {
        let mut lp = small_loop(2);
        let loop_thread = thread::current().id();
        let delivered = Arc::new(Mutex::new(None));
        let d = delivered.clone();

        lp.queue_work_then(
            || String::from("computed"),
            move |value: String| {
                assert_eq!(thread::current().id(), loop_thread);
                *d.lock() = Some(value);
            },
        );
        lp.run(RunMode::Default);
        assert_eq!(delivered.lock().as_deref(), Some("computed"));
        lp.close().unwrap();
    }

    #[test]
    fn test_unit_work_then_runs_after() {
        let mut lp = small_loop(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2) = (order.clone(), order.clone());

        lp.queue_work_then(move || o1.lock().push("work"), move |()| o2.lock().push("after"));
        lp.run(RunMode::Default);
        assert_eq!(*order.lock(), vec!["work", "after"]);
        lp.close().unwrap();
    }

    #[test]
    fn test_panicking_work_takes_error_path() {
        let mut lp = small_loop(1);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let afters = Arc::new(AtomicUsize::new(0));
        let (e, a) = (errors.clone(), afters.clone());

        lp.queue_work_or_else(
            || -> u32 { panic!("no value today") },
            move |_| {
                a.fetch_add(1, Ordering::SeqCst);
            },
            move |err| e.lock().push(err),
        );
        lp.run(RunMode::Default);

        assert_eq!(afters.load(Ordering::SeqCst), 0);
        assert_eq!(*errors.lock(), vec![WorkError::Panicked("no value today".to_string())]);
        lp.close().unwrap();
    }

    #[test]
    fn test_cancel_queued_work() {
        let mut lp = small_loop(1);
        let outcomes = Arc::new(Mutex::new(Vec::new()));
        let (o1, o2, o3) = (outcomes.clone(), outcomes.clone(), outcomes.clone());
        let ran = Arc::new(AtomicUsize::new(0));
        let r = ran.clone();

        // Keep the single worker busy so the second request stays queued.
        lp.queue_work_then(
            || thread::sleep(Duration::from_millis(50)),
            move |()| o1.lock().push("blocker done"),
        );
        let queued = lp.queue_work_or_else(
            move || {
                r.fetch_add(1, Ordering::SeqCst);
            },
            move |()| o2.lock().push("queued done"),
            move |err| {
                assert_eq!(err, WorkError::Cancelled);
                o3.lock().push("queued cancelled");
            },
        );
        lp.cancel_work(&queued).unwrap();
        assert!(lp.cancel_work(&queued).is_err());

        lp.run(RunMode::Default);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(*outcomes.lock(), vec!["blocker done", "queued cancelled"]);
        assert!(lp.cancel_work(&queued).is_err());
        lp.close().unwrap();
    }
}
