//! Worker thread pool for blocking work.
//!
//! Workers pull jobs from a shared unbounded channel, run them, and post the
//! job's state back to the loop thread as an [`Event::WorkDone`]. A job that
//! was cancelled while still queued is returned untouched with
//! [`WorkStatus::Cancelled`].

use crate::config::LoopConfig;
use crate::event_loop::Event;
use crate::handle::{HandleId, Opaque, WorkFn, WorkStatus, WORK_CANCELLED, WORK_QUEUED, WORK_RUNNING};
use crate::RuntimeError;
use crossbeam::channel::{self, Receiver, Sender};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Work sent from the loop to a worker
pub(crate) struct WorkJob {
    pub id: HandleId,
    pub data: Opaque,
    pub work: WorkFn,
    pub state: Arc<AtomicU8>,
}

/// Fixed-size pool of worker threads
pub(crate) struct ThreadPool {
    job_tx: Option<Sender<WorkJob>>,
    handles: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `config.effective_threadpool_size()` workers posting to `done_tx`
    pub(crate) fn spawn(config: &LoopConfig, done_tx: &Sender<Event>) -> Result<Self, RuntimeError> {
        let size = config.effective_threadpool_size();
        let (job_tx, job_rx) = channel::unbounded::<WorkJob>();
        let mut pool = Self {
            job_tx: Some(job_tx),
            handles: Vec::with_capacity(size),
        };

        for i in 0..size {
            let rx = job_rx.clone();
            let tx = done_tx.clone();
            // On error the partially built pool is dropped, which stops the
            // workers spawned so far.
            let handle = thread::Builder::new()
                .name(format!("{}-{}", config.thread_name, i))
                .spawn(move || worker_loop(rx, tx))?;
            pool.handles.push(handle);
        }

        tracing::debug!(threads = size, "thread pool started");
        Ok(pool)
    }

    /// Queue a job. Hands the job back if the pool is shut down.
    pub(crate) fn submit(&self, job: WorkJob) -> Result<(), WorkJob> {
        match &self.job_tx {
            Some(tx) => tx.send(job).map_err(|err| err.into_inner()),
            None => Err(job),
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.handles.len()
    }

    /// Stop accepting jobs and join the workers
    pub(crate) fn shutdown(&mut self) {
        if self.job_tx.take().is_none() {
            return;
        }

        let timeout = Duration::from_secs(2);
        for handle in self.handles.drain(..) {
            join_with_timeout(handle, timeout);
        }
        tracing::debug!("thread pool stopped");
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(job_rx: Receiver<WorkJob>, done_tx: Sender<Event>) {
    while let Ok(mut job) = job_rx.recv() {
        let status = if job
            .state
            .compare_exchange(WORK_QUEUED, WORK_RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let work = job.work;
            match panic::catch_unwind(AssertUnwindSafe(|| work(&mut job.data))) {
                Ok(()) => WorkStatus::Completed,
                Err(payload) => {
                    let message = panic_message(payload.as_ref());
                    tracing::warn!(id = %job.id, panic = %message, "work function panicked");
                    WorkStatus::Panicked(message)
                }
            }
        } else {
            debug_assert_eq!(job.state.load(Ordering::Acquire), WORK_CANCELLED);
            WorkStatus::Cancelled
        };

        let done = Event::WorkDone {
            id: job.id,
            data: job.data,
            status,
        };
        if done_tx.send(done).is_err() {
            break;
        }
    }
}

/// Join a thread with timeout, detach if stuck.
fn join_with_timeout(handle: JoinHandle<()>, timeout: Duration) {
    let start = Instant::now();
    loop {
        if handle.is_finished() {
            let _ = handle.join();
            return;
        }
        if start.elapsed() > timeout {
            tracing::warn!(
                thread = handle.thread().name().unwrap_or("<unnamed>"),
                "worker did not stop in time, detaching"
            );
            drop(handle);
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
}

/// Extract a readable message from a panic payload
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(work: WorkFn, data: Opaque) -> (WorkJob, Arc<AtomicU8>) {
        let state = Arc::new(AtomicU8::new(WORK_QUEUED));
        let job = WorkJob {
            id: HandleId::next(),
            data,
            work,
            state: state.clone(),
        };
        (job, state)
    }

    fn double(data: &mut Opaque) {
        if let Some(value) = data.downcast_mut::<u64>() {
            *value *= 2;
        }
    }

    fn explode(_data: &mut Opaque) {
        panic!("worker exploded");
    }

    fn recv_done(rx: &Receiver<Event>) -> (Opaque, WorkStatus) {
        match rx.recv_timeout(Duration::from_secs(5)) {
            Ok(Event::WorkDone { data, status, .. }) => (data, status),
            Ok(_) => panic!("unexpected event"),
            Err(err) => panic!("no completion: {}", err),
        }
    }

    #[test]
    fn test_pool_runs_job() {
        let (tx, rx) = channel::unbounded();
        let mut pool = ThreadPool::spawn(&LoopConfig::default().with_threadpool_size(2), &tx).unwrap();
        assert_eq!(pool.size(), 2);

        let (job, state) = job(double, Box::new(21u64));
        assert!(pool.submit(job).is_ok());

        let (data, status) = recv_done(&rx);
        assert_eq!(status, WorkStatus::Completed);
        assert_eq!(*data.downcast::<u64>().unwrap(), 42);
        assert_eq!(state.load(Ordering::Acquire), WORK_RUNNING);

        pool.shutdown();
    }

    #[test]
    fn test_pool_skips_cancelled_job() {
        let (tx, rx) = channel::unbounded();
        let pool = ThreadPool::spawn(&LoopConfig::default().with_threadpool_size(1), &tx).unwrap();

        let (job, state) = job(double, Box::new(5u64));
        state.store(WORK_CANCELLED, Ordering::Release);
        assert!(pool.submit(job).is_ok());

        let (data, status) = recv_done(&rx);
        assert_eq!(status, WorkStatus::Cancelled);
        assert_eq!(*data.downcast::<u64>().unwrap(), 5);
    }

    #[test]
    fn test_pool_reports_panics_and_keeps_working() {
        let (tx, rx) = channel::unbounded();
        let pool = ThreadPool::spawn(&LoopConfig::default().with_threadpool_size(1), &tx).unwrap();

        let (bad, _) = job(explode, Box::new(()));
        assert!(pool.submit(bad).is_ok());
        let (_, status) = recv_done(&rx);
        assert_eq!(status, WorkStatus::Panicked("worker exploded".to_string()));

        let (good, _) = job(double, Box::new(1u64));
        assert!(pool.submit(good).is_ok());
        let (_, status) = recv_done(&rx);
        assert_eq!(status, WorkStatus::Completed);
    }

    #[test]
    fn test_pool_rejects_after_shutdown() {
        let (tx, _rx) = channel::unbounded();
        let mut pool = ThreadPool::spawn(&LoopConfig::default().with_threadpool_size(1), &tx).unwrap();
        pool.shutdown();
        assert_eq!(pool.size(), 0);

        let (job, _) = job(double, Box::new(1u64));
        assert!(pool.submit(job).is_err());
    }

    #[test]
    fn test_panic_message_variants() {
        let boxed: Box<dyn Any + Send> = Box::new("static");
        assert_eq!(panic_message(boxed.as_ref()), "static");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "unknown panic payload");
    }
}
