//! evloop runtime
//!
//! A small single-threaded event loop in the shape of libuv: one thread owns
//! a [`Loop`] and drives it with [`Loop::run`], a fixed worker pool runs
//! blocking work, async handles wake the loop from other threads, and timers
//! fire against the loop's millisecond clock.
//!
//! The runtime never looks inside caller state. Each handle carries an
//! [`Opaque`] value plus plain `fn` callbacks; the value is moved into the
//! loop when the handle is created and moved back out to the completion or
//! close callback, which decides when it is dropped.

#![warn(missing_docs)]

mod config;
mod error;
mod event_loop;
mod handle;
mod pool;
mod remote;
mod timer;

pub use config::{LoopConfig, DEFAULT_THREADPOOL_SIZE, MAX_THREADPOOL_SIZE, THREADPOOL_SIZE_ENV};
pub use error::{RuntimeError, RuntimeResult};
pub use event_loop::{Loop, RunMode};
pub use handle::{
    AfterWorkFn, AsyncFn, CloseFn, HandleId, HandleKind, Opaque, TimerFn, WorkFn, WorkStatus,
};
pub use remote::{AsyncHandle, Remote};
