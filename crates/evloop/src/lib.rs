//! evloop
//!
//! Closure-based scheduling on top of [`evloop_runtime`]. An [`EventLoop`]
//! owns one runtime loop and offers four primitives:
//!
//! - [`EventLoop::queue_work_then`] (and friends): run a closure on the
//!   thread pool, receive its value on the loop thread
//! - [`EventLoop::async_send`] / [`Notifier::send`]: run a closure on the
//!   loop thread, requested from any thread
//! - [`EventLoop::set_timeout`]: run a closure once after a delay
//! - [`EventLoop::set_interval`]: run a closure periodically until cancelled
//!
//! Every callback except the work closure itself runs on the thread that
//! calls [`EventLoop::run`].
//!
//! ```ignore
//! let mut lp = EventLoop::new()?;
//! lp.queue_work_then(|| expensive(), |value| println!("{value}"));
//! lp.set_timeout(10, || println!("later"));
//! lp.run(RunMode::Default);
//! lp.close()?;
//! ```

#![warn(missing_docs)]

mod callback;
mod error;
mod event_loop;
mod notify;
mod timer;
mod work;

pub use error::{CloseError, WorkError};
pub use event_loop::EventLoop;
pub use notify::Notifier;
pub use timer::TimerHandle;
pub use work::WorkHandle;

pub use evloop_runtime::{HandleId, LoopConfig, RunMode, RuntimeError, RuntimeResult};
