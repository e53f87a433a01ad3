//! A work-stealing worker pool with serialization domains ("warps"), a DAG
//! task dispatcher, and an async task layer whose awaitables move tasks
//! between warps.
//!
//! The [`WorkerPool`] owns the threads and the priority-banded task stacks.
//! A [`Warp`] multiplexes a single-writer stream of tasks over those shared
//! workers: at most one worker drains a given warp at a time, so everything
//! posted to one warp can touch shared state without further locking. The
//! [`Dispatcher`] runs graphs of routines, honoring both the edges declared
//! with [`Dispatcher::order`] and each routine's target warp. The [`co`]
//! module builds async tasks on top: awaitables like [`co::switch`],
//! [`co::Event`] and [`co::Pipe`] suspend a task and resume it by posting
//! its continuation to the right warp — never by running it inline on the
//! notifier's thread.
//!
//! ```
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! let mut pool = weft::WorkerPool::new(2);
//! pool.start();
//! let handle = pool.handle();
//!
//! // tasks posted to one warp never run concurrently with each other
//! let warp = weft::Warp::strand(handle.clone(), 0);
//! let counter = Arc::new(AtomicUsize::new(0));
//! for _ in 0..100 {
//!     let counter = Arc::clone(&counter);
//!     warp.post(move || {
//!         counter.fetch_add(1, Ordering::Relaxed);
//!     });
//! }
//!
//! // an async task can hop between warps and carry values
//! let value = weft::co::AsyncTask::new(&handle, async { 6 * 7 }).join();
//! assert_eq!(value, 42);
//!
//! // drain the warp before tearing the pool down
//! let poller = handle.clone();
//! warp.join(|| {
//!     poller.poll(usize::MAX);
//! });
//! assert_eq!(counter.load(Ordering::Relaxed), 100);
//!
//! pool.terminate();
//! pool.join();
//! ```
//!
//! Two warp storage modes are provided. A *strand* ([`Warp::strand`]) keeps
//! one atomic queue and preserves global submission order. A *grid*
//! ([`Warp::grid`]) keeps one ring per pool thread for cheaper submission,
//! preserves per-producer order, and offers [`Warp::queue_barrier`] as a
//! cross-producer fence.
//!
//! Unsafe code is confined to the intrusive task lists in `task.rs`; the
//! scheduler layers above are written against their safe interface.

// https://github.com/rust-lang/rfcs/blob/master/text/2585-unsafe-block-in-unsafe-fn.md
#![deny(unsafe_op_in_unsafe_fn)]

pub mod co;
pub mod dispatch;
pub mod pool;
pub mod warp;

mod task;

pub use dispatch::{Dispatcher, Routine, RoutineError};
pub use pool::{current_worker_index, PoolHandle, WorkerPool};
pub use warp::Warp;
