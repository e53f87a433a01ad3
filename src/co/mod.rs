//! Async tasks and awaitable primitives.
//!
//! An [`AsyncTask`] wraps a future and runs it cooperatively over the worker
//! pool. Every wake is dispatched as a posted task to the place the
//! continuation should run — the warp the task last suspended on, a warp an
//! awaitable explicitly switched it to, or the bare pool — never by resuming
//! inline from the waking thread, which would block whatever warp the waker
//! happens to be running on.
//!
//! The primitives in the submodules ([`switch`], [`select`], [`Event`],
//! [`Pipe`], [`Barrier`], [`Frame`], quota) are ordinary futures built on
//! that routing rule.

mod barrier;
mod dispatch;
mod event;
mod invoke;
mod pipe;
mod quota;
mod switch;

pub use barrier::{Barrier, Frame};
pub use dispatch::{await_routines, dispatch_task, AwaitRoutines};
pub use event::Event;
pub use invoke::{invoke_on, invoke_parallel, Invoke};
pub use pipe::Pipe;
pub use quota::{Quota, QuotaGuard, QuotaQueue};
pub use switch::{select, switch, switch_full, switch_pair, switch_parallel, Select, Switch};

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};

use atomic_refcell::AtomicRefCell;

use crate::pool::PoolHandle;
use crate::warp::Warp;

std::thread_local! {
    /// The task being polled on this thread, for awaitables that redirect
    /// their resumption.
    static CURRENT_TASK: RefCell<Option<Arc<dyn ErasedTask>>> = const { RefCell::new(None) };
}

/// Where a task's next poll should run.
#[derive(Clone)]
pub(crate) enum ResumeTarget {
    Pool(usize),
    Warp(Warp),
}

/// Type-erased view of a task core, used by `switch`/`select` to steer the
/// continuation onto another warp.
pub(crate) trait ErasedTask: Send + Sync {
    /// Override where the next poll runs.
    fn set_target(&self, target: ResumeTarget);
    /// Poll inline if the task is quiescent; otherwise leave a wake mark.
    /// Callers must be the sole resumer for the current suspension.
    fn resume_now(self: Arc<Self>);
    /// Dispatch the next poll to the recorded target.
    fn schedule(self: Arc<Self>);
}

pub(crate) fn current_task() -> Option<Arc<dyn ErasedTask>> {
    CURRENT_TASK.with(|t| t.borrow().clone())
}

const STATE_IDLE: u8 = 0;
const STATE_QUEUED: u8 = 1;
const STATE_POLLING: u8 = 2;
const STATE_POLLING_QUEUED: u8 = 3;
const STATE_DONE: u8 = 4;

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
type CompletionFn<T> = Box<dyn FnOnce(T) + Send + 'static>;

pub(crate) struct TaskCore<T: Send + 'static> {
    pool: PoolHandle,
    state: AtomicU8,
    target: Mutex<ResumeTarget>,
    future: AtomicRefCell<Option<BoxFuture<T>>>,
    result: AtomicRefCell<Option<T>>,
    completion: AtomicRefCell<Option<CompletionFn<T>>>,
}

// The `future`/`result`/`completion` cells are only ever borrowed by
// whichever single poll currently holds `STATE_POLLING` (or, for
// `completion`/`result`, before the task is started / once at completion),
// so concurrent aliasing never happens despite `T` and the boxed trait
// objects not being `Sync` on their own.
unsafe impl<T: Send + 'static> Sync for TaskCore<T> {}

impl<T: Send + 'static> TaskCore<T> {
    fn new(pool: PoolHandle, future: impl Future<Output = T> + Send + 'static) -> Arc<Self> {
        Arc::new(Self {
            pool,
            state: AtomicU8::new(STATE_IDLE),
            target: Mutex::new(ResumeTarget::Pool(0)),
            future: AtomicRefCell::new(Some(Box::pin(future))),
            result: AtomicRefCell::new(None),
            completion: AtomicRefCell::new(None),
        })
    }

    fn dispatch_to(self: Arc<Self>, target: ResumeTarget) {
        match target {
            ResumeTarget::Pool(priority) => {
                let pool = self.pool.clone();
                pool.submit(move || self.poll_task(), priority);
            }
            ResumeTarget::Warp(warp) => {
                warp.post(move || self.poll_task());
            }
        }
    }

    fn schedule_impl(self: Arc<Self>) {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            match state {
                STATE_IDLE => {
                    match self.state.compare_exchange(
                        STATE_IDLE,
                        STATE_QUEUED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => {
                            let target = self.target.lock().unwrap().clone();
                            self.dispatch_to(target);
                            return;
                        }
                        Err(current) => state = current,
                    }
                }
                STATE_POLLING => {
                    match self.state.compare_exchange(
                        STATE_POLLING,
                        STATE_POLLING_QUEUED,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(current) => state = current,
                    }
                }
                _ => return,
            }
        }
    }

    /// One poll of the wrapped future, on the calling thread.
    fn poll_task(self: Arc<Self>) {
        debug_assert_eq!(self.state.load(Ordering::Acquire), STATE_QUEUED);
        self.state.store(STATE_POLLING, Ordering::Release);

        // by default resume where we are now
        {
            let mut target = self.target.lock().unwrap();
            *target = match Warp::current() {
                Some(warp) => ResumeTarget::Warp(warp),
                None => ResumeTarget::Pool(0),
            };
        }

        let waker = Waker::from(Arc::clone(&self));
        let erased: Arc<dyn ErasedTask> = Arc::clone(&self) as Arc<dyn ErasedTask>;
        let previous = CURRENT_TASK.with(|t| t.borrow_mut().replace(erased));

        let polled = {
            let mut slot = self.future.borrow_mut();
            let future = slot.as_mut().expect("task polled after completion");
            let mut cx = Context::from_waker(&waker);
            future.as_mut().poll(&mut cx)
        };

        CURRENT_TASK.with(|t| *t.borrow_mut() = previous);

        match polled {
            Poll::Ready(value) => {
                *self.future.borrow_mut() = None;
                self.state.store(STATE_DONE, Ordering::Release);
                let completion = self.completion.borrow_mut().take();
                match completion {
                    Some(complete) => complete(value),
                    None => *self.result.borrow_mut() = Some(value),
                }
            }
            Poll::Pending => {
                if self
                    .state
                    .compare_exchange(
                        STATE_POLLING,
                        STATE_IDLE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_err()
                {
                    // a wake landed while we were polling; honor it at the
                    // recorded target
                    self.state.store(STATE_QUEUED, Ordering::Release);
                    let target = self.target.lock().unwrap().clone();
                    self.dispatch_to(target);
                }
            }
        }
    }

    fn start(self: Arc<Self>) {
        self.state
            .compare_exchange(
                STATE_IDLE,
                STATE_QUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .expect("async task started twice");
        self.poll_task();
    }

    fn install_completion(&self, complete: CompletionFn<T>) {
        let previous = self.completion.borrow_mut().replace(complete);
        assert!(previous.is_none(), "completion handler installed twice");
    }
}

impl<T: Send + 'static> Wake for TaskCore<T> {
    fn wake(self: Arc<Self>) {
        self.schedule_impl();
    }

    fn wake_by_ref(self: &Arc<Self>) {
        Arc::clone(self).schedule_impl();
    }
}

impl<T: Send + 'static> ErasedTask for TaskCore<T> {
    fn set_target(&self, target: ResumeTarget) {
        *self.target.lock().unwrap() = target;
    }

    fn resume_now(self: Arc<Self>) {
        loop {
            match self.state.compare_exchange(
                STATE_IDLE,
                STATE_QUEUED,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.poll_task();
                    return;
                }
                Err(STATE_POLLING) => {
                    // the suspending poll is still unwinding; it is about to
                    // publish IDLE
                    std::hint::spin_loop();
                    std::thread::yield_now();
                }
                Err(_) => return,
            }
        }
    }

    fn schedule(self: Arc<Self>) {
        self.schedule_impl();
    }
}

/// A lazily started, value-returning task over the worker pool.
///
/// The task does not run until [`run`](AsyncTask::run) (or
/// [`join`](AsyncTask::join), or an `await` of the task itself). A
/// completion handler, if any, receives the value exactly once, before the
/// task's state is dropped.
pub struct AsyncTask<T: Send + 'static> {
    core: Arc<TaskCore<T>>,
    awaited: bool,
}

impl<T: Send + 'static> AsyncTask<T> {
    pub fn new(pool: &PoolHandle, future: impl Future<Output = T> + Send + 'static) -> Self {
        Self {
            core: TaskCore::new(pool.clone(), future),
            awaited: false,
        }
    }

    /// Install the completion handler. Panics if one is already installed.
    pub fn on_complete(self, complete: impl FnOnce(T) + Send + 'static) -> Self {
        self.core.install_completion(Box::new(complete));
        self
    }

    /// Start the task on the calling thread. It keeps itself scheduled from
    /// there on.
    pub fn run(self) {
        self.core.clone().start();
    }

    /// Start the task and block until it completes. Must not be called from
    /// a pool thread (it would stall a worker the task may need).
    pub fn join(self) -> T {
        let (sender, receiver) = crossbeam::channel::bounded(1);
        let task = self.on_complete(move |value| {
            let _ = sender.send(value);
        });
        task.run();
        receiver
            .recv()
            .expect("async task dropped without completing")
    }
}

impl<T: Send + 'static> Future for AsyncTask<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();
        if !this.awaited {
            this.awaited = true;

            // wire the child's completion to resume us, then start it here
            let core = Arc::clone(&this.core);
            let waker = cx.waker().clone();
            let result_slot = Arc::clone(&this.core);
            core.install_completion(Box::new(move |value| {
                *result_slot.result.borrow_mut() = Some(value);
                waker.wake();
            }));
            this.core.clone().start();
            Poll::Pending
        } else {
            match this.core.result.borrow_mut().take() {
                Some(value) => Poll::Ready(value),
                None => Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::pool::WorkerPool;

    #[test]
    fn test_run_and_complete() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let value = AsyncTask::new(&handle, async { 6 * 7 }).join();
        assert_eq!(value, 42);

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_completion_handler_receives_value() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let (sender, receiver) = crossbeam::channel::bounded(1);
        AsyncTask::new(&handle, async { 7usize })
            .on_complete(move |v| {
                seen2.store(v, Ordering::Release);
                let _ = sender.send(());
            })
            .run();

        receiver.recv().unwrap();
        assert_eq!(seen.load(Ordering::Acquire), 7);

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_task_is_awaitable() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let inner_handle = handle.clone();
        let value = AsyncTask::new(&handle, async move {
            let child = AsyncTask::new(&inner_handle, async { 40 });
            child.await + 2
        })
        .join();

        assert_eq!(value, 42);
        pool.terminate();
        pool.join();
    }

    #[test]
    #[should_panic(expected = "completion handler installed twice")]
    fn test_double_completion_panics() {
        let mut pool = WorkerPool::new(1);
        pool.start();
        let handle = pool.handle();

        let task = AsyncTask::new(&handle, async {})
            .on_complete(|_| {})
            .on_complete(|_| {});
        task.run();
    }
}
