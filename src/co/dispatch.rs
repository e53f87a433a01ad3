//! Adapters between [`AsyncTask`] and the DAG [`Dispatcher`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::co::AsyncTask;
use crate::dispatch::{Dispatcher, Routine};
use crate::warp::Warp;

/// Wrap `task` as a routine of `dispatcher`. The task starts when the
/// routine runs (its ordering locks drained); routines ordered after the
/// returned handle run only once the task has completed. The caller
/// dispatches the returned routine like any other.
pub fn dispatch_task<T: Send + 'static>(dispatcher: &Dispatcher, task: AsyncTask<T>) -> Routine {
    let warp = Warp::current();
    let routine = dispatcher.allocate_raw(warp, None, 0);

    let dispatcher = dispatcher.clone();
    let self_handle = routine.clone();
    let mut pending = Some(task);
    routine.set_func(Box::new(move || {
        let task = pending.take().expect("async routine restarted after success");
        // hold our own completion open until the task finishes
        let held = dispatcher.defer(&self_handle);
        let dispatcher = dispatcher.clone();
        task.on_complete(move |_value| {
            dispatcher.dispatch(&held);
        })
        .run();
        Ok(())
    }));

    routine
}

/// Await the completion of `routines` (undispatched handles): a resume
/// routine is ordered after all of them, they are dispatched, and the task
/// suspends until the resume routine runs — on the warp the task suspended
/// on.
pub fn await_routines(dispatcher: &Dispatcher, routines: Vec<Routine>) -> AwaitRoutines {
    AwaitRoutines {
        dispatcher: dispatcher.clone(),
        awaited: routines,
        done: Arc::new(AtomicBool::new(false)),
        started: false,
    }
}

pub struct AwaitRoutines {
    dispatcher: Dispatcher,
    awaited: Vec<Routine>,
    done: Arc<AtomicBool>,
    started: bool,
}

impl Future for AwaitRoutines {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.started {
            return if this.done.load(Ordering::Acquire) {
                Poll::Ready(())
            } else {
                Poll::Pending
            };
        }
        this.started = true;

        let waker = cx.waker().clone();
        let done = Arc::clone(&this.done);
        let resume = this.dispatcher.allocate(Warp::current(), move || {
            done.store(true, Ordering::Release);
            waker.wake_by_ref();
            Ok(())
        });

        for routine in this.awaited.drain(..) {
            this.dispatcher.order(&routine, &resume);
            this.dispatcher.dispatch(&routine);
        }
        this.dispatcher.dispatch(&resume);

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::co::invoke_on;
    use crate::pool::WorkerPool;

    #[test]
    fn test_dispatch_task_gates_ordered_routines() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let warp = crate::warp::Warp::strand(handle.clone(), 0);

        let (sender, receiver) = crossbeam::channel::bounded(1);
        let dispatcher = Dispatcher::with_completion(handle.clone(), move |success| {
            let _ = sender.send(success);
        });

        let task_done = Arc::new(AtomicBool::new(false));
        let task_done2 = Arc::clone(&task_done);
        let warp2 = warp.clone();
        let task = AsyncTask::new(&handle, async move {
            // suspend at least once so completion is genuinely asynchronous
            invoke_on(Some(warp2), || ()).await;
            task_done2.store(true, Ordering::Release);
        });

        let routine = dispatch_task(&dispatcher, task);

        let task_done3 = Arc::clone(&task_done);
        let after = dispatcher.allocate(None, move || {
            assert!(task_done3.load(Ordering::Acquire));
            Ok(())
        });
        dispatcher.order(&routine, &after);

        dispatcher.dispatch(&after);
        dispatcher.dispatch(&routine);

        let success = receiver.recv_timeout(Duration::from_secs(30)).unwrap();
        assert!(success);
        assert!(task_done.load(Ordering::Acquire));

        let poller = handle.clone();
        warp.join(|| {
            poller.poll(usize::MAX);
        });
        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_await_routines_runs_after_all() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let dispatcher = Dispatcher::new(handle.clone());

        let counter = Arc::new(AtomicUsize::new(0));
        let mut routines = Vec::new();
        for _ in 0..3 {
            let counter = Arc::clone(&counter);
            routines.push(dispatcher.allocate(None, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        let dispatcher2 = dispatcher.clone();
        let counter2 = Arc::clone(&counter);
        let value = AsyncTask::new(&handle, async move {
            await_routines(&dispatcher2, routines).await;
            counter2.load(Ordering::SeqCst)
        })
        .join();

        assert_eq!(value, 3);

        pool.terminate();
        pool.join();
    }
}
