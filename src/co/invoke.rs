//! Run a closure on another warp (or the bare pool) and await its value.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::warp::{ResumeOnDrop, Warp};

/// Await `f` running under `target`'s exclusivity (or on the bare pool when
/// `target` is `None`). When the caller is already on `target`, `f` runs
/// inline. The awaiting task resumes where it suspended, carrying `f`'s
/// return value.
pub fn invoke_on<R, F>(target: Option<Warp>, f: F) -> Invoke<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    Invoke {
        target,
        parallel_priority: None,
        func: Some(Box::new(f)),
        shared: Arc::new(InvokeShared {
            result: Mutex::new(None),
        }),
        started: false,
    }
}

/// Await `f` on the pool at `priority` while `target` is held suspended, so
/// several parallel invocations against the same warp can overlap each other
/// but not the warp's own tasks.
pub fn invoke_parallel<R, F>(target: Warp, f: F, priority: usize) -> Invoke<R>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    Invoke {
        target: Some(target),
        parallel_priority: Some(priority),
        func: Some(Box::new(f)),
        shared: Arc::new(InvokeShared {
            result: Mutex::new(None),
        }),
        started: false,
    }
}

struct InvokeShared<R> {
    result: Mutex<Option<R>>,
}

pub struct Invoke<R> {
    target: Option<Warp>,
    parallel_priority: Option<usize>,
    func: Option<Box<dyn FnOnce() -> R + Send + 'static>>,
    shared: Arc<InvokeShared<R>>,
    started: bool,
}

impl<R: Send + 'static> Future for Invoke<R> {
    type Output = R;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<R> {
        let this = self.get_mut();

        if this.started {
            return match this.shared.result.lock().unwrap().take() {
                Some(value) => Poll::Ready(value),
                None => Poll::Pending,
            };
        }
        this.started = true;

        let caller = Warp::current();
        let func = this.func.take().expect("invoke polled twice before start");

        // same warp (or both detached): run immediately
        if this.parallel_priority.is_none() && caller == this.target {
            return Poll::Ready(func());
        }

        let waker = cx.waker().clone();
        let shared = Arc::clone(&this.shared);

        if let Some(priority) = this.parallel_priority {
            let target = this
                .target
                .clone()
                .expect("invoke_parallel requires a target warp");
            // run alongside the suspended warp; resume it before waking the
            // caller
            target.suspend();
            let resume_target = target.clone();
            target.pool().submit(
                move || {
                    let value = {
                        let _resume = ResumeOnDrop::new(resume_target);
                        func()
                    };
                    *shared.result.lock().unwrap() = Some(value);
                    waker.wake();
                },
                priority,
            );
            return Poll::Pending;
        }

        let run = move || {
            let value = func();
            *shared.result.lock().unwrap() = Some(value);
            waker.wake();
        };

        match &this.target {
            None => {
                // detached work for a warp-bound caller
                let caller = caller.expect("invoke_on(None) away from any warp is inline");
                caller.pool().submit(run, 0);
            }
            Some(target) => {
                target.post(run);
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;
    use crate::co::AsyncTask;
    use crate::pool::WorkerPool;

    #[test]
    fn test_invoke_runs_on_target_warp() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let warp = Warp::strand(handle.clone(), 0);

        let warp2 = warp.clone();
        let value = AsyncTask::new(&handle, async move {
            let on_warp = invoke_on(Some(warp2.clone()), move || {
                assert!(warp2.is_current());
                41
            })
            .await;
            // resumed away from the warp, where we suspended
            assert!(Warp::current().is_none());
            on_warp + 1
        })
        .join();

        assert_eq!(value, 42);
        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_invoke_inline_on_same_warp() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();
        let warp = Warp::strand(handle.clone(), 0);

        let warp2 = warp.clone();
        let value = AsyncTask::new(&handle, async move {
            crate::co::switch(Some(warp2.clone())).await;
            invoke_on(Some(warp2.clone()), || 7).await
        })
        .join();

        assert_eq!(value, 7);
        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_invoke_parallel_excludes_warp_tasks() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let warp = Warp::strand(handle.clone(), 0);

        let on_warp = Arc::new(AtomicUsize::new(0));
        let on_warp2 = Arc::clone(&on_warp);
        let warp2 = warp.clone();
        let warp3 = warp.clone();
        AsyncTask::new(&handle, async move {
            invoke_parallel(
                warp2.clone(),
                move || {
                    // the warp is suspended while we run
                    assert!(warp3.is_suspended());
                    assert_eq!(on_warp2.load(Ordering::SeqCst), 0);
                },
                0,
            )
            .await;
        })
        .join();

        let on_warp2 = Arc::clone(&on_warp);
        warp.post(move || {
            on_warp2.fetch_add(1, Ordering::SeqCst);
        });

        while on_warp.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        pool.terminate();
        pool.join();
    }
}
