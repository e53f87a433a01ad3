//! Moving an async task between warps.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use crate::co::{current_task, ErasedTask, ResumeTarget};
use crate::warp::{ResumeOnDrop, Warp};

/// Switch the current async task onto `target` (or detach it onto the bare
/// pool when `None`). Resolves to the warp the task came from, so the caller
/// can switch back.
pub fn switch(target: Option<Warp>) -> Switch {
    switch_full(target, None, false, false)
}

/// Switch onto whichever of `target` / `other` can be entered first.
pub fn switch_pair(target: Warp, other: Warp) -> Switch {
    switch_full(Some(target), Some(other), false, false)
}

/// Hold `target` suspended while the continuation runs on the pool. The
/// suspension lasts until the task next suspends (or completes), which makes
/// this the read-side counterpart of running on the warp itself.
pub fn switch_parallel(target: Warp) -> Switch {
    switch_full(Some(target), None, true, false)
}

/// The fully general switch; see [`switch`], [`switch_pair`] and
/// [`switch_parallel`] for the common shapes.
pub fn switch_full(
    target: Option<Warp>,
    other: Option<Warp>,
    parallel_target: bool,
    parallel_other: bool,
) -> Switch {
    Switch {
        target,
        other,
        parallel_target,
        parallel_other,
        source: None,
        started: false,
    }
}

pub struct Switch {
    target: Option<Warp>,
    other: Option<Warp>,
    parallel_target: bool,
    parallel_other: bool,
    source: Option<Warp>,
    started: bool,
}

impl Switch {
    fn already_satisfied(&self) -> bool {
        if self.parallel_target || self.parallel_other {
            return false;
        }

        if self.source == self.target {
            self.other.is_none() || self.source == self.other
        } else {
            self.target.is_none() && self.source == self.other
        }
    }
}

impl Future for Switch {
    type Output = Option<Warp>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if this.started {
            return Poll::Ready(this.source.clone());
        }
        this.started = true;
        this.source = Warp::current();

        if this.already_satisfied() {
            return Poll::Ready(this.source.clone());
        }

        let task = current_task().expect("switch must be awaited inside an AsyncTask");

        let mut target = this.target.clone();
        let mut other = this.other.clone();
        let mut parallel_target = this.parallel_target;
        let mut parallel_other = this.parallel_other;
        if target.is_none() {
            std::mem::swap(&mut target, &mut other);
            std::mem::swap(&mut parallel_target, &mut parallel_other);
        }

        match target {
            None => {
                // detaching completely; resume on the bare pool
                assert!(
                    this.source.is_some(),
                    "detached switch outside any warp is a no-op"
                );
                task.set_target(ResumeTarget::Pool(0));
                task.schedule();
            }
            Some(target) => {
                hop(task, target, other, parallel_target, parallel_other);
            }
        }

        Poll::Pending
    }
}

/// Queue the hand-off onto `target`, parallel or not.
fn hop(
    task: Arc<dyn ErasedTask>,
    target: Warp,
    other: Option<Warp>,
    parallel_target: bool,
    parallel_other: bool,
) {
    let landing = target.clone();
    let run = move || handler(task, landing, other, parallel_target, parallel_other);
    if parallel_target {
        target.post_parallel(run);
    } else {
        target.post(run);
    }
}

/// Runs as a task of `current` (or, for a parallel hop, on the pool with
/// `current` held suspended). Resumes the continuation here, or retries with
/// the pair swapped when the partner warp cannot be entered.
fn handler(
    task: Arc<dyn ErasedTask>,
    current: Warp,
    other: Option<Warp>,
    parallel_target: bool,
    parallel_other: bool,
) {
    match other {
        None => {
            // the continuation proceeds right here: on `current` for a plain
            // switch, on this worker with `current` suspended for a parallel
            // one
            task.resume_now();
        }
        Some(other) => {
            if parallel_other {
                other.suspend();
                if !other.running() {
                    let _resume = ResumeOnDrop::new(other);
                    task.resume_now();
                } else {
                    other.resume();
                    // busy; try again with the pair swapped
                    hop(task, other, Some(current), parallel_other, parallel_target);
                }
            } else {
                let guard = other.preempt_guard(0);
                if guard.engaged() {
                    // continuation runs holding both: hosted by `current`,
                    // owning `other`
                    task.resume_now();
                } else {
                    drop(guard);
                    hop(task, other, Some(current), parallel_other, parallel_target);
                }
            }
        }
    }
}

/// Resolve to the first of `warps` that picks the task up, switching the
/// task onto it. Must be awaited from outside any warp.
pub fn select(warps: impl IntoIterator<Item = Warp>) -> Select {
    let warps: Vec<Warp> = warps.into_iter().collect();
    assert!(!warps.is_empty(), "select over no warps");
    Select {
        warps,
        shared: Arc::new(SelectShared {
            claimed: AtomicBool::new(false),
            winner: Mutex::new(None),
        }),
        started: false,
    }
}

struct SelectShared {
    claimed: AtomicBool,
    winner: Mutex<Option<Warp>>,
}

pub struct Select {
    warps: Vec<Warp>,
    shared: Arc<SelectShared>,
    started: bool,
}

impl Future for Select {
    type Output = Warp;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Warp> {
        let this = self.get_mut();

        if this.started {
            let winner = this
                .shared
                .winner
                .lock()
                .unwrap()
                .clone()
                .expect("select resumed without a winner");
            return Poll::Ready(winner);
        }
        this.started = true;

        debug_assert!(
            Warp::current().is_none(),
            "select must start outside any warp"
        );
        let task = current_task().expect("select must be awaited inside an AsyncTask");

        for warp in &this.warps {
            let shared = Arc::clone(&this.shared);
            let task = Arc::clone(&task);
            let claimant = warp.clone();
            warp.post(move || {
                // the first warp to get here wins the task
                if !shared.claimed.swap(true, Ordering::AcqRel) {
                    *shared.winner.lock().unwrap() = Some(claimant);
                    task.resume_now();
                }
            });

            // stop fanning out once somebody claimed it
            if this.shared.claimed.load(Ordering::Acquire) {
                break;
            }
        }

        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::co::AsyncTask;
    use crate::pool::WorkerPool;

    #[test]
    fn test_switch_and_back() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let warp = Warp::strand(handle.clone(), 0);

        let warp2 = warp.clone();
        let value = AsyncTask::new(&handle, async move {
            assert!(Warp::current().is_none());

            let source = switch(Some(warp2.clone())).await;
            assert!(warp2.is_current());
            assert!(source.is_none());

            let back = switch(source).await;
            assert!(Warp::current().is_none());
            assert_eq!(back, Some(warp2));
            42
        })
        .join();

        assert_eq!(value, 42);
        drain(&pool);
    }

    #[test]
    fn test_switch_back_restores_invariants() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let first = Warp::strand(handle.clone(), 0);
        let second = Warp::strand(handle.clone(), 0);

        let first2 = first.clone();
        let second2 = second.clone();
        AsyncTask::new(&handle, async move {
            let origin = switch(Some(first2.clone())).await;
            assert!(origin.is_none());

            // hop away and back; we must land on `first` again
            let from = switch(Some(second2.clone())).await;
            assert_eq!(from.as_ref(), Some(&first2));
            let from = switch(from).await;
            assert_eq!(from.as_ref(), Some(&second2));
            assert!(first2.is_current());

            // switching to the warp we are on resolves inline
            let same = switch(Some(first2.clone())).await;
            assert_eq!(same.as_ref(), Some(&first2));
            assert!(first2.is_current());
        })
        .join();

        drain(&pool);
    }

    #[test]
    fn test_switch_pair_lands_on_either() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let a = Warp::strand(handle.clone(), 0);
        let b = Warp::strand(handle.clone(), 0);

        let a2 = a.clone();
        let b2 = b.clone();
        AsyncTask::new(&handle, async move {
            switch_pair(a2.clone(), b2.clone()).await;
            let on_a = a2.is_current();
            let on_b = b2.is_current();
            assert!(on_a || on_b);
        })
        .join();

        drain(&pool);
    }

    #[test]
    fn test_select_picks_a_warp() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let warps: Vec<_> = (0..4).map(|_| Warp::strand(handle.clone(), 0)).collect();

        let warps2 = warps.clone();
        let winner = AsyncTask::new(&handle, async move {
            let winner = select(warps2.clone()).await;
            assert!(winner.is_current());
            winner
        })
        .join();

        assert!(warps.contains(&winner));
        drain(&pool);
    }

    #[test]
    fn test_read_write_phases_never_overlap() {
        let mut pool = WorkerPool::new(8);
        pool.start();
        let handle = pool.handle();
        let rw = Warp::strand(handle.clone(), 0);

        let readers = Arc::new(AtomicUsize::new(0));
        let writers = Arc::new(AtomicUsize::new(0));
        let peak_readers = Arc::new(AtomicUsize::new(0));
        let (sender, receiver) = crossbeam::channel::bounded(64);

        const TASKS: usize = 20;
        const CYCLES: usize = 4;

        for _ in 0..TASKS {
            let rw = rw.clone();
            let readers = Arc::clone(&readers);
            let writers = Arc::clone(&writers);
            let peak_readers = Arc::clone(&peak_readers);
            let sender = sender.clone();
            AsyncTask::new(&handle, async move {
                for _ in 0..CYCLES {
                    // read phase: hold the warp suspended, run on the pool
                    let from = switch_parallel(rw.clone()).await;
                    let now = readers.fetch_add(1, Ordering::SeqCst) + 1;
                    peak_readers.fetch_max(now, Ordering::SeqCst);
                    assert_eq!(writers.load(Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_micros(200));
                    readers.fetch_sub(1, Ordering::SeqCst);

                    // write phase: run on the warp itself
                    switch(Some(rw.clone())).await;
                    let nested = writers.fetch_add(1, Ordering::SeqCst);
                    assert_eq!(nested, 0);
                    assert_eq!(readers.load(Ordering::SeqCst), 0);
                    std::thread::sleep(Duration::from_micros(200));
                    writers.fetch_sub(1, Ordering::SeqCst);

                    switch(from.clone()).await;
                }
                let _ = sender.send(());
            })
            .run();
        }

        for _ in 0..TASKS {
            receiver
                .recv_timeout(Duration::from_secs(30))
                .expect("read/write tasks stalled");
        }

        drain(&pool);
    }

    fn drain(pool: &WorkerPool) {
        let handle = pool.handle();
        while handle.task_count() != 0 {
            std::thread::yield_now();
        }
    }
}
