//! The DAG dispatcher.
//!
//! A [`Routine`] is a callable with a target warp, a priority, a lock count
//! and up to four child links. [`Dispatcher::order`] records edges (growing
//! through transparent junction routines past four children);
//! [`Dispatcher::dispatch`] unlocks a routine, and a routine whose lock
//! count drains to zero runs — on its warp, or straight on the pool — then
//! unlocks its children.
//!
//! A callable reports failure by returning `Err`; the routine is captured on
//! the failure list with its callable and lock restored, so the caller can
//! [`resurrect`](Dispatcher::resurrect) (retry) or
//! [`cleanup`](Dispatcher::cleanup) (abandon, counting the routines as
//! failed completions).

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atomic_refcell::AtomicRefCell;
use log::warn;

use crate::pool::PoolHandle;
use crate::warp::Warp;

/// Error type carried out of a routine callable.
pub type RoutineError = Box<dyn std::error::Error + Send + Sync + 'static>;

type RoutineFn = Box<dyn FnMut() -> Result<(), RoutineError> + Send + 'static>;
type CompletionFn = Box<dyn Fn(bool) + Send + Sync + 'static>;

const CHILD_SLOTS: usize = 4;

struct RoutineInner {
    /// Cleared after a successful run; junctions never have one.
    func: AtomicRefCell<Option<RoutineFn>>,
    warp: Option<Warp>,
    priority: usize,
    /// Runs when this drains to zero.
    lock_count: AtomicUsize,
    children: AtomicRefCell<[Option<Routine>; CHILD_SLOTS]>,
    /// Latch so children dispatch and completion fire exactly once even when
    /// a self-deferring routine races its own completion.
    finished: AtomicBool,
}

// `func` and `children` are only ever mutably borrowed by whichever single
// caller currently owns the routine's run (gated by `lock_count` draining to
// zero and the `finished` latch), so concurrent aliasing never happens
// despite the boxed callable not being `Sync` on its own.
unsafe impl Sync for RoutineInner {}

/// A handle to a dispatcher-managed routine. Clones refer to the same node.
#[derive(Clone)]
pub struct Routine {
    inner: Arc<RoutineInner>,
}

impl Routine {
    fn is_junction(&self) -> bool {
        self.inner.func.borrow().is_none()
    }

    /// Install the callable after allocation; used by the async adapters.
    pub(crate) fn set_func(&self, func: RoutineFn) {
        *self.inner.func.borrow_mut() = Some(func);
    }
}

struct DispatcherShared {
    pool: PoolHandle,
    /// Allocated but not yet completed routines.
    pending: AtomicUsize,
    /// Routines whose callables failed, most recent last.
    failed: Mutex<Vec<Routine>>,
    completion: Option<CompletionFn>,
}

/// A DAG task dispatcher over a [`WorkerPool`](crate::WorkerPool).
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<DispatcherShared>,
}

impl Dispatcher {
    pub fn new(pool: PoolHandle) -> Self {
        Self::build(pool, None)
    }

    /// `on_complete` fires with a success flag each time the pending count
    /// drains to zero.
    pub fn with_completion(pool: PoolHandle, on_complete: impl Fn(bool) + Send + Sync + 'static) -> Self {
        Self::build(pool, Some(Box::new(on_complete)))
    }

    fn build(pool: PoolHandle, completion: Option<CompletionFn>) -> Self {
        Self {
            shared: Arc::new(DispatcherShared {
                pool,
                pending: AtomicUsize::new(0),
                failed: Mutex::new(Vec::new()),
                completion,
            }),
        }
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.shared.pool
    }

    /// Allocate a routine bound to `warp` (or to the bare pool when `None`).
    /// It starts locked once; [`dispatch`](Dispatcher::dispatch) removes
    /// that lock.
    pub fn allocate(
        &self,
        warp: Option<Warp>,
        func: impl FnMut() -> Result<(), RoutineError> + Send + 'static,
    ) -> Routine {
        self.allocate_raw(warp, Some(Box::new(func)), 0)
    }

    /// [`allocate`](Dispatcher::allocate) with a pool priority; the priority
    /// matters only for routines without a warp.
    pub fn allocate_prioritized(
        &self,
        warp: Option<Warp>,
        func: impl FnMut() -> Result<(), RoutineError> + Send + 'static,
        priority: usize,
    ) -> Routine {
        self.allocate_raw(warp, Some(Box::new(func)), priority)
    }

    pub(crate) fn allocate_raw(
        &self,
        warp: Option<Warp>,
        func: Option<RoutineFn>,
        priority: usize,
    ) -> Routine {
        self.shared.pending.fetch_add(1, Ordering::Acquire);
        Routine {
            inner: Arc::new(RoutineInner {
                func: AtomicRefCell::new(func),
                warp,
                priority,
                lock_count: AtomicUsize::new(1),
                children: AtomicRefCell::new([const { None }; CHILD_SLOTS]),
                finished: AtomicBool::new(false),
            }),
        }
    }

    fn allocate_junction(&self, warp: Option<Warp>) -> Routine {
        self.allocate_raw(warp, None, 0)
    }

    /// Record the edge `from -> to`: `to`'s callable will not run until
    /// `from`'s has. Both must still be undispatched or locked. Creating a
    /// cycle is a programming error, caught in debug builds.
    pub fn order(&self, from: &Routine, to: &Routine) {
        if cfg!(debug_assertions) {
            assert!(
                !Arc::ptr_eq(&from.inner, &to.inner),
                "routine ordered after itself"
            );
            validate_acyclic(from, to);
        }

        let mut slots = from.inner.children.borrow_mut();
        for slot in slots.iter_mut() {
            if slot.is_none() {
                to.inner.lock_count.fetch_add(1, Ordering::Relaxed);
                *slot = Some(to.clone());
                return;
            }
        }

        let first = slots[0].clone().expect("slots full but first empty");
        if first.is_junction() {
            // spill into the junction's own slots
            drop(slots);
            self.order(&first, to);
        } else {
            // synthesize a junction holding the displaced child and the new
            // one
            to.inner.lock_count.fetch_add(1, Ordering::Relaxed);
            let junction = self.allocate_junction(from.inner.warp.clone());
            {
                let mut junction_slots = junction.inner.children.borrow_mut();
                junction_slots[0] = slots[0].take();
                junction_slots[1] = Some(to.clone());
            }
            slots[0] = Some(junction);
        }
    }

    /// Add a temporary lock, keeping `routine` from running until a matching
    /// [`dispatch`](Dispatcher::dispatch). Returns a handle for that
    /// dispatch.
    pub fn defer(&self, routine: &Routine) -> Routine {
        debug_assert_ne!(self.shared.pending.load(Ordering::Acquire), 0);
        debug_assert_ne!(routine.inner.lock_count.load(Ordering::Relaxed), 0);
        routine.inner.lock_count.fetch_add(1, Ordering::Relaxed);
        routine.clone()
    }

    /// Remove one lock; at zero the routine runs (on its warp, or queued to
    /// the pool at its priority; junctions run in place).
    pub fn dispatch(&self, routine: &Routine) {
        if routine.inner.lock_count.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }

        if routine.is_junction() {
            self.execute(routine);
            return;
        }

        let dispatcher = self.clone();
        let target = routine.clone();
        match &routine.inner.warp {
            Some(warp) => warp.run_in(move || dispatcher.execute(&target)),
            None => self
                .shared
                .pool
                .submit(move || dispatcher.execute(&target), routine.inner.priority),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.load(Ordering::Acquire)
    }

    /// True when some routine failed and awaits `resurrect` or `cleanup`.
    pub fn has_failed(&self) -> bool {
        !self.shared.failed.lock().unwrap().is_empty()
    }

    /// Re-dispatch the failed routines, most recent first. Returns false if
    /// there were none.
    pub fn resurrect(&self) -> bool {
        let mut failed = {
            let mut guard = self.shared.failed.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if failed.is_empty() {
            return false;
        }

        while let Some(routine) = failed.pop() {
            self.dispatch(&routine);
        }
        true
    }

    /// Drop the failed routines, counting each as a failed completion.
    /// Returns false if there were none.
    pub fn cleanup(&self) -> bool {
        let failed = {
            let mut guard = self.shared.failed.lock().unwrap();
            std::mem::take(&mut *guard)
        };
        if failed.is_empty() {
            return false;
        }

        for routine in failed {
            drop(routine);
            self.complete(false);
        }
        true
    }

    fn execute(&self, routine: &Routine) {
        let taken = routine.inner.func.borrow_mut().take();
        if let Some(mut func) = taken {
            match func() {
                Ok(()) => {}
                Err(error) => {
                    warn!("routine failed: {error}");
                    // restore the callable and one lock so the routine can
                    // be retried by resurrect()
                    routine.inner.lock_count.fetch_add(1, Ordering::Relaxed);
                    *routine.inner.func.borrow_mut() = Some(func);
                    self.shared.failed.lock().unwrap().push(routine.clone());
                    return;
                }
            }
        }

        // a routine that deferred itself from inside its callable completes
        // only when the deferred handle is dispatched
        if routine.inner.lock_count.load(Ordering::Acquire) != 0 {
            return;
        }
        if routine.inner.finished.swap(true, Ordering::AcqRel) {
            return;
        }

        let children: Vec<Routine> = {
            let mut slots = routine.inner.children.borrow_mut();
            slots.iter_mut().filter_map(Option::take).collect()
        };
        for child in children {
            self.dispatch(&child);
        }

        self.complete(true);
    }

    fn complete(&self, success: bool) {
        if self.shared.pending.fetch_sub(1, Ordering::Release) == 1 {
            if let Some(on_complete) = &self.shared.completion {
                on_complete(success);
            }
        }
    }
}

/// Walk `to`'s subtree asserting `from` is not reachable.
fn validate_acyclic(from: &Routine, to: &Routine) {
    let slots = to.inner.children.borrow();
    for slot in slots.iter().flatten() {
        assert!(
            !Arc::ptr_eq(&from.inner, &slot.inner),
            "routine ordering would create a cycle"
        );
        validate_acyclic(from, slot);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::pool::WorkerPool;

    fn completion_channel() -> (
        crossbeam::channel::Sender<bool>,
        crossbeam::channel::Receiver<bool>,
    ) {
        crossbeam::channel::bounded(16)
    }

    #[test]
    fn test_divisibility_dag() {
        const LIMIT: usize = 0x1126;

        let mut pool = WorkerPool::new(8);
        pool.start();
        let handle = pool.handle();
        let sum_warp = Warp::strand(handle.clone(), 0);

        let (sender, receiver) = completion_channel();
        let dispatcher = Dispatcher::with_completion(handle.clone(), move |success| {
            let _ = sender.send(success);
        });

        let executed: Arc<Vec<AtomicBool>> =
            Arc::new((0..LIMIT).map(|_| AtomicBool::new(false)).collect());
        let sum_of_factors = Arc::new(AtomicUsize::new(0));

        let mut routines = Vec::with_capacity(LIMIT);
        for n in 0..LIMIT {
            let executed = Arc::clone(&executed);
            let dispatcher2 = dispatcher.clone();
            let sum_warp = sum_warp.clone();
            let sum_of_factors = Arc::clone(&sum_of_factors);
            routines.push(dispatcher.allocate(None, move || {
                let mut sum = 0;
                for m in 2..n {
                    if n % m == 0 {
                        assert!(executed[m].load(Ordering::Acquire));
                        sum += n;
                    }
                }
                executed[n].store(true, Ordering::Release);

                let sum_of_factors = Arc::clone(&sum_of_factors);
                let tail = dispatcher2.allocate(Some(sum_warp.clone()), move || {
                    sum_of_factors.fetch_add(sum, Ordering::Relaxed);
                    Ok(())
                });
                dispatcher2.dispatch(&tail);
                Ok(())
            }));
        }

        for n in 2..LIMIT {
            for m in 2..n {
                if n % m == 0 {
                    dispatcher.order(&routines[m], &routines[n]);
                }
            }
        }

        for n in (0..LIMIT).rev() {
            dispatcher.dispatch(&routines[n]);
        }

        let success = receiver.recv_timeout(Duration::from_secs(120)).unwrap();
        assert!(success);
        assert_eq!(dispatcher.pending_count(), 0);

        let mut expected = 0usize;
        for n in 2..LIMIT {
            for m in 2..n {
                if n % m == 0 {
                    expected += n;
                }
            }
        }
        assert_eq!(sum_of_factors.load(Ordering::Relaxed), expected);

        let poller = handle.clone();
        sum_warp.join(|| {
            poller.poll(usize::MAX);
        });
        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_junction_growth_past_four_children() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();

        let (sender, receiver) = completion_channel();
        let dispatcher = Dispatcher::with_completion(handle.clone(), move |success| {
            let _ = sender.send(success);
        });

        let parent_ran = Arc::new(AtomicBool::new(false));
        let parent_seen = Arc::new(AtomicUsize::new(0));

        let parent_ran2 = Arc::clone(&parent_ran);
        let parent = dispatcher.allocate(None, move || {
            parent_ran2.store(true, Ordering::Release);
            Ok(())
        });

        const CHILDREN: usize = 9;
        let mut children = Vec::new();
        for _ in 0..CHILDREN {
            let parent_ran = Arc::clone(&parent_ran);
            let parent_seen = Arc::clone(&parent_seen);
            let child = dispatcher.allocate(None, move || {
                assert!(parent_ran.load(Ordering::Acquire));
                parent_seen.fetch_add(1, Ordering::Release);
                Ok(())
            });
            dispatcher.order(&parent, &child);
            children.push(child);
        }

        for child in &children {
            dispatcher.dispatch(child);
        }
        dispatcher.dispatch(&parent);

        assert!(receiver.recv_timeout(Duration::from_secs(30)).unwrap());
        assert_eq!(parent_seen.load(Ordering::Acquire), CHILDREN);

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_defer_holds_execution() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let dispatcher = Dispatcher::new(handle.clone());

        let (first_done, first_wait) = crossbeam::channel::bounded::<()>(1);
        let (second_done, second_wait) = crossbeam::channel::bounded::<()>(1);

        let first = dispatcher.allocate(None, move || {
            let _ = first_done.send(());
            Ok(())
        });
        let second_ran = Arc::new(AtomicBool::new(false));
        let second_ran2 = Arc::clone(&second_ran);
        let second = dispatcher.allocate(None, move || {
            second_ran2.store(true, Ordering::Release);
            let _ = second_done.send(());
            Ok(())
        });

        dispatcher.order(&first, &second);
        let held = dispatcher.defer(&second);

        dispatcher.dispatch(&second);
        dispatcher.dispatch(&first);

        first_wait.recv_timeout(Duration::from_secs(30)).unwrap();
        // the deferred lock is still in place
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(second_ran.load(Ordering::Acquire), false);

        dispatcher.dispatch(&held);
        second_wait.recv_timeout(Duration::from_secs(30)).unwrap();

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_failed_routine_resurrects() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let (sender, receiver) = completion_channel();
        let dispatcher = Dispatcher::with_completion(handle.clone(), move |success| {
            let _ = sender.send(success);
        });

        let (failed_once, failure_seen) = crossbeam::channel::bounded::<()>(1);
        let attempts = Arc::new(AtomicUsize::new(0));
        let attempts2 = Arc::clone(&attempts);
        let after_ran = Arc::new(AtomicBool::new(false));

        let flaky = dispatcher.allocate(None, move || {
            if attempts2.fetch_add(1, Ordering::SeqCst) == 0 {
                let _ = failed_once.send(());
                return Err("first attempt fails".into());
            }
            Ok(())
        });

        let after_ran2 = Arc::clone(&after_ran);
        let after = dispatcher.allocate(None, move || {
            after_ran2.store(true, Ordering::Release);
            Ok(())
        });
        dispatcher.order(&flaky, &after);

        dispatcher.dispatch(&after);
        dispatcher.dispatch(&flaky);

        failure_seen.recv_timeout(Duration::from_secs(30)).unwrap();
        while !dispatcher.has_failed() {
            std::thread::yield_now();
        }
        assert_eq!(after_ran.load(Ordering::Acquire), false);

        assert!(dispatcher.resurrect());
        let success = receiver.recv_timeout(Duration::from_secs(30)).unwrap();
        assert!(success);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
        assert_eq!(after_ran.load(Ordering::Acquire), true);

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_cleanup_counts_failed_completions() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let (sender, receiver) = completion_channel();
        let dispatcher = Dispatcher::with_completion(handle.clone(), move |success| {
            let _ = sender.send(success);
        });

        let (failed_once, failure_seen) = crossbeam::channel::bounded::<()>(1);
        let doomed = dispatcher.allocate(None, move || {
            let _ = failed_once.send(());
            Err("always fails".into())
        });

        dispatcher.dispatch(&doomed);
        failure_seen.recv_timeout(Duration::from_secs(30)).unwrap();
        while !dispatcher.has_failed() {
            std::thread::yield_now();
        }

        assert!(dispatcher.cleanup());
        let success = receiver.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(success, false);
        assert_eq!(dispatcher.pending_count(), 0);

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_warp_routines_run_on_their_warp() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();
        let warp = Warp::strand(handle.clone(), 0);

        let (sender, receiver) = completion_channel();
        let dispatcher = Dispatcher::with_completion(handle.clone(), move |success| {
            let _ = sender.send(success);
        });

        let warp2 = warp.clone();
        let routine = dispatcher.allocate(Some(warp.clone()), move || {
            assert!(warp2.is_current());
            Ok(())
        });
        dispatcher.dispatch(&routine);

        assert!(receiver.recv_timeout(Duration::from_secs(30)).unwrap());

        let poller = handle.clone();
        warp.join(|| {
            poller.poll(usize::MAX);
        });
        pool.terminate();
        pool.join();
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "cycle")]
    fn test_cycle_detection() {
        let mut pool = WorkerPool::new(1);
        pool.start();
        let handle = pool.handle();
        let dispatcher = Dispatcher::new(handle);

        let a = dispatcher.allocate(None, || Ok(()));
        let b = dispatcher.allocate(None, || Ok(()));
        dispatcher.order(&a, &b);
        dispatcher.order(&b, &a);
    }
}
