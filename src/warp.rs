//! Serialization domains.
//!
//! A [`Warp`] gives a stream of tasks the illusion of a single-threaded
//! queue while the tasks actually run on whichever pool worker drains the
//! warp at that moment. At most one thread owns a warp at a time; ownership
//! is taken with a CAS and tracked on a per-thread warp stack so that nested
//! acquisition behaves like a stack of scopes.
//!
//! Two storage modes are available:
//!
//! - **strand**: one atomic MPSC stack. The drain detaches the whole chain
//!   and reverses it, so execution follows global submission order.
//! - **grid**: one ring per pool thread plus a barrier version. Tasks keep
//!   per-producer FIFO order, and [`Warp::queue_barrier`] draws a line that
//!   no later submission (from any thread) may cross before every earlier
//!   one has run.

use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use atomic_refcell::AtomicRefCell;
use crossbeam::queue::SegQueue;
use log::trace;

use crate::pool::{current_worker_index, PoolHandle};
use crate::task::{AtomicTaskStack, Task, TaskList};

std::thread_local! {
    /// Stack of warps owned by this thread, innermost last.
    static WARP_STACK: RefCell<Vec<Warp>> = const { RefCell::new(Vec::new()) };
}

const QUEUE_IDLE: u8 = 0;
const QUEUE_PENDING: u8 = 1;
const QUEUE_EXECUTING: u8 = 2;

type WarpFn = Box<dyn FnOnce() + Send + 'static>;

enum GridTask {
    Run(WarpFn),
    /// A version fence emitted by `queue_barrier`.
    Fence(usize),
}

struct GridCursor {
    /// Last fence version observed per ring.
    versions: Vec<usize>,
    current: usize,
    next: usize,
}

struct GridStorage {
    rings: Box<[SegQueue<GridTask>]>,
    barrier_version: AtomicUsize,
    /// Drain-side bookkeeping; only the owning thread touches it.
    cursor: AtomicRefCell<GridCursor>,
}

struct StrandStorage {
    queueing: AtomicTaskStack,
    /// Partially drained batch carried over when a drain is cut short. Only
    /// the owner writes it, but `is_empty` may peek from other threads.
    executing: Mutex<TaskList>,
}

enum Storage {
    Strand(StrandStorage),
    Grid(GridStorage),
}

impl Storage {
    fn is_empty(&self) -> bool {
        match self {
            Storage::Strand(s) => s.queueing.is_empty() && s.executing.lock().unwrap().is_empty(),
            Storage::Grid(g) => g.rings.iter().all(|ring| ring.is_empty()),
        }
    }
}

struct WarpInner {
    pool: PoolHandle,
    priority: usize,
    /// Set while some thread owns the warp.
    locked: AtomicBool,
    suspend_count: AtomicUsize,
    queue_state: AtomicU8,
    storage: Storage,
    /// Tasks queued by `post_parallel`, dispatched to the pool while the
    /// warp stays suspended.
    parallel_pending: AtomicTaskStack,
}

/// A serialization domain over a [`WorkerPool`](crate::WorkerPool).
///
/// Handles are cheap clones of a shared state; two handles compare equal
/// when they refer to the same warp.
#[derive(Clone)]
pub struct Warp {
    inner: Arc<WarpInner>,
}

impl PartialEq for Warp {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Warp {}

impl std::fmt::Debug for Warp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Warp")
            .field("addr", &Arc::as_ptr(&self.inner))
            .field("priority", &self.inner.priority)
            .finish()
    }
}

/// Resumes a warp exactly once when dropped; used to pair `suspend()` with
/// `resume()` across closures and early exits.
pub(crate) struct ResumeOnDrop(Option<Warp>);

impl ResumeOnDrop {
    pub(crate) fn new(warp: Warp) -> Self {
        Self(Some(warp))
    }

    fn disarm(&mut self) {
        self.0 = None;
    }
}

impl Drop for ResumeOnDrop {
    fn drop(&mut self) {
        if let Some(warp) = self.0.take() {
            warp.resume();
        }
    }
}

/// Scoped warp ownership. Constructed with [`Warp::preempt_guard`]; when it
/// acquired ownership, the guard yields the warp again on drop.
pub struct PreemptGuard {
    warp: Warp,
    engaged: bool,
    preempted: bool,
}

impl PreemptGuard {
    /// True when the caller may run tasks under the warp's exclusivity.
    pub fn engaged(&self) -> bool {
        self.engaged
    }

    /// Disarm the guard without yielding; the caller takes over the yield.
    fn cleanup(&mut self) {
        self.engaged = false;
        self.preempted = false;
    }
}

impl Drop for PreemptGuard {
    fn drop(&mut self) {
        if self.preempted {
            self.warp.yield_now();
        }
    }
}

impl Warp {
    /// A warp with strand storage: global submission order, one atomic
    /// queue.
    pub fn strand(pool: PoolHandle, priority: usize) -> Self {
        Self::with_storage(pool, priority, |_| {
            Storage::Strand(StrandStorage {
                queueing: AtomicTaskStack::new(),
                executing: Mutex::new(TaskList::new()),
            })
        })
    }

    /// A warp with grid storage: per-producer FIFO over one ring per pool
    /// thread, with `queue_barrier` as the cross-producer fence.
    pub fn grid(pool: PoolHandle, priority: usize) -> Self {
        Self::with_storage(pool, priority, |threads| {
            Storage::Grid(GridStorage {
                rings: (0..threads).map(|_| SegQueue::new()).collect(),
                barrier_version: AtomicUsize::new(0),
                cursor: AtomicRefCell::new(GridCursor {
                    versions: vec![0; threads],
                    current: 0,
                    next: 0,
                }),
            })
        })
    }

    fn with_storage(
        pool: PoolHandle,
        priority: usize,
        build: impl FnOnce(usize) -> Storage,
    ) -> Self {
        let threads = pool.thread_count().max(1);
        Self {
            inner: Arc::new(WarpInner {
                storage: build(threads),
                pool,
                priority,
                locked: AtomicBool::new(false),
                suspend_count: AtomicUsize::new(0),
                queue_state: AtomicU8::new(QUEUE_IDLE),
                parallel_pending: AtomicTaskStack::new(),
            }),
        }
    }

    /// The warp the calling thread currently owns, if any.
    pub fn current() -> Option<Warp> {
        WARP_STACK.with(|stack| stack.borrow().last().cloned())
    }

    /// True when the calling thread's innermost owned warp is this one.
    pub fn is_current(&self) -> bool {
        WARP_STACK.with(|stack| {
            stack
                .borrow()
                .last()
                .is_some_and(|warp| Arc::ptr_eq(&warp.inner, &self.inner))
        })
    }

    pub fn pool(&self) -> &PoolHandle {
        &self.inner.pool
    }

    pub fn priority(&self) -> usize {
        self.inner.priority
    }

    /// True while some thread owns the warp. Meaningful only as a hint in
    /// multithreaded contexts.
    pub fn running(&self) -> bool {
        self.inner.locked.load(Ordering::Acquire)
    }

    pub fn is_suspended(&self) -> bool {
        self.inner.suspend_count.load(Ordering::Acquire) != 0
    }

    /// True when no tasks are queued. Only meaningful while not running.
    pub fn is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    pub(crate) fn has_parallel(&self) -> bool {
        !self.inner.parallel_pending.is_empty()
    }

    /// Block dispatch of normal tasks; counted, so every `suspend` needs a
    /// matching [`resume`](Warp::resume). Returns true for the first
    /// acquirer.
    pub fn suspend(&self) -> bool {
        self.inner.suspend_count.fetch_add(1, Ordering::Acquire) == 0
    }

    /// Undo one [`suspend`](Warp::suspend); on the final resume the warp is
    /// re-flushed if work queued up meanwhile. Returns true on the final
    /// resume.
    pub fn resume(&self) -> bool {
        let last = self.inner.suspend_count.fetch_sub(1, Ordering::Release) == 1;
        if last {
            let was_pending = self
                .inner
                .queue_state
                .swap(QUEUE_IDLE, Ordering::Relaxed)
                == QUEUE_PENDING;
            // tasks stranded by a suspension mid-drain carry no pending mark
            if was_pending || !self.is_empty() {
                self.flush();
            }
        }
        last
    }

    /// Give up ownership held by the calling thread. Returns false if the
    /// calling thread does not own this warp.
    pub fn yield_now(&self) -> bool {
        let popped = WARP_STACK.with(|stack| {
            let mut stack = stack.borrow_mut();
            if stack
                .last()
                .is_some_and(|warp| Arc::ptr_eq(&warp.inner, &self.inner))
            {
                stack.pop();
                true
            } else {
                false
            }
        });

        if !popped {
            return false;
        }

        self.inner.locked.store(false, Ordering::Release);
        if self
            .inner
            .queue_state
            .swap(QUEUE_IDLE, Ordering::Relaxed)
            == QUEUE_PENDING
        {
            self.flush();
        }
        true
    }

    /// Take ownership atomically. On success the warp is pushed on the
    /// calling thread's warp stack.
    fn preempt(&self) -> bool {
        if self
            .inner
            .locked
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            WARP_STACK.with(|stack| stack.borrow_mut().push(self.clone()));
            true
        } else {
            false
        }
    }

    /// Try to acquire the warp for the calling thread, honoring the suspend
    /// count up to `suspend_level`.
    pub fn preempt_guard(&self, suspend_level: usize) -> PreemptGuard {
        let mut engaged = self.inner.suspend_count.load(Ordering::Acquire) <= suspend_level;
        let mut preempted = false;
        if engaged {
            if self.is_current() {
                // already ours, nothing to yield later
            } else {
                preempted = self.preempt();
                // recheck after acquisition
                engaged = preempted
                    && self.inner.suspend_count.load(Ordering::Relaxed) <= suspend_level;
            }
        }

        PreemptGuard {
            warp: self.clone(),
            engaged,
            preempted,
        }
    }

    /// Queue `f` on this warp. When called from a pool thread that can take
    /// ownership immediately, `f` runs inline under the warp's exclusivity.
    pub fn run_in(&self, f: impl FnOnce() + Send + 'static) {
        if current_worker_index().is_none() {
            return self.post_external(f);
        }

        let guard = self.preempt_guard(0);
        if guard.engaged() {
            f();
        } else {
            drop(guard);
            self.post(f);
        }
    }

    /// Queue `f` on this warp, never inline.
    pub fn post(&self, f: impl FnOnce() + Send + 'static) {
        match &self.inner.storage {
            Storage::Strand(s) => {
                s.queueing.push(Task::new(f));
            }
            Storage::Grid(g) => {
                let Some(index) = self.grid_ring_index(g.rings.len()) else {
                    return self.post_external(f);
                };
                g.rings[index].push(GridTask::Run(Box::new(f)));
            }
        }
        self.flush();
    }

    /// The submitting thread's ring, or `None` when the task has to enter
    /// through a worker.
    fn grid_ring_index(&self, ring_count: usize) -> Option<usize> {
        match current_worker_index() {
            Some(index) => {
                debug_assert!(index < ring_count);
                Some(index % ring_count)
            }
            // teardown drains on the caller's thread; ring 0 accepts the
            // task since per-producer ordering no longer matters
            None if self.inner.pool.is_terminated() => Some(0),
            None => None,
        }
    }

    /// Queue `f` from a thread outside the pool. For strand storage this is
    /// a plain [`post`](Warp::post); for grid storage the task is handed to
    /// the pool first so it enters through a worker's own ring.
    pub fn post_external(&self, f: impl FnOnce() + Send + 'static) {
        match &self.inner.storage {
            Storage::Strand(_) => self.post(f),
            Storage::Grid(_) => {
                let warp = self.clone();
                self.inner
                    .pool
                    .submit(move || warp.post(f), self.inner.priority);
            }
        }
    }

    /// Draw a fence: every task queued before the barrier (on any thread)
    /// runs before any task queued after it. Grid storage only; a strand is
    /// already globally ordered.
    pub fn queue_barrier(&self) {
        match &self.inner.storage {
            Storage::Strand(_) => {}
            Storage::Grid(g) => {
                let Some(index) = self.grid_ring_index(g.rings.len()) else {
                    // enter through a worker, like post_external
                    let warp = self.clone();
                    return self
                        .inner
                        .pool
                        .submit(move || warp.queue_barrier(), self.inner.priority);
                };
                let version = g.barrier_version.fetch_add(1, Ordering::AcqRel) + 1;
                g.rings[index].push(GridTask::Fence(version));
                self.flush();
            }
        }
    }

    /// Queue `f` for execution on the pool while this warp stays suspended;
    /// the warp resumes when `f` completes. Useful for read-side work that
    /// must exclude the warp's normal (write-side) tasks.
    pub fn post_parallel(&self, f: impl FnOnce() + Send + 'static) {
        self.parallel_inner(f, false);
    }

    /// Like [`post_parallel`](Warp::post_parallel), but runs `f` on the
    /// calling thread when the warp is not currently running.
    pub fn run_parallel(&self, f: impl FnOnce() + Send + 'static) {
        self.parallel_inner(f, true);
    }

    fn parallel_inner(&self, f: impl FnOnce() + Send + 'static, inline: bool) {
        self.suspend();
        let mut resume_guard = ResumeOnDrop::new(self.clone());

        if !self.running() {
            if inline {
                f();
                // resume_guard resumes on scope exit
            } else {
                let warp = self.clone();
                self.inner.pool.submit(
                    move || {
                        let _resume = ResumeOnDrop::new(warp);
                        f();
                    },
                    self.inner.priority,
                );
                resume_guard.disarm();
            }
        } else {
            // wait for the current owner; the drain dispatches these
            let warp = self.clone();
            self.inner.parallel_pending.push(Task::new(move || {
                let _resume = ResumeOnDrop::new(warp);
                f();
            }));
            resume_guard.disarm();
            self.flush();
        }
    }

    /// Hand every pending parallel task to the pool. Caller must own the
    /// warp.
    pub(crate) fn execute_parallel(&self) {
        while self.has_parallel() {
            let mut list = self.inner.parallel_pending.take_all();
            while let Some(task) = list.pop() {
                debug_assert!(self.is_suspended());
                self.inner.pool.submit_task(task, self.inner.priority);
            }
        }
    }

    /// Request a drain. Queues at most one drain task; an executing drain
    /// re-queues itself when it sees the pending mark on exit.
    pub(crate) fn flush(&self) {
        if self.inner.queue_state.load(Ordering::Acquire) != QUEUE_PENDING
            && self
                .inner
                .queue_state
                .swap(QUEUE_PENDING, Ordering::AcqRel)
                == QUEUE_IDLE
        {
            let warp = self.clone();
            self.inner
                .pool
                .submit(move || warp.execute(), self.inner.priority);
        }
    }

    /// The drain task body.
    fn execute(&self) {
        if !self.is_suspended() {
            // if acquisition fails, another thread is already draining
            let mut guard = self.preempt_guard(0);
            if guard.engaged() {
                self.execute_parallel();

                if !self.is_suspended() {
                    self.drain_storage(false);
                    guard.cleanup();
                    if !self.yield_now() {
                        // a task inside the drain yielded us already; make
                        // sure the remainder gets another drain
                        self.flush();
                    }
                } else {
                    self.inner
                        .queue_state
                        .store(QUEUE_PENDING, Ordering::Relaxed);
                }
            }
        }

        // parallel tasks may run even while suspended
        if self.has_parallel() {
            let guard = self.preempt_guard(usize::MAX);
            if guard.engaged() {
                self.execute_parallel();
            }
        }
    }

    /// Run queued tasks until the storage drains, the warp is suspended
    /// (unless `force`), or ownership is displaced. Caller must own the
    /// warp.
    pub(crate) fn drain_storage(&self, force: bool) {
        self.inner
            .queue_state
            .store(QUEUE_EXECUTING, Ordering::Release);

        match &self.inner.storage {
            Storage::Strand(s) => self.drain_strand(s, force),
            Storage::Grid(g) => self.drain_grid(g, force),
        }
    }

    fn drain_strand(&self, storage: &StrandStorage, force: bool) {
        loop {
            let mut executed = 0usize;

            let mut batch = storage.executing.lock().unwrap().take();
            if batch.is_empty() {
                batch = storage.queueing.take_all();
                batch.reverse();
            }

            {
                // keep the remainder reachable if we stop mid-batch
                let mut carry = StoreBatchOnDrop {
                    slot: &storage.executing,
                    batch,
                };

                while let Some(task) = carry.batch.pop() {
                    task.run();
                    executed += 1;

                    if (!force && self.is_suspended()) || !self.is_current() {
                        return;
                    }
                }
            }

            if executed == 0 {
                break;
            }
        }
    }

    fn drain_grid(&self, storage: &GridStorage, force: bool) {
        let mut guard = storage.cursor.borrow_mut();
        let cursor = &mut *guard;

        loop {
            let mut executed = 0usize;
            let mut step_version = cursor.current;

            for i in 0..storage.rings.len() {
                cursor.next = cursor.versions[i];

                // consume this ring only up to the current barrier window
                while (cursor.current.wrapping_sub(cursor.versions[i]) as isize) >= 0 {
                    let Some(task) = storage.rings[i].pop() else {
                        break;
                    };

                    match task {
                        GridTask::Run(f) => f(),
                        GridTask::Fence(version) => cursor.next = version,
                    }
                    executed += 1;
                    cursor.versions[i] = cursor.next;

                    if (!force && self.is_suspended()) || !self.is_current() {
                        return;
                    }
                }

                if cursor.current.wrapping_add(1) == cursor.versions[i] {
                    step_version = cursor.versions[i];
                } else if (cursor.current.wrapping_sub(cursor.versions[i]) as isize) > 0 {
                    // a stale ring version from a counter wrap; clamp it
                    cursor.versions[i] = cursor.current;
                }
            }

            cursor.current = step_version;
            if executed == 0 {
                break;
            }
        }
    }

    /// Drain this warp to empty, suspending it for the duration. `waiter`
    /// runs whenever ownership is unavailable (a poll of the pool is a good
    /// choice). Returns true when the warp was already empty.
    pub fn join(&self, waiter: impl FnMut()) -> bool {
        Self::join_inner(std::slice::from_ref(self), waiter, false)
    }

    /// [`join`](Warp::join) over a set of warps.
    pub fn join_all(warps: &[Warp], waiter: impl FnMut()) -> bool {
        Self::join_inner(warps, waiter, false)
    }

    /// Drain without the suspend/resume wrapping. Used at teardown when the
    /// warps must end up empty and unsuspended.
    pub fn drain(&self, waiter: impl FnMut()) -> bool {
        Self::join_inner(std::slice::from_ref(self), waiter, true)
    }

    pub fn drain_all(warps: &[Warp], waiter: impl FnMut()) -> bool {
        Self::join_inner(warps, waiter, true)
    }

    fn join_inner(warps: &[Warp], mut waiter: impl FnMut(), finalizing: bool) -> bool {
        trace!("joining {} warp(s)", warps.len());

        if !finalizing {
            for warp in warps {
                warp.suspend();
            }
        }

        let mut empty = true;
        for warp in warps {
            empty = empty && warp.is_empty() && !warp.has_parallel();

            loop {
                let guard = warp.preempt_guard(usize::MAX);
                if !guard.engaged() {
                    waiter();
                    continue;
                }

                warp.execute_parallel();

                // wait until nobody else holds a suspension
                let expected = usize::from(!finalizing);
                if warp.inner.suspend_count.load(Ordering::Acquire) == expected {
                    warp.drain_storage(true);
                    break;
                }
            }
        }

        if !finalizing {
            for warp in warps {
                warp.resume();
            }
        }

        empty
    }
}

impl Drop for WarpInner {
    fn drop(&mut self) {
        // join before dropping the last handle
        assert!(
            self.storage.is_empty() && self.parallel_pending.is_empty(),
            "warp dropped with queued tasks"
        );
    }
}

/// Writes a partially drained batch back into the carryover slot on every
/// exit path.
struct StoreBatchOnDrop<'a> {
    slot: &'a Mutex<TaskList>,
    batch: TaskList,
}

impl Drop for StoreBatchOnDrop<'_> {
    fn drop(&mut self) {
        *self.slot.lock().unwrap() = self.batch.take();
    }
}
