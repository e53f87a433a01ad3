//! The worker pool.
//!
//! [`WorkerPool`] owns the OS threads and drives the lifecycle
//! (start/terminate/join/finalize). [`PoolHandle`] is the cheap, cloneable
//! submitter held by warps, dispatchers and async task cores.
//!
//! Task storage is an array of `bands x 4` atomic head pointers, where
//! `bands` is the internal thread count. Each band is a priority level (band
//! 0 is the most urgent) and the four duplicate heads per band spread
//! submission contention. A `priority` argument plays two roles: on
//! [`PoolHandle::submit`] it is a producer hint selecting the band to push
//! to, and on [`PoolHandle::poll`] it is a consumer filter bounding which
//! bands may be drained. A thread polling with priority `k` never consumes a
//! task from a band above `k`, which deliberately lets urgent threads starve
//! background work.

use std::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use log::{debug, trace};

use crate::task::{Task, TaskList};

/// Duplicate head pointers per priority band.
const TASK_HEAD_DUPLICATES: usize = 4;

std::thread_local! {
    /// Index of the current pool thread, `None` on threads the pool has
    /// never been told about.
    static WORKER_INDEX: std::cell::Cell<Option<usize>> = const { std::cell::Cell::new(None) };
}

/// The pool-thread index of the calling thread, as bound by the worker loop
/// or by [`PoolHandle::make_current`]. `None` for foreign threads.
pub fn current_worker_index() -> Option<usize> {
    WORKER_INDEX.with(|x| x.get())
}

struct PoolShared {
    /// `bands * TASK_HEAD_DUPLICATES` head pointers; slot `band + k * bands`
    /// is duplicate `k` of `band`.
    heads: Box<[AtomicPtr<Task>]>,
    bands: usize,
    task_count: AtomicUsize,
    running_count: AtomicUsize,
    /// Threads parked on the idle condvar.
    waiting_count: AtomicUsize,
    /// The lowest `limit` bands do not wake parked threads.
    limit_count: AtomicUsize,
    terminated: AtomicBool,
    /// False before `start()` and after `join()`; when false, submissions
    /// land on the finalize list instead of the head array.
    heads_live: AtomicBool,
    idle_lock: Mutex<()>,
    idle_cond: Condvar,
    finalize: Mutex<TaskList>,
    thread_total: AtomicUsize,
}

/// Owner of the worker threads.
pub struct WorkerPool {
    shared: Arc<PoolShared>,
    threads: Vec<std::thread::JoinHandle<()>>,
    internal_threads: usize,
}

/// A cloneable submission/polling handle onto a [`WorkerPool`].
#[derive(Clone)]
pub struct PoolHandle {
    shared: Arc<PoolShared>,
}

impl WorkerPool {
    /// A pool with `threads` internal worker threads (and as many priority
    /// bands, at least one). Threads are not spawned until [`start`].
    ///
    /// [`start`]: WorkerPool::start
    pub fn new(threads: usize) -> Self {
        Self {
            shared: Arc::new(Self::build_shared(threads)),
            threads: Vec::new(),
            internal_threads: threads,
        }
    }

    fn build_shared(threads: usize) -> PoolShared {
        let bands = threads.max(1);
        let heads = (0..bands * TASK_HEAD_DUPLICATES)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        PoolShared {
            heads,
            bands,
            task_count: AtomicUsize::new(0),
            running_count: AtomicUsize::new(0),
            waiting_count: AtomicUsize::new(0),
            limit_count: AtomicUsize::new(0),
            terminated: AtomicBool::new(true),
            heads_live: AtomicBool::new(false),
            idle_lock: Mutex::new(()),
            idle_cond: Condvar::new(),
            finalize: Mutex::new(TaskList::new()),
            thread_total: AtomicUsize::new(threads),
        }
    }

    /// Change the internal thread count. Must be called before [`start`] and
    /// before any handle is taken.
    ///
    /// [`start`]: WorkerPool::start
    pub fn resize(&mut self, threads: usize) {
        assert!(self.threads.is_empty(), "resize() after start()");
        assert_eq!(
            Arc::strong_count(&self.shared),
            1,
            "resize() with outstanding handles"
        );
        self.shared = Arc::new(Self::build_shared(threads));
        self.internal_threads = threads;
    }

    /// Reserve a thread slot for an externally driven thread. The external
    /// thread binds itself with [`PoolHandle::make_current`] and drives work
    /// with [`PoolHandle::poll`] / [`PoolHandle::poll_delay`]. Must be called
    /// before [`start`].
    ///
    /// [`start`]: WorkerPool::start
    pub fn append_external(&mut self) -> usize {
        assert!(self.threads.is_empty(), "append_external() after start()");
        self.shared.thread_total.fetch_add(1, Ordering::AcqRel)
    }

    /// Spawn the internal worker threads.
    pub fn start(&mut self) {
        self.start_inner(&[]);
    }

    /// Spawn the internal worker threads, pinning thread `i` to
    /// `cpu_ids[i % cpu_ids.len()]` where that entry is `Some`.
    pub fn start_pinned(&mut self, cpu_ids: &[Option<u32>]) {
        self.start_inner(cpu_ids);
    }

    fn start_inner(&mut self, cpu_ids: &[Option<u32>]) {
        assert!(self.threads.is_empty(), "start() while already running");

        debug!("starting pool with {} threads", self.internal_threads);
        self.shared.heads_live.store(true, Ordering::Release);
        self.shared.terminated.store(false, Ordering::Release);

        for i in 0..self.internal_threads {
            let shared = Arc::clone(&self.shared);
            let cpu_id = cpu_ids.get(i % cpu_ids.len().max(1)).copied().flatten();
            let handle = std::thread::Builder::new()
                .name("weft-worker".to_string())
                .spawn(move || work_loop(i, cpu_id, shared))
                .unwrap();
            self.threads.push(handle);
        }
    }

    /// A submission/polling handle.
    pub fn handle(&self) -> PoolHandle {
        PoolHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Ask the workers to exit after their current task and wake everyone.
    pub fn terminate(&self) {
        debug!("terminating pool");
        self.shared.terminated.store(true, Ordering::Release);
        self.handle().wake_all();
    }

    /// Wait for the worker threads to exit, then drain the head array on the
    /// calling thread. Tasks queued from here on land on the finalize list.
    pub fn join(&mut self) {
        assert!(
            self.shared.terminated.load(Ordering::Acquire),
            "join() without terminate()"
        );

        for handle in self.threads.drain(..) {
            handle.join().expect("a worker thread panicked");
        }

        if self.shared.heads_live.load(Ordering::Acquire) {
            assert_eq!(self.shared.running_count.load(Ordering::Acquire), 0);
            // executing residue may queue more residue
            while !self.shared.cleanup_heads() {}
            self.shared.heads_live.store(false, Ordering::Release);
        }

        while !self.finalize() {}
        debug!("pool joined");
    }

    /// Run tasks stranded after [`join`] on the calling thread. Returns true
    /// once the finalize list is empty.
    ///
    /// [`join`]: WorkerPool::join
    pub fn finalize(&self) -> bool {
        self.shared.finalize_once()
    }

    /// The number of pool threads, external slots included.
    pub fn thread_count(&self) -> usize {
        self.shared.thread_total.load(Ordering::Acquire)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.terminate();
        self.join();
        while !self.finalize() {}
        assert_eq!(
            self.shared.task_count.load(Ordering::Acquire),
            0,
            "pool dropped with live tasks"
        );
    }
}

/// Decrements the running count on all exit paths.
struct RunningGuard<'a>(&'a AtomicUsize);

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Release);
    }
}

impl PoolHandle {
    /// Queue `f` onto the band selected by `priority` (clamped to the band
    /// count). `priority` is a producer hint here; see the module docs for
    /// its consumer role in [`poll`].
    ///
    /// [`poll`]: PoolHandle::poll
    pub fn submit(&self, f: impl FnOnce() + Send + 'static, priority: usize) {
        self.submit_task(Task::new(f), priority);
    }

    pub(crate) fn submit_task(&self, task: Box<Task>, priority: usize) {
        let shared = &*self.shared;
        shared.task_count.fetch_add(1, Ordering::Relaxed);
        let raw = Box::into_raw(task);

        if !self.is_terminated() {
            let band = priority.min(shared.bands - 1);
            let current = current_worker_index().unwrap_or(0);

            // probe the duplicate heads for an empty slot first
            let mut best_k = 0;
            let mut max_diff = isize::MIN;
            for n in 0..TASK_HEAD_DUPLICATES {
                let k = (n + current) % TASK_HEAD_DUPLICATES;
                let head = &shared.heads[band + k * shared.bands];
                match head.compare_exchange(
                    std::ptr::null_mut(),
                    raw,
                    Ordering::Release,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        shared.wake_one_for(band);
                        return;
                    }
                    Err(expected) => {
                        // prefer the head whose chain is farthest away, a
                        // cheap balance heuristic over the sharded allocations
                        let diff = (raw as isize).wrapping_sub(expected as isize);
                        if diff >= max_diff {
                            max_diff = diff;
                            best_k = k;
                        }
                    }
                }
            }

            // all duplicates occupied, chain onto the chosen one
            let head = &shared.heads[band + best_k * shared.bands];
            push_raw(head, raw);
            shared.wake_one_for(band);
        } else if shared.heads_live.load(Ordering::Acquire) {
            // terminate requested but not yet joined; the cleanup pass will
            // run this
            push_raw(&shared.heads[0], raw);
        } else {
            // SAFETY: the node was never published, we still own it
            let task = unsafe { Box::from_raw(raw) };
            shared.finalize_push(task);
        }
    }

    /// Drain one task whose band is at most `priority`. Returns true if a
    /// task slot was claimed.
    pub fn poll(&self, priority: usize) -> bool {
        self.shared.running_count.fetch_add(1, Ordering::Acquire);
        let _running = RunningGuard(&self.shared.running_count);
        self.shared
            .poll_bands(priority.saturating_add(1).min(self.shared.bands))
    }

    /// [`poll`], then on failure a bounded wait on the idle condvar and one
    /// retry. Returns false if no matching task was found.
    ///
    /// [`poll`]: PoolHandle::poll
    pub fn poll_delay(&self, priority: usize, timeout: Duration) -> bool {
        if self.poll(priority) {
            return true;
        }

        {
            let guard = self.shared.idle_lock.lock().unwrap();
            let (_guard, _timed_out) = self.shared.idle_cond.wait_timeout(guard, timeout).unwrap();
        }

        if self.poll(priority) {
            true
        } else {
            // the priority restriction may have skipped a task some other
            // thread can take
            self.shared.wake_one_for(0);
            false
        }
    }

    /// Bind the calling thread to pool slot `index` so submissions and grid
    /// warps route through its per-thread structures.
    pub fn make_current(&self, index: usize) {
        assert!(index < self.shared.thread_total.load(Ordering::Acquire));
        WORKER_INDEX.with(|x| x.set(Some(index)));
    }

    pub fn clear_current(&self) {
        WORKER_INDEX.with(|x| x.set(None));
    }

    /// Keep the lowest `limit` bands from waking parked threads, throttling
    /// concurrency without touching the queues.
    pub fn limit(&self, limit: usize) {
        self.shared.limit_count.store(limit, Ordering::Release);
    }

    pub fn thread_count(&self) -> usize {
        self.shared.thread_total.load(Ordering::Acquire)
    }

    /// Queued tasks across all bands and the finalize list.
    pub fn task_count(&self) -> usize {
        self.shared.task_count.load(Ordering::Acquire)
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn wake_one(&self) {
        let _guard = self.shared.idle_lock.lock().unwrap();
        self.shared.idle_cond.notify_one();
    }

    pub fn wake_all(&self) {
        let _guard = self.shared.idle_lock.lock().unwrap();
        self.shared.idle_cond.notify_all();
    }
}

fn push_raw(head: &AtomicPtr<Task>, raw: *mut Task) {
    let mut node = head.load(Ordering::Relaxed);
    loop {
        // SAFETY: we own `raw` until the CAS publishes it
        unsafe { (*raw).next = node };
        match head.compare_exchange_weak(node, raw, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return,
            Err(current) => node = current,
        }
    }
}

impl PoolShared {
    fn wake_one_for(&self, band: usize) {
        if self.waiting_count.load(Ordering::Acquire) > band + self.limit_count.load(Ordering::Relaxed)
        {
            let _guard = self.idle_lock.lock().unwrap();
            self.idle_cond.notify_one();
        }
    }

    /// Locate a non-empty head among the first `band_limit` bands, scanning
    /// duplicates from the current thread's slot.
    fn fetch(&self, band_limit: usize) -> Option<(usize, usize)> {
        let current = current_worker_index().unwrap_or(0);
        for k in 0..TASK_HEAD_DUPLICATES {
            for band in 0..band_limit.min(self.bands) {
                let index = ((k + current) % TASK_HEAD_DUPLICATES) * self.bands + band;
                if !self.heads[index].load(Ordering::Acquire).is_null() {
                    return Some((index, band));
                }
            }
        }
        None
    }

    /// Poll considering only bands below `band_limit`. Returns true if a
    /// candidate head was found, even if another thread raced us to it.
    fn poll_bands(&self, band_limit: usize) -> bool {
        let Some((index, band)) = self.fetch(band_limit) else {
            return false;
        };

        let head = &self.heads[index];
        let task = head.swap(std::ptr::null_mut(), Ordering::Acquire);
        if !task.is_null() {
            // SAFETY: the whole chain is ours after the exchange
            let next = unsafe { (*task).next };
            // put the remainder back in one shot; anything pushed in the
            // window comes back to us and is re-chained node by node
            let mut displaced = head.swap(next, Ordering::AcqRel);
            if !displaced.is_null() {
                while !displaced.is_null() {
                    // SAFETY: displaced nodes are exclusively ours until
                    // re-published by push_raw
                    let after = unsafe { (*displaced).next };
                    push_raw(head, displaced);
                    displaced = after;
                }
                std::sync::atomic::fence(Ordering::AcqRel);
                self.wake_one_for(band);
            }

            self.execute_raw(task);
        }

        true
    }

    /// The worker loop's poll: the more threads already running, the fewer
    /// bands this one considers, leaving urgent bands for the least busy.
    fn poll_auto(&self) -> bool {
        let inverse = self.running_count.fetch_add(1, Ordering::Acquire);
        let _running = RunningGuard(&self.running_count);
        let budget = self.bands + 1 - (inverse + 1).min(self.bands);
        self.poll_bands(budget.min(self.bands))
    }

    fn execute_raw(&self, raw: *mut Task) {
        self.task_count.fetch_sub(1, Ordering::Release);
        // SAFETY: `raw` was detached from its head; we own it
        let mut task = unsafe { Box::from_raw(raw) };
        task.next = std::ptr::null_mut();
        task.run();
    }

    /// Park until something wakes us, unless a task shows up while we hold
    /// the lock.
    fn delay(&self) {
        if self.terminated.load(Ordering::Acquire) {
            return;
        }

        let guard = self.idle_lock.lock().unwrap();
        self.waiting_count.fetch_add(1, Ordering::Release);
        if self.fetch(self.bands).is_none() && !self.terminated.load(Ordering::Acquire) {
            let guard = self.idle_cond.wait(guard).unwrap();
            self.waiting_count.fetch_sub(1, Ordering::Release);
            drop(guard);
        } else {
            self.waiting_count.fetch_sub(1, Ordering::Release);
            drop(guard);
        }
    }

    /// Drain every head on the calling thread. Returns true when all heads
    /// were already empty.
    fn cleanup_heads(&self) -> bool {
        let mut empty = true;
        for head in self.heads.iter() {
            let mut task = head.swap(std::ptr::null_mut(), Ordering::Acquire);
            empty = empty && task.is_null();

            while !task.is_null() {
                // SAFETY: the chain is ours after the exchange
                let next = unsafe { (*task).next };
                let mut displaced = head.swap(next, Ordering::AcqRel);
                while !displaced.is_null() {
                    // SAFETY: as above, ours until re-published
                    let after = unsafe { (*displaced).next };
                    push_raw(head, displaced);
                    displaced = after;
                }

                self.execute_raw(task);
                task = head.swap(std::ptr::null_mut(), Ordering::Acquire);
            }
        }
        empty
    }

    fn finalize_push(&self, task: Box<Task>) {
        self.finalize.lock().unwrap().push_front(task);
    }

    fn finalize_once(&self) -> bool {
        assert!(
            self.terminated.load(Ordering::Acquire),
            "finalize() before terminate()"
        );

        let mut list = {
            let mut guard = self.finalize.lock().unwrap();
            guard.take()
        };
        if list.is_empty() {
            return true;
        }

        while let Some(task) = list.pop() {
            self.task_count.fetch_sub(1, Ordering::Release);
            task.run();
        }
        false
    }
}

fn work_loop(index: usize, cpu_id: Option<u32>, shared: Arc<PoolShared>) {
    WORKER_INDEX.with(|x| x.set(Some(index)));
    trace!("worker {index} up");

    if let Some(cpu_id) = cpu_id {
        let mut cpus = nix::sched::CpuSet::new();
        cpus.set(cpu_id as usize).unwrap();
        nix::sched::sched_setaffinity(nix::unistd::Pid::from_raw(0), &cpus).unwrap();
    }

    while !shared.terminated.load(Ordering::Acquire) {
        if !shared.poll_auto() {
            shared.delay();
        }
    }

    trace!("worker {index} down");
    WORKER_INDEX.with(|x| x.set(None));
}
