//! Counting barrier and frame broadcast.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use atomic_refcell::AtomicRefCell;

type CycleFn<V> = Box<dyn FnMut(&Barrier<V>) + Send>;

/// A reusable barrier for `max_await` arrivers carrying a published value.
///
/// Each [`wait`](Barrier::wait) or [`release`](Barrier::release) counts as
/// an arrival; when the count reaches the threshold, every parked task is
/// released with a clone of the current value and the barrier returns to the
/// counting phase. `release(n)` also lowers the threshold by `n` for the
/// following cycles, letting a participant bow out permanently.
pub struct Barrier<V = bool> {
    max_await: AtomicUsize,
    await_count: AtomicUsize,
    release_count: AtomicUsize,
    slots: Mutex<Vec<Option<Waker>>>,
    value: Mutex<V>,
    on_cycle: AtomicRefCell<Option<CycleFn<V>>>,
}

// `on_cycle` is only ever borrowed while completing a cycle (mutually
// exclusive by construction: exactly one arrival transitions the barrier
// through `complete`) or while installing the callback before any cycle
// runs, so concurrent aliasing never happens despite the boxed callback not
// being `Sync` on its own.
unsafe impl<V: Send> Sync for Barrier<V> {}

impl<V: Clone + Default + Send> Barrier<V> {
    pub fn new(max_await: usize) -> Self {
        Self::with_value(max_await, V::default())
    }
}

impl<V: Clone + Send> Barrier<V> {
    pub fn with_value(max_await: usize, value: V) -> Self {
        assert!(max_await > 0, "barrier needs at least one arriver");
        Self {
            max_await: AtomicUsize::new(max_await),
            await_count: AtomicUsize::new(0),
            release_count: AtomicUsize::new(0),
            slots: Mutex::new((0..max_await).map(|_| None).collect()),
            value: Mutex::new(value),
            on_cycle: AtomicRefCell::new(None),
        }
    }

    pub fn wait(&self) -> BarrierWait<'_, V> {
        BarrierWait {
            barrier: self,
            parked: false,
        }
    }

    /// Arrive without waiting and permanently lower the threshold by
    /// `count` once the current cycle completes.
    pub fn release(&self, count: usize) {
        self.release_count.fetch_add(count, Ordering::Relaxed);
        let index = self.await_count.fetch_add(count, Ordering::AcqRel);
        let max = self.max_await.load(Ordering::Acquire);
        assert!(index + count <= max, "barrier overcommitted");
        if index + count == max {
            self.complete();
        }
    }

    /// Arrive without waiting, keeping the threshold.
    pub fn arrive(&self) {
        self.arrive_with(None);
    }

    /// Install a callback invoked once per completed cycle, before the
    /// waiters are released.
    pub fn on_cycle(&self, callback: impl FnMut(&Barrier<V>) + Send + 'static) {
        *self.on_cycle.borrow_mut() = Some(Box::new(callback));
    }

    pub fn set_value(&self, value: V) {
        *self.value.lock().unwrap() = value;
    }

    pub fn value(&self) -> V {
        self.value.lock().unwrap().clone()
    }

    pub fn await_count(&self) -> usize {
        self.await_count.load(Ordering::Acquire)
    }

    pub fn max_await_count(&self) -> usize {
        self.max_await.load(Ordering::Acquire)
    }

    fn arrive_with(&self, waker: Option<Waker>) {
        let index = self.await_count.fetch_add(1, Ordering::AcqRel);
        let max = self.max_await.load(Ordering::Acquire);
        assert!(index < max, "barrier overcommitted");

        if let Some(waker) = waker {
            self.slots.lock().unwrap()[index] = Some(waker);
        }

        if index + 1 == max {
            self.complete();
        }
    }

    /// The last arriver runs this; every counter resets and the parked
    /// tasks are released.
    fn complete(&self) {
        let max = self.max_await.load(Ordering::Acquire);
        let arrived = self.await_count.swap(0, Ordering::AcqRel);
        debug_assert_eq!(arrived, max);

        let released = self.release_count.swap(0, Ordering::AcqRel);
        self.max_await.store(max - released, Ordering::Release);

        // take-call-restore so the callback may reinstall itself
        let callback = self.on_cycle.borrow_mut().take();
        if let Some(mut callback) = callback {
            callback(self);
            let mut slot = self.on_cycle.borrow_mut();
            if slot.is_none() {
                *slot = Some(callback);
            }
        }

        let wakers: Vec<Waker> = {
            let mut slots = self.slots.lock().unwrap();
            (0..max).filter_map(|i| slots[i].take()).collect()
        };
        for waker in wakers {
            waker.wake();
        }
    }
}

pub struct BarrierWait<'a, V> {
    barrier: &'a Barrier<V>,
    parked: bool,
}

impl<V: Clone + Send> Future for BarrierWait<'_, V> {
    type Output = V;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<V> {
        let this = self.get_mut();

        if this.parked {
            return Poll::Ready(this.barrier.value());
        }

        this.parked = true;
        this.barrier.arrive_with(Some(cx.waker().clone()));
        Poll::Pending
    }
}

/// An edge-triggered broadcast for frame-stepped pipelines.
///
/// Awaiting always parks, even right after a dispatch; each
/// [`dispatch`](Frame::dispatch) advances the frame and releases everything
/// parked so far.
pub struct Frame {
    version: AtomicUsize,
    waiters: Mutex<Vec<Waker>>,
}

impl Frame {
    pub fn new() -> Self {
        Self {
            version: AtomicUsize::new(0),
            waiters: Mutex::new(Vec::new()),
        }
    }

    /// Start the next frame, releasing every parked task.
    pub fn dispatch(&self) {
        let woken = {
            let mut waiters = self.waiters.lock().unwrap();
            self.version.fetch_add(1, Ordering::AcqRel);
            std::mem::take(&mut *waiters)
        };
        for waker in woken {
            waker.wake();
        }
    }

    pub fn version(&self) -> usize {
        self.version.load(Ordering::Acquire)
    }

    pub fn wait(&self) -> FrameWait<'_> {
        FrameWait {
            frame: self,
            parked: false,
        }
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FrameWait<'a> {
    frame: &'a Frame,
    parked: bool,
}

impl Future for FrameWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        if this.parked {
            return Poll::Ready(());
        }

        this.parked = true;
        this.frame.waiters.lock().unwrap().push(cx.waker().clone());
        Poll::Pending
    }
}
