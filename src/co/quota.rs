//! Multi-dimensional quotas.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Waker};

/// A semaphore over `N` independent dimensions. An acquisition takes its
/// amounts across all dimensions or none of them; a partial take is backed
/// out before reporting failure.
pub struct Quota<const N: usize> {
    quantities: [AtomicUsize; N],
}

impl<const N: usize> Quota<N> {
    pub fn new(capacity: [usize; N]) -> Self {
        Self {
            quantities: capacity.map(AtomicUsize::new),
        }
    }

    /// Take `amount` from every dimension, or nothing. Returns whether the
    /// take succeeded.
    pub fn acquire(&self, amount: &[usize; N]) -> bool {
        for i in 0..N {
            let wanted = amount[i];
            if wanted == 0 {
                continue;
            }

            let quantity = &self.quantities[i];
            let mut available = quantity.load(Ordering::Acquire);
            let taken = loop {
                if available < wanted {
                    break false;
                }
                match quantity.compare_exchange_weak(
                    available,
                    available - wanted,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break true,
                    Err(current) => available = current,
                }
            };

            if !taken {
                // back out what the earlier dimensions already gave
                for k in 0..i {
                    if amount[k] != 0 {
                        self.quantities[k].fetch_add(amount[k], Ordering::Release);
                    }
                }
                return false;
            }
        }

        true
    }

    pub fn release(&self, amount: &[usize; N]) {
        for i in 0..N {
            if amount[i] != 0 {
                self.quantities[i].fetch_add(amount[i], Ordering::Release);
            }
        }
    }

    /// A snapshot of the available amounts; dimensions are read one by one,
    /// so the snapshot is only exact at quiescence.
    pub fn get(&self) -> [usize; N] {
        std::array::from_fn(|i| self.quantities[i].load(Ordering::Acquire))
    }
}

struct QuotaWaiter<const N: usize> {
    amount: [usize; N],
    /// Set once the releaser has acquired on this waiter's behalf.
    granted: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

struct QueueInner<const N: usize> {
    quota: Quota<N>,
    waiters: Mutex<VecDeque<Arc<QuotaWaiter<N>>>>,
}

/// An async front for a [`Quota`]: [`guard`](QuotaQueue::guard) suspends the
/// caller until the requested amounts are available and hands back a
/// [`QuotaGuard`] that returns them on drop. Waiters are served in FIFO
/// order; a release acquires on behalf of the frontmost waiters it can
/// satisfy.
#[derive(Clone)]
pub struct QuotaQueue<const N: usize> {
    inner: Arc<QueueInner<N>>,
}

impl<const N: usize> QuotaQueue<N> {
    pub fn new(quota: Quota<N>) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                quota,
                waiters: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Immediate all-or-nothing take, bypassing the waiter queue.
    pub fn acquire(&self, amount: &[usize; N]) -> bool {
        self.inner.quota.acquire(amount)
    }

    /// Return amounts and serve whichever queued waiters now fit.
    pub fn release(&self, amount: &[usize; N]) {
        self.inner.quota.release(amount);
        self.drain_waiters();
    }

    pub fn get(&self) -> [usize; N] {
        self.inner.quota.get()
    }

    /// Await `amount` across all dimensions; resolves to a [`QuotaGuard`]
    /// holding them.
    pub fn guard(&self, amount: [usize; N]) -> QuotaAcquire<N> {
        QuotaAcquire {
            queue: self.clone(),
            amount,
            waiter: None,
        }
    }

    fn drain_waiters(&self) {
        loop {
            let granted = {
                let mut waiters = self.inner.waiters.lock().unwrap();
                let Some(front) = waiters.front() else {
                    return;
                };
                if !self.inner.quota.acquire(&front.amount) {
                    return;
                }
                let front = waiters.pop_front().expect("front vanished under lock");
                front.granted.store(true, Ordering::Release);
                front
            };

            let waker = granted.waker.lock().unwrap().take();
            if let Some(waker) = waker {
                waker.wake();
            }
        }
    }
}

pub struct QuotaAcquire<const N: usize> {
    queue: QuotaQueue<N>,
    amount: [usize; N],
    waiter: Option<Arc<QuotaWaiter<N>>>,
}

impl<const N: usize> Future for QuotaAcquire<N> {
    type Output = QuotaGuard<N>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<QuotaGuard<N>> {
        let this = self.get_mut();

        if let Some(waiter) = &this.waiter {
            if waiter.granted.load(Ordering::Acquire) {
                return Poll::Ready(QuotaGuard::new(this.queue.clone(), this.amount));
            }
            *waiter.waker.lock().unwrap() = Some(cx.waker().clone());
            if waiter.granted.load(Ordering::Acquire) {
                return Poll::Ready(QuotaGuard::new(this.queue.clone(), this.amount));
            }
            return Poll::Pending;
        }

        if this.queue.inner.quota.acquire(&this.amount) {
            return Poll::Ready(QuotaGuard::new(this.queue.clone(), this.amount));
        }

        let waiter = Arc::new(QuotaWaiter {
            amount: this.amount,
            granted: AtomicBool::new(false),
            waker: Mutex::new(Some(cx.waker().clone())),
        });
        this.queue
            .inner
            .waiters
            .lock()
            .unwrap()
            .push_back(Arc::clone(&waiter));
        this.waiter = Some(waiter);

        // a release may have run between the failed acquire and the enqueue
        this.queue.drain_waiters();
        Poll::Pending
    }
}

/// Held amounts, returned to the queue on drop.
pub struct QuotaGuard<const N: usize> {
    queue: Option<QuotaQueue<N>>,
    amount: [usize; N],
}

impl<const N: usize> QuotaGuard<N> {
    fn new(queue: QuotaQueue<N>, amount: [usize; N]) -> Self {
        Self {
            queue: Some(queue),
            amount,
        }
    }

    pub fn amount(&self) -> &[usize; N] {
        &self.amount
    }

    /// Return the amounts now instead of at scope end.
    pub fn release_now(mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release(&self.amount);
        }
    }
}

impl<const N: usize> Drop for QuotaGuard<N> {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            queue.release(&self.amount);
        }
    }
}
