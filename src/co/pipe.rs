//! A multi-producer / multi-consumer value pipe.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::collections::VecDeque;
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

use crossbeam::queue::SegQueue;

/// Values flow from [`push`](Pipe::push) to awaited [`recv`](Pipe::recv)
/// calls. Two counters pair producers with consumers: `prepared` counts
/// values no consumer has claimed yet, `waiting` counts consumers parked
/// without a value. A push either hands its value to a parked consumer
/// (CAS-decrementing `waiting`) or banks it in `prepared`; a receive
/// mirrors that exactly.
pub struct Pipe<T> {
    elements: SegQueue<T>,
    waiters: Mutex<VecDeque<Waker>>,
    prepared: AtomicUsize,
    waiting: AtomicUsize,
}

impl<T: Send> Pipe<T> {
    pub fn new() -> Self {
        Self {
            elements: SegQueue::new(),
            waiters: Mutex::new(VecDeque::new()),
            prepared: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Produce a value, releasing one parked consumer if there is one.
    pub fn push(&self, value: T) {
        self.elements.push(value);

        // fast path: claim a parked consumer
        if self.flush_waiting() {
            let waker = self
                .waiters
                .lock()
                .unwrap()
                .pop_front()
                .expect("waiting count out of sync with parked wakers");
            waker.wake();
            return;
        }

        let mut waiters = self.waiters.lock().unwrap();
        // retry under the lock in case a consumer parked meanwhile
        if self.flush_waiting() {
            let waker = waiters
                .pop_front()
                .expect("waiting count out of sync with parked wakers");
            drop(waiters);
            waker.wake();
            return;
        }

        // no consumer; bank the value
        self.prepared.fetch_add(1, Ordering::Release);
    }

    pub fn recv(&self) -> PipeRecv<'_, T> {
        PipeRecv {
            pipe: self,
            parked: false,
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Claim one banked value.
    fn flush_prepared(&self) -> bool {
        let mut prepared = self.prepared.load(Ordering::Acquire);
        while prepared != 0 {
            match self.prepared.compare_exchange(
                prepared,
                prepared - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => prepared = current,
            }
        }
        false
    }

    /// Claim one parked consumer.
    fn flush_waiting(&self) -> bool {
        let mut waiting = self.waiting.load(Ordering::Acquire);
        while waiting != 0 {
            match self.waiting.compare_exchange(
                waiting,
                waiting - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => waiting = current,
            }
        }
        false
    }

    fn take_element(&self) -> T {
        self.elements
            .pop()
            .expect("pipe consumer claimed without an element")
    }
}

impl<T: Send> Default for Pipe<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct PipeRecv<'a, T> {
    pipe: &'a Pipe<T>,
    parked: bool,
}

impl<T: Send> Future for PipeRecv<'_, T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let this = self.get_mut();

        if this.parked {
            // released by a producer; the matching element is committed
            return Poll::Ready(this.pipe.take_element());
        }

        // fast path: claim a banked value
        if this.pipe.flush_prepared() {
            return Poll::Ready(this.pipe.take_element());
        }

        let mut waiters = this.pipe.waiters.lock().unwrap();
        if this.pipe.flush_prepared() {
            drop(waiters);
            return Poll::Ready(this.pipe.take_element());
        }

        waiters.push_back(cx.waker().clone());
        this.pipe.waiting.fetch_add(1, Ordering::Release);
        this.parked = true;
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
    fn test_spsc_preserves_order() {
        let mut pool = WorkerPool::new(2);
        pool.start();
        let handle = pool.handle();

        let pipe = Arc::new(Pipe::new());
        let pipe2 = Arc::clone(&pipe);
        let consumer = AsyncTask::new(&handle, async move {
            let mut collected = Vec::with_capacity(1000);
            for _ in 0..1000 {
                collected.push(pipe2.recv().await);
            }
            collected
        });

        let pipe3 = Arc::clone(&pipe);
        let (sender, receiver) = crossbeam::channel::bounded(1);
        let consumer = consumer.on_complete(move |collected| {
            let _ = sender.send(collected);
        });
        consumer.run();

        for i in 0..1000 {
            pipe3.push(i);
        }

        let collected = receiver.recv_timeout(Duration::from_secs(30)).unwrap();
        assert_eq!(collected, (0..1000).collect::<Vec<_>>());

        pool.terminate();
        pool.join();
    }

    #[test]
    fn test_mpmc_values_pair_exactly_once() {
        let mut pool = WorkerPool::new(4);
        pool.start();
        let handle = pool.handle();

        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 250;

        let pipe = Arc::new(Pipe::new());
        let seen: Arc<Vec<AtomicUsize>> = Arc::new(
            (0..PRODUCERS * PER_PRODUCER)
                .map(|_| AtomicUsize::new(0))
                .collect(),
        );
        let (finished, completions) = crossbeam::channel::bounded(CONSUMERS);

        for _ in 0..CONSUMERS {
            let pipe = Arc::clone(&pipe);
            let seen = Arc::clone(&seen);
            let finished = finished.clone();
            AsyncTask::new(&handle, async move {
                for _ in 0..(PRODUCERS * PER_PRODUCER) / CONSUMERS {
                    let value: usize = pipe.recv().await;
                    seen[value].fetch_add(1, Ordering::SeqCst);
                }
                let _ = finished.send(());
            })
            .run();
        }

        for producer in 0..PRODUCERS {
            let pipe = Arc::clone(&pipe);
            handle.submit(
                move || {
                    for i in 0..PER_PRODUCER {
                        pipe.push(producer * PER_PRODUCER + i);
                    }
                },
                0,
            );
        }

        for _ in 0..CONSUMERS {
            completions.recv_timeout(Duration::from_secs(30)).unwrap();
        }

        for slot in seen.iter() {
            assert_eq!(slot.load(Ordering::SeqCst), 1);
        }
        assert!(pipe.is_empty());

        pool.terminate();
        pool.join();
    }
}
