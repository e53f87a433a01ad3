//! A level-triggered one-shot rendezvous.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::task::{Context, Poll, Waker};

/// Tasks awaiting a non-signaled event park until [`notify`](Event::notify);
/// awaiting a signaled event completes immediately. [`reset`](Event::reset)
/// returns to the non-signaled state without touching tasks already parked —
/// they are released by the next `notify`.
pub struct Event {
    signaled: AtomicBool,
    waiters: Mutex<Vec<Waker>>,
}

impl Event {
    pub fn new() -> Self {
        Self {
            signaled: AtomicBool::new(false),
            waiters: Mutex::new(Vec::new()),
        }
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }

    /// Signal the event and release every parked task.
    pub fn notify(&self) {
        let woken = {
            let mut waiters = self.waiters.lock().unwrap();
            self.signaled.store(true, Ordering::Release);
            std::mem::take(&mut *waiters)
        };

        for waker in woken {
            waker.wake();
        }
    }

    pub fn reset(&self) {
        self.signaled.store(false, Ordering::Release);
    }

    pub fn wait(&self) -> EventWait<'_> {
        EventWait {
            event: self,
            parked: false,
        }
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

pub struct EventWait<'a> {
    event: &'a Event,
    parked: bool,
}

impl Future for EventWait<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();

        // a parked waiter is only polled again once released
        if this.parked || this.event.signaled.load(Ordering::Acquire) {
            return Poll::Ready(());
        }

        let mut waiters = this.event.waiters.lock().unwrap();
        // double check under the lock; notify holds it while signaling
        if this.event.signaled.load(Ordering::Acquire) {
            return Poll::Ready(());
        }
        waiters.push(cx.waker().clone());
        this.parked = true;
        Poll::Pending
    }
}
