//! Intrusive task nodes.
//!
//! A [`Task`] is a one-shot callable plus a raw `next` pointer. Tasks are
//! chained into lock-free stacks by CAS-ing a head pointer; ownership of a
//! node travels with the link itself, so whichever list (or local chain)
//! currently holds a node is responsible for freeing it. This is the only
//! module in the crate that uses unsafe code; everything above it works in
//! terms of [`AtomicTaskStack`] and [`TaskList`].

use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

pub(crate) type TaskFn = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct Task {
    func: Option<TaskFn>,
    pub(crate) next: *mut Task,
}

impl Task {
    pub(crate) fn new(func: impl FnOnce() + Send + 'static) -> Box<Task> {
        Box::new(Task {
            func: Some(Box::new(func)),
            next: ptr::null_mut(),
        })
    }

    /// Run the payload. The node itself is freed when the box drops, even if
    /// the payload panics.
    pub(crate) fn run(mut self: Box<Task>) {
        if let Some(func) = self.func.take() {
            func();
        }
    }
}

/// A lock-free MPSC stack of tasks: CAS push, XCHG-NIL drain.
///
/// The drain hands back a [`TaskList`] in LIFO order; callers that need FIFO
/// reverse it locally before executing.
pub(crate) struct AtomicTaskStack {
    head: AtomicPtr<Task>,
}

impl AtomicTaskStack {
    pub(crate) fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
        }
    }

    pub(crate) fn push(&self, task: Box<Task>) {
        let raw = Box::into_raw(task);
        let mut node = self.head.load(Ordering::Relaxed);
        loop {
            // SAFETY: we exclusively own `raw` until the CAS below publishes it
            unsafe { (*raw).next = node };
            match self
                .head
                .compare_exchange_weak(node, raw, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => return,
                Err(current) => node = current,
            }
        }
    }

    /// Detach the whole chain at once.
    pub(crate) fn take_all(&self) -> TaskList {
        TaskList {
            head: self.head.swap(ptr::null_mut(), Ordering::Acquire),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl Drop for AtomicTaskStack {
    fn drop(&mut self) {
        drop(self.take_all());
    }
}

/// An exclusively owned chain of tasks detached from a stack.
pub(crate) struct TaskList {
    head: *mut Task,
}

// SAFETY: the list owns its nodes outright; the raw pointers are only a
// storage representation of that ownership.
unsafe impl Send for TaskList {}

impl TaskList {
    pub(crate) fn new() -> Self {
        Self {
            head: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Restore FIFO order after a LIFO drain.
    pub(crate) fn reverse(&mut self) {
        let mut p = self.head;
        let mut q: *mut Task = ptr::null_mut();
        while !p.is_null() {
            // SAFETY: every node in the chain is owned by this list
            let t = unsafe { (*p).next };
            unsafe { (*p).next = q };
            q = p;
            p = t;
        }
        self.head = q;
    }

    pub(crate) fn pop(&mut self) -> Option<Box<Task>> {
        if self.head.is_null() {
            return None;
        }
        // SAFETY: the head node is owned by this list and detached before the
        // box is reconstituted
        let mut task = unsafe { Box::from_raw(self.head) };
        self.head = task.next;
        task.next = ptr::null_mut();
        Some(task)
    }

    pub(crate) fn take(&mut self) -> TaskList {
        TaskList {
            head: std::mem::replace(&mut self.head, ptr::null_mut()),
        }
    }

    pub(crate) fn push_front(&mut self, task: Box<Task>) {
        let raw = Box::into_raw(task);
        // SAFETY: the node is ours until linked, and the list owns its chain
        unsafe { (*raw).next = self.head };
        self.head = raw;
    }
}

impl Drop for TaskList {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
