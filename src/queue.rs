// SPDX-License-Identifier: MIT
//
// The blocking queue backing both Mailbox and WorkQueue subscriber
// storage: a `VecDeque<RawMsg>` guarded by a `Mutex` with two
// condition variables, translated from the teacher's `Waiter`
// (cond+mutex+quit-flag over named, cross-process primitives) into an
// in-process `std::sync::{Mutex, Condvar}` combinator. Mailbox uses a
// bounded capacity (the broker blocks, unbounded wait, to enqueue);
// WorkQueue uses no capacity limit.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::message::Envelope;
use crate::pool::Deadline;

pub(crate) struct MsgQueue {
    capacity: Option<usize>,
    inner: Mutex<VecDeque<Envelope>>,
    not_empty: Condvar,
    not_full: Condvar,
    closed: AtomicBool,
}

impl MsgQueue {
    pub(crate) fn bounded(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub(crate) fn unbounded() -> Self {
        Self {
            capacity: None,
            inner: Mutex::new(VecDeque::new()),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Wake any thread blocked in `get`, making it return `None`. Used
    /// to stop a broker's dispatch thread without needing a sentinel
    /// message.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = self.inner.lock().unwrap();
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Enqueue, blocking with no timeout if the queue is at capacity.
    /// Used by the broker to deliver into a Mailbox subscriber — the
    /// spec's `K_FOREVER` semantics, which back-pressures producers
    /// through the publish queue rather than dropping messages.
    pub(crate) fn put_blocking(&self, msg: Envelope) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(cap) = self.capacity {
            while guard.len() >= cap {
                log::debug!("mailbox at capacity {cap}, broker blocking to enqueue");
                guard = self.not_full.wait(guard).unwrap();
            }
        }
        guard.push_back(msg);
        drop(guard);
        self.not_empty.notify_one();
    }

    /// Enqueue without blocking — used for WorkQueue hand-off, which
    /// has no capacity bound.
    pub(crate) fn put_unbounded(&self, msg: Envelope) {
        let mut guard = self.inner.lock().unwrap();
        guard.push_back(msg);
        drop(guard);
        self.not_empty.notify_one();
    }

    pub(crate) fn get(&self, deadline: Deadline) -> Option<Envelope> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(msg) = guard.pop_front() {
                drop(guard);
                self.not_full.notify_one();
                return Some(msg);
            }
            if self.closed.load(Ordering::SeqCst) {
                return None;
            }
            match deadline {
                Deadline::NoWait => return None,
                Deadline::Forever => {
                    guard = self.not_empty.wait(guard).unwrap();
                }
                Deadline::At(when) => {
                    let remaining = when.saturating_duration_since(std::time::Instant::now());
                    if remaining.is_zero() {
                        return None;
                    }
                    let (g, timed_out) = self.not_empty.wait_timeout(guard, remaining).unwrap();
                    guard = g;
                    if timed_out.timed_out() && guard.is_empty() {
                        return None;
                    }
                }
            }
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}
