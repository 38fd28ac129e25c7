// SPDX-License-Identifier: MIT
//
// Broker (C6): owns the subscriber list and the publish queue, and
// drives dispatch. Grounded on `lib/pub_sub/broker.c`:
// `pub_sub_add_subscriber_to_broker`'s two-pass discipline-then-priority
// insertion, `process_msg`'s bitmap test + per-discipline delivery +
// "first matching work-queue subscriber wins, then stop" loop, and
// `publish_work_handler`'s drain-then-resubmit loop — translated from a
// Zephyr system work item woken by a poll event into an owned
// `std::thread` blocking on the publish queue's condition variable.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::message::Envelope;
use crate::pool::Deadline;
use crate::queue::MsgQueue;
use crate::registry::AllocatorRegistry;
use crate::subscriber::{Discipline, Subscriber};

/// The subscriber list and publish queue, independent of any particular
/// allocator registry. `Subscriber` holds a `Weak<BrokerInner>` back
/// reference purely to drive the work-queue hand-off chain — allocation
/// and release never need to reach back through the broker.
pub struct BrokerInner {
    subscribers: Mutex<Vec<Arc<Subscriber>>>,
    publish_queue: MsgQueue,
}

impl BrokerInner {
    fn new() -> Arc<Self> {
        Arc::new(Self { subscribers: Mutex::new(Vec::new()), publish_queue: MsgQueue::unbounded() })
    }

    /// Insert `subscriber` into the list: first by discipline
    /// (Callback, then Mailbox, then WorkQueue), then by ascending
    /// priority within a discipline. Two passes over the list, exactly
    /// like `pub_sub_add_subscriber_to_broker`'s `sys_slist` walk.
    fn attach(self: &Arc<Self>, subscriber: &Arc<Subscriber>) {
        let mut list = self.subscribers.lock().unwrap();
        let discipline = subscriber.discipline();
        let priority = subscriber.priority();
        let mut insert_at = list.len();
        let mut start = None;
        for (i, existing) in list.iter().enumerate() {
            if existing.discipline() == discipline {
                start = Some(i);
                break;
            }
        }
        match start {
            None => insert_at = list.len(),
            Some(start) => {
                insert_at = list.len();
                for (i, existing) in list.iter().enumerate().skip(start) {
                    if existing.discipline() != discipline || existing.priority() > priority {
                        insert_at = i;
                        break;
                    }
                }
            }
        }
        list.insert(insert_at, subscriber.clone());
        drop(list);
        subscriber.set_broker(Some(Arc::downgrade(self)));
    }

    fn detach(&self, subscriber: &Arc<Subscriber>) {
        let mut list = self.subscribers.lock().unwrap();
        list.retain(|existing| !Arc::ptr_eq(existing, subscriber));
        drop(list);
        subscriber.set_broker(None);
    }

    /// Forward a fresh reference of a public work-queue message to the
    /// next subscribed WorkQueue subscriber after `from` in the list.
    /// Mirrors `send_to_next_fifo_subscriber`: work-queue subscribers
    /// are always contiguous at the tail of the sorted list, so a
    /// linear scan starting just after `from` is sufficient.
    pub(crate) fn hand_off_to_next_work_queue_subscriber(
        &self,
        from: &Arc<Subscriber>,
        msg_id: u16,
        envelope: &Envelope,
    ) {
        let list = self.subscribers.lock().unwrap();
        let Some(from_index) = list.iter().position(|s| Arc::ptr_eq(s, from)) else {
            return;
        };
        for next in list.iter().skip(from_index + 1) {
            if next.discipline() != Discipline::WorkQueue {
                break;
            }
            if msg_id <= next.max_pub_msg_id() && next.is_subscribed(msg_id) {
                next.enqueue_work_queue(envelope.acquire());
                break;
            }
        }
    }

    fn process_one(&self, envelope: Envelope) {
        let msg_id = envelope.msg_id();
        let list = self.subscribers.lock().unwrap();
        let mut work_queue_handled = false;
        for sub in list.iter() {
            if msg_id > sub.max_pub_msg_id() || !sub.is_subscribed(msg_id) {
                continue;
            }
            match sub.discipline() {
                Discipline::Callback => sub.deliver_callback(&envelope),
                Discipline::Mailbox => sub.enqueue_mailbox(envelope.acquire()),
                Discipline::WorkQueue => {
                    if !work_queue_handled {
                        sub.enqueue_work_queue(envelope.acquire());
                        work_queue_handled = true;
                    }
                }
            }
            // A message can only be queued to one work-queue subscriber
            // at a time, and they sit at the tail of the list, so once
            // one has claimed it there is nothing left to check.
            if work_queue_handled {
                break;
            }
        }
        drop(list);
        envelope.release();
    }

    /// Drain every message currently sitting in the publish queue,
    /// returning without blocking once it is empty. Mirrors
    /// `publish_work_handler`'s drain loop.
    pub fn process(&self) {
        while let Some(envelope) = self.publish_queue.get(Deadline::NoWait) {
            self.process_one(envelope);
        }
    }

    fn run_forever(&self) {
        while let Some(envelope) = self.publish_queue.get(Deadline::Forever) {
            self.process_one(envelope);
        }
    }
}

/// The user-facing broker: a `BrokerInner` (subscriber list + publish
/// queue + dispatch) paired with the `AllocatorRegistry` it was built
/// with, so `new_msg`/`release` convenience wrappers mirror
/// `pub_sub_new_msg_from_broker`/`pub_sub_msg_release_with_broker`
/// without requiring every subscriber or the hand-off chain to know
/// about `MAX_POOLS`.
pub struct Broker<const MAX_POOLS: usize> {
    inner: Arc<BrokerInner>,
    registry: AllocatorRegistry<MAX_POOLS>,
    dispatch_thread: Mutex<Option<JoinHandle<()>>>,
    dispatched: AtomicUsize,
}

impl<const MAX_POOLS: usize> Broker<MAX_POOLS> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: BrokerInner::new(),
            registry: AllocatorRegistry::new(),
            dispatch_thread: Mutex::new(None),
            dispatched: AtomicUsize::new(0),
        })
    }

    pub fn registry(&self) -> &AllocatorRegistry<MAX_POOLS> {
        &self.registry
    }

    pub fn attach(self: &Arc<Self>, subscriber: &Arc<Subscriber>) {
        self.inner.attach(subscriber);
    }

    pub fn detach(&self, subscriber: &Arc<Subscriber>) {
        self.inner.detach(subscriber);
    }

    /// Enqueue a message for dispatch. Ownership of the reference
    /// passes to the broker — it is released once every matching
    /// subscriber has had a chance to acquire its own reference.
    pub fn publish(&self, envelope: Envelope) {
        self.inner.publish_queue.put_unbounded(envelope);
    }

    /// Process every message currently queued, without blocking.
    /// Useful in tests and in any host application driving dispatch
    /// from its own event loop rather than a dedicated thread.
    pub fn process(&self) {
        self.inner.process();
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Spawn a dedicated dispatch thread that blocks on the publish
    /// queue and calls `process_one` as messages arrive. Call
    /// `shutdown` to stop it.
    pub fn spawn_dispatch_thread(self: &Arc<Self>) {
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("pub_sub-broker".into())
            .spawn(move || inner.run_forever())
            .expect("failed to spawn broker dispatch thread");
        *self.dispatch_thread.lock().unwrap() = Some(handle);
    }

    /// Stop the dispatch thread started by `spawn_dispatch_thread` and
    /// wait for it to exit.
    pub fn shutdown(&self) {
        self.inner.publish_queue.close();
        if let Some(handle) = self.dispatch_thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }

    pub fn new_msg<T>(&self, alloc_id: u8, msg_id: u16, payload: T, deadline: Deadline) -> Option<crate::message::MsgHandle<T>> {
        crate::message::MsgHandle::new(&self.registry, alloc_id, msg_id, payload, deadline)
    }
}

impl<const MAX_POOLS: usize> Drop for Broker<MAX_POOLS> {
    fn drop(&mut self) {
        self.shutdown();
    }
}
