// SPDX-License-Identifier: MIT
//
// Subscriber (C5): a per-subscriber mailbox/work-queue/callback
// endpoint plus the atomic subscription bitmap the broker consults on
// every publish. Grounded on `include/pub_sub/subscriber.h` and
// `lib/pub_sub/subscriber.c`: the bitarray sizing and set/clear/test
// helpers, `common_subscriber_init`'s defaults, and
// `send_to_next_fifo_subscriber`'s work-queue hand-off chain all carry
// over with the same shapes, translated from Zephyr's `k_msgq`/`k_fifo`
// plus named `atomic_t` bitarrays into `queue::MsgQueue` plus a
// `Vec<AtomicU64>` bitmap.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use thiserror::Error;

use crate::broker::BrokerInner;
use crate::message::Envelope;
use crate::pool::Deadline;
use crate::queue::MsgQueue;

/// Delivery discipline. Ordering matters: the broker sorts its
/// subscriber list by discipline first (`Callback` before `Mailbox`
/// before `WorkQueue`), then by priority within a discipline — "a low
/// priority callback will always be higher priority than a high
/// priority work-queue subscriber."
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Debug)]
pub enum Discipline {
    Callback,
    Mailbox,
    WorkQueue,
}

/// A subscriber's message handler. Invoked with read-only access to the
/// message; ownership of the reference stays with whoever is driving
/// dispatch (the broker for Callback, `handle_one`'s caller for Mailbox
/// and WorkQueue) — if the handler needs to retain the message past its
/// own scope it must `envelope.acquire()` its own reference.
pub type HandlerFn = Box<dyn FnMut(u16, &Envelope) + Send>;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum SubscriberError {
    #[error("operation not valid for a callback-discipline subscriber")]
    NotApplicableForCallback,
    #[error("handler must be set before the subscriber is attached to a broker")]
    NoHandler,
    #[error("message id is a public id; publish_direct only accepts private message ids")]
    NotAPrivateMessage,
}

pub enum HandleOutcome {
    Handled,
    NoMessage,
}

enum Storage {
    Callback,
    Mailbox(MsgQueue),
    WorkQueue(MsgQueue),
}

/// One subscriber's endpoint: subscription bitmap, handler, and
/// per-discipline queue storage. Always held behind an `Arc` once
/// attached to a broker, since the broker's subscriber list and the
/// work-queue hand-off chain both need to share subscriber identity.
pub struct Subscriber {
    discipline: Discipline,
    max_pub_msg_id: u16,
    priority: AtomicU8,
    bitmap: Vec<AtomicU64>,
    handler: Mutex<Option<HandlerFn>>,
    storage: Storage,
    broker: Mutex<Option<Weak<BrokerInner>>>,
}

fn bitmap_len(max_pub_msg_id: u16) -> usize {
    (max_pub_msg_id as usize / 64) + 1
}

impl Subscriber {
    fn new(discipline: Discipline, max_pub_msg_id: u16, storage: Storage) -> Arc<Self> {
        let bitmap = (0..bitmap_len(max_pub_msg_id)).map(|_| AtomicU64::new(0)).collect();
        Arc::new(Self {
            discipline,
            max_pub_msg_id,
            priority: AtomicU8::new(0),
            bitmap,
            handler: Mutex::new(None),
            storage,
            broker: Mutex::new(None),
        })
    }

    pub fn callback(max_pub_msg_id: u16) -> Arc<Self> {
        Self::new(Discipline::Callback, max_pub_msg_id, Storage::Callback)
    }

    pub fn mailbox(max_pub_msg_id: u16, capacity: usize) -> Arc<Self> {
        Self::new(Discipline::Mailbox, max_pub_msg_id, Storage::Mailbox(MsgQueue::bounded(capacity)))
    }

    pub fn work_queue(max_pub_msg_id: u16) -> Arc<Self> {
        Self::new(Discipline::WorkQueue, max_pub_msg_id, Storage::WorkQueue(MsgQueue::unbounded()))
    }

    pub fn discipline(&self) -> Discipline {
        self.discipline
    }

    pub fn max_pub_msg_id(&self) -> u16 {
        self.max_pub_msg_id
    }

    pub fn priority(&self) -> u8 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Set this subscriber's relative priority. Per the original
    /// library's contract, changing priority after the subscriber has
    /// been attached to a broker has no effect — the broker only
    /// consults it at attach time.
    pub fn set_priority(&self, priority: u8) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    /// Set (or replace) the message handler. Must be called before
    /// attaching to a broker; after that, only the handler itself
    /// should replace its own state, to avoid racing a concurrent
    /// dispatch.
    pub fn set_handler(&self, handler: HandlerFn) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    pub fn subscribe(&self, msg_id: u16) {
        debug_assert!(msg_id <= self.max_pub_msg_id, "msg_id exceeds this subscriber's max_pub_msg_id");
        let (word, bit) = (msg_id as usize / 64, msg_id as usize % 64);
        self.bitmap[word].fetch_or(1u64 << bit, Ordering::SeqCst);
    }

    /// Unsubscribe from a message id.
    ///
    /// A message already sitting in this subscriber's mailbox or
    /// work-queue may still be delivered after this call returns —
    /// unsubscribing only affects future dispatch decisions.
    pub fn unsubscribe(&self, msg_id: u16) {
        debug_assert!(msg_id <= self.max_pub_msg_id, "msg_id exceeds this subscriber's max_pub_msg_id");
        let (word, bit) = (msg_id as usize / 64, msg_id as usize % 64);
        self.bitmap[word].fetch_and(!(1u64 << bit), Ordering::SeqCst);
    }

    pub fn is_subscribed(&self, msg_id: u16) -> bool {
        if msg_id > self.max_pub_msg_id {
            return false;
        }
        let (word, bit) = (msg_id as usize / 64, msg_id as usize % 64);
        self.bitmap[word].load(Ordering::SeqCst) & (1u64 << bit) != 0
    }

    pub(crate) fn set_broker(&self, broker: Option<Weak<BrokerInner>>) {
        *self.broker.lock().unwrap() = broker;
    }

    pub(crate) fn broker(&self) -> Option<Arc<BrokerInner>> {
        self.broker.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    fn invoke_handler(&self, msg_id: u16, envelope: &Envelope) {
        let mut guard = self.handler.lock().unwrap();
        match guard.as_mut() {
            Some(handler) => handler(msg_id, envelope),
            None => log::error!("subscriber dispatched to with no handler set (msg_id={msg_id})"),
        }
    }

    /// Deliver straight into this subscriber's queue, bypassing the
    /// broker's subscription bitmap entirely. Only valid for a private
    /// message id (greater than `max_pub_msg_id`) — private ids are how
    /// the HSM engine's Walk/Entry/Exit messages and similar
    /// point-to-point traffic reach a specific subscriber.
    pub fn publish_direct(&self, envelope: Envelope) -> Result<(), SubscriberError> {
        if envelope.msg_id() <= self.max_pub_msg_id {
            return Err(SubscriberError::NotAPrivateMessage);
        }
        match &self.storage {
            Storage::Callback => {
                self.invoke_handler(envelope.msg_id(), &envelope);
                envelope.release();
            }
            Storage::Mailbox(q) => q.put_blocking(envelope),
            Storage::WorkQueue(q) => q.put_unbounded(envelope),
        }
        Ok(())
    }

    /// Called by the broker's dispatch loop for Callback subscribers,
    /// and by `publish_direct`/hand-off for the others — delivers
    /// straight to the handler without touching any queue.
    pub(crate) fn deliver_callback(&self, envelope: &Envelope) {
        debug_assert_eq!(self.discipline, Discipline::Callback);
        self.invoke_handler(envelope.msg_id(), envelope);
    }

    /// Enqueue without blocking past capacity signalling — used by the
    /// broker's dispatch loop for Mailbox subscribers (`K_FOREVER`
    /// semantics: the broker blocks here until there is room).
    pub(crate) fn enqueue_mailbox(&self, envelope: Envelope) {
        match &self.storage {
            Storage::Mailbox(q) => q.put_blocking(envelope),
            _ => unreachable!("enqueue_mailbox called on a non-Mailbox subscriber"),
        }
    }

    /// Enqueue onto this subscriber's work-queue — used by the
    /// broker's dispatch loop, and by the hand-off chain when forwarding
    /// from one WorkQueue subscriber to the next.
    pub(crate) fn enqueue_work_queue(&self, envelope: Envelope) {
        match &self.storage {
            Storage::WorkQueue(q) => q.put_unbounded(envelope),
            _ => unreachable!("enqueue_work_queue called on a non-WorkQueue subscriber"),
        }
    }

    /// Dequeue and handle one message for a Mailbox or WorkQueue
    /// subscriber, blocking up to `deadline` if none is pending.
    ///
    /// For a WorkQueue subscriber receiving a public message, this
    /// forwards a fresh reference to the next matching WorkQueue
    /// subscriber in the broker's list *before* invoking the local
    /// handler — matching `send_to_next_fifo_subscriber`'s ordering in
    /// the original library. The next subscriber cannot act on its
    /// forwarded copy until its own `handle_one` runs, which cannot
    /// happen before this call returns, so "handlers see the message
    /// before it is forwarded" still holds from each subscriber's own
    /// point of view even though the forward call happens first in
    /// program order here.
    pub fn handle_one(self: &Arc<Self>, deadline: Deadline) -> Result<HandleOutcome, SubscriberError> {
        let queue = match &self.storage {
            Storage::Callback => return Err(SubscriberError::NotApplicableForCallback),
            Storage::Mailbox(q) => q,
            Storage::WorkQueue(q) => q,
        };
        let envelope = match queue.get(deadline) {
            Some(envelope) => envelope,
            None => return Ok(HandleOutcome::NoMessage),
        };
        let msg_id = envelope.msg_id();
        if self.discipline == Discipline::WorkQueue && msg_id <= self.max_pub_msg_id {
            if let Some(broker) = self.broker() {
                broker.hand_off_to_next_work_queue_subscriber(self, msg_id, &envelope);
            }
        }
        self.invoke_handler(msg_id, &envelope);
        envelope.release();
        Ok(HandleOutcome::Handled)
    }

    /// Whether a message is currently available without blocking.
    /// Translates `pub_sub_populate_poll_evt`'s intent (let a caller
    /// integrate this subscriber into an external event loop) into
    /// something meaningful over `std::sync` primitives: a snapshot
    /// check rather than a registration with an OS-level poll set.
    pub fn poll_source(&self) -> Result<bool, SubscriberError> {
        match &self.storage {
            Storage::Callback => Err(SubscriberError::NotApplicableForCallback),
            Storage::Mailbox(q) => Ok(q.len() > 0),
            Storage::WorkQueue(q) => Ok(q.len() > 0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn discipline_ordering_matches_priority_scheme() {
        assert!(Discipline::Callback < Discipline::Mailbox);
        assert!(Discipline::Mailbox < Discipline::WorkQueue);
    }

    #[test]
    fn subscribe_and_unsubscribe_round_trip() {
        let sub = Subscriber::callback(130);
        assert!(!sub.is_subscribed(65));
        sub.subscribe(65);
        assert!(sub.is_subscribed(65));
        sub.unsubscribe(65);
        assert!(!sub.is_subscribed(65));
    }

    #[test]
    fn is_subscribed_false_beyond_max_pub_msg_id() {
        let sub = Subscriber::callback(4);
        assert!(!sub.is_subscribed(100));
    }

    #[test]
    fn callback_discipline_rejects_handle_one() {
        let sub = Subscriber::callback(4);
        let err = sub.handle_one(Deadline::NoWait).err().unwrap();
        assert_eq!(err, SubscriberError::NotApplicableForCallback);
    }

    #[test]
    fn mailbox_handle_one_times_out_when_empty() {
        let sub = Subscriber::mailbox(4, 2);
        sub.set_handler(Box::new(|_, _| {}));
        assert!(matches!(sub.handle_one(Deadline::NoWait), Ok(HandleOutcome::NoMessage)));
    }

    #[test]
    fn publish_direct_rejects_public_ids() {
        let sub = Subscriber::callback(4);
        let registry: crate::registry::AllocatorRegistry<1> = crate::registry::AllocatorRegistry::new();
        let pool: Arc<dyn crate::pool::Pool> = Arc::new(crate::pool::FixedPool::<32>::new(1));
        let alloc_id = registry.register(pool).unwrap();
        let handle: crate::message::MsgHandle<u8> =
            crate::message::MsgHandle::new(&registry, alloc_id, 1, 0u8, Deadline::NoWait).unwrap();
        let envelope: Envelope = handle.into();
        assert_eq!(sub.publish_direct(envelope).unwrap_err(), SubscriberError::NotAPrivateMessage);
    }
}
