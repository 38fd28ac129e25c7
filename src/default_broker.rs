// SPDX-License-Identifier: MIT
//
// Optional process-wide default broker (C10), gated behind the
// `default-broker` feature exactly as the original gates
// `g_pub_sub_default_broker` behind `CONFIG_PUB_SUB_DEFAULT_BROKER`.
// Grounded on `include/pub_sub/pub_sub.h`'s free-function wrappers
// (`pub_sub_add_allocator`, `pub_sub_add_subscriber`, `pub_sub_new_msg`,
// `pub_sub_publish`, `pub_sub_release`) over that single instance —
// `SYS_INIT`'s build-time singleton becomes a lazily-initialized
// `OnceLock`.

use std::sync::{Arc, OnceLock};

use crate::broker::Broker;
use crate::message::Envelope;
use crate::pool::Deadline;
use crate::registry::MAX_POOLS;
use crate::subscriber::Subscriber;

static DEFAULT_BROKER: OnceLock<Arc<Broker<MAX_POOLS>>> = OnceLock::new();

/// The process-wide default broker, created (and its dispatch thread
/// spawned) on first access.
pub fn default_broker() -> &'static Arc<Broker<MAX_POOLS>> {
    DEFAULT_BROKER.get_or_init(|| {
        let broker = Broker::new();
        broker.spawn_dispatch_thread();
        broker
    })
}

pub fn add_allocator(pool: Arc<dyn crate::pool::Pool>) -> Result<crate::registry::AllocId, crate::registry::RegistryError> {
    default_broker().registry().register(pool)
}

pub fn add_subscriber(subscriber: &Arc<Subscriber>) {
    default_broker().attach(subscriber);
}

pub fn remove_subscriber(subscriber: &Arc<Subscriber>) {
    default_broker().detach(subscriber);
}

pub fn new_msg<T>(alloc_id: u8, msg_id: u16, payload: T, deadline: Deadline) -> Option<crate::message::MsgHandle<T>> {
    default_broker().new_msg(alloc_id, msg_id, payload, deadline)
}

pub fn publish(envelope: Envelope) {
    default_broker().publish(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FixedPool;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn default_broker_is_a_singleton() {
        let a = default_broker();
        let b = default_broker();
        assert!(Arc::ptr_eq(a, b));
    }

    #[test]
    fn forwarding_functions_reach_the_singleton() {
        let pool: Arc<dyn crate::pool::Pool> = Arc::new(FixedPool::<32>::new(2));
        let alloc_id = add_allocator(pool).unwrap();

        let sub = Subscriber::callback(20);
        sub.subscribe(11);
        let received = Arc::new(AtomicU32::new(0));
        let received_clone = received.clone();
        sub.set_handler(Box::new(move |msg_id, _| {
            received_clone.store(msg_id as u32, Ordering::SeqCst);
        }));
        add_subscriber(&sub);

        let handle = new_msg(alloc_id, 11, 5u32, Deadline::Forever).unwrap();
        publish(handle.into());

        for _ in 0..100 {
            if received.load(Ordering::SeqCst) == 11 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        assert_eq!(received.load(Ordering::SeqCst), 11);

        remove_subscriber(&sub);
    }
}
