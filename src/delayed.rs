// SPDX-License-Identifier: MIT
//
// Delayed messages (C4 specialization) and their scheduler glue (C8):
// a static message wrapping a timer entry and a bound subscriber.
// Grounded on `include/pub_sub/delayable_msg.h` and
// `lib/pub_sub/delayable_msg.c`: the struct layout (timer/subscriber
// fields ahead of the header, mirroring `callback_msg.rs`'s
// callback-ahead-of-header convention), `update_timeout`'s
// abort-then-start regardless of the abort result, and the fire
// handler's `refcount == 0` assertion before `acquire` + direct
// publish. The original schedules against a Zephyr `_timeout`/
// `k_timer`; this crate supplies the same contract with a per-arm
// `std::thread::sleep` worker plus a generation counter that lets
// `abort`/a later `start` invalidate an in-flight sleep without
// needing to interrupt it.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::header::{MsgHeader, ALLOC_ID_STATIC, HEADER_SIZE, PAYLOAD_ALIGN, PAYLOAD_OFFSET};
use crate::message::{Envelope, RawMsg, StaticRoute};
use crate::subscriber::Subscriber;

#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum DelayedError {
    #[error("delayed message already fired and has not yet been handled")]
    InvalidState,
}

struct TimerState {
    /// Bumped on every `start`/`abort`; a sleeping worker checks its
    /// captured generation against the current one before firing, so
    /// a stale worker (superseded by `update_timeout`, or cancelled by
    /// `abort`) becomes a silent no-op instead of double-publishing.
    generation: u64,
    armed: bool,
}

/// A static message that publishes itself to a bound subscriber after
/// a delay, bypassing broker fan-out entirely. Lives in one of three
/// states — idle, armed, in-flight (fired but not yet handled) —
/// never simultaneously armed and in-flight.
/// `_pad` pins `payload` at `PAYLOAD_OFFSET` bytes from `header`,
/// independent of `T`'s own alignment — see `StaticMsg`.
#[repr(C)]
pub struct DelayedMsg<T> {
    state: Mutex<TimerState>,
    subscriber: Arc<Subscriber>,
    header: MsgHeader,
    _pad: [u8; PAYLOAD_OFFSET - HEADER_SIZE],
    payload: T,
}

impl<T> DelayedMsg<T> {
    /// `msg_id` must be private (greater than `subscriber`'s
    /// `max_pub_msg_id`) — delayed messages only ever reach their
    /// subscriber through `publish_direct`, never broker fan-out.
    pub fn new(msg_id: u16, payload: T, subscriber: Arc<Subscriber>) -> Arc<Self>
    where
        T: Send + Sync,
    {
        debug_assert!(
            msg_id > subscriber.max_pub_msg_id(),
            "a delayed message's id must be private to its bound subscriber"
        );
        debug_assert!(
            std::mem::align_of::<T>() <= PAYLOAD_ALIGN,
            "payload type's alignment exceeds PAYLOAD_ALIGN"
        );
        Arc::new(Self {
            state: Mutex::new(TimerState { generation: 0, armed: false }),
            subscriber,
            header: MsgHeader::new_idle(msg_id, ALLOC_ID_STATIC),
            _pad: [0u8; PAYLOAD_OFFSET - HEADER_SIZE],
            payload,
        })
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// # Safety
    /// Same aliasing obligations as `StaticMsg::as_raw`.
    unsafe fn as_raw(&self) -> RawMsg {
        RawMsg::from_header_ptr(std::ptr::NonNull::from(&self.header).cast::<u8>())
    }

    /// Arm the timer: after `delay`, the message is published directly
    /// to the bound subscriber. Aborts (invalidates) any arming
    /// already in flight from a previous `start`/`update_timeout`.
    pub fn start(self: &Arc<Self>, delay: Duration)
    where
        T: Send + Sync + 'static,
    {
        let generation = {
            let mut state = self.state.lock().unwrap();
            state.generation += 1;
            state.armed = true;
            state.generation
        };
        let this = self.clone();
        std::thread::Builder::new()
            .name("pub_sub-delayed-timer".into())
            .spawn(move || this.fire_after(delay, generation))
            .expect("failed to spawn delayed-message timer thread");
    }

    fn fire_after(self: Arc<Self>, delay: Duration, generation: u64)
    where
        T: Send + Sync,
    {
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        {
            let mut state = self.state.lock().unwrap();
            if state.generation != generation || !state.armed {
                // Cancelled by `abort`, or superseded by a later
                // `start`/`update_timeout`: this worker is stale.
                return;
            }
            state.armed = false;
        }
        debug_assert_eq!(self.header.refcount(), 0, "delayed message fired while still referenced");
        self.header.acquire();
        let envelope = unsafe { Envelope::from_parts(self.as_raw(), Arc::new(StaticRoute)) };
        if let Err(err) = self.subscriber.publish_direct(envelope) {
            log::error!("delayed message's publish_direct to its bound subscriber failed: {err}");
        }
    }

    /// Cancel the timer. Returns `InvalidState` if the message had
    /// already fired and has not yet been handled by its subscriber —
    /// the caller is warned it will still receive one delivery.
    pub fn abort(&self) -> Result<(), DelayedError> {
        let was_armed = {
            let mut state = self.state.lock().unwrap();
            let was_armed = state.armed;
            state.armed = false;
            state.generation += 1;
            was_armed
        };
        if !was_armed && self.header.refcount() > 0 {
            return Err(DelayedError::InvalidState);
        }
        Ok(())
    }

    /// Abort any existing arming, then re-arm with the new delay.
    /// Mirrors the original's `update_timeout`: the re-arm always
    /// happens, even when the abort reports `InvalidState` — per its
    /// own warning, the subscriber will then see the message twice,
    /// once for the old delay and once for the new one.
    pub fn update_timeout(self: &Arc<Self>, delay: Duration) -> Result<(), DelayedError>
    where
        T: Send + Sync + 'static,
    {
        let ret = self.abort();
        self.start(delay);
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscriber::HandleOutcome;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[test]
    fn fires_and_delivers_to_bound_subscriber() {
        let sub = Subscriber::mailbox(4, 2);
        sub.set_handler(Box::new(|_, _| {}));
        let delayed = DelayedMsg::new(100, 7u32, sub.clone());

        delayed.start(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(80));

        assert!(matches!(sub.handle_one(crate::pool::Deadline::NoWait), Ok(HandleOutcome::Handled)));
        assert_eq!(delayed.header().refcount(), 0);
    }

    #[test]
    fn abort_before_fire_prevents_delivery() {
        let sub = Subscriber::mailbox(4, 2);
        let delivered = Arc::new(AtomicU32::new(0));
        let delivered_clone = delivered.clone();
        sub.set_handler(Box::new(move |_, _| {
            delivered_clone.fetch_add(1, Ordering::SeqCst);
        }));
        let delayed = DelayedMsg::new(100, 0u8, sub.clone());

        delayed.start(Duration::from_millis(50));
        assert_eq!(delayed.abort(), Ok(()));
        std::thread::sleep(Duration::from_millis(80));

        assert!(matches!(
            sub.handle_one(crate::pool::Deadline::NoWait),
            Ok(HandleOutcome::NoMessage)
        ));
        assert_eq!(delivered.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn s6_abort_after_fire_is_invalid_state_then_recovers() {
        let sub = Subscriber::mailbox(4, 2);
        sub.set_handler(Box::new(|_, _| {}));
        let delayed = DelayedMsg::new(100, 0u8, sub.clone());

        delayed.start(Duration::from_millis(20));
        std::thread::sleep(Duration::from_millis(80));

        // Fired but not yet handled: abort reports InvalidState.
        assert_eq!(delayed.abort(), Err(DelayedError::InvalidState));

        // Handling it once brings the message back to idle.
        assert!(matches!(sub.handle_one(crate::pool::Deadline::NoWait), Ok(HandleOutcome::Handled)));
        assert_eq!(delayed.header().refcount(), 0);

        // An abort with nothing armed now succeeds.
        assert_eq!(delayed.abort(), Ok(()));
    }
}
