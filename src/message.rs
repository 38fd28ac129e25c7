// SPDX-License-Identifier: MIT
//
// Message handles: `RawMsg` is the untyped, type-erased pointer that
// flows through publish queues, mailboxes and work-queues (the broker
// only ever needs `msg_id` and the header, never the payload's
// concrete type). `MsgHandle<T>` is the owned, typed, RAII wrapper a
// caller gets back from allocation; dropping it releases the
// reference, exactly like the explicit `pub_sub_msg_release*` calls in
// the original library, but automatic.

use std::marker::PhantomData;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use crate::header::{
    MsgHeader, ALLOC_ID_CALLBACK, ALLOC_ID_STATIC, HEADER_SIZE, PAYLOAD_ALIGN, PAYLOAD_OFFSET,
};
use crate::pool::Deadline;
use crate::registry::AllocatorRegistry;

/// An untyped handle to a message's header, used wherever the payload
/// type is not (or no longer) statically known: broker queues,
/// mailboxes, work-queues, the HSM engine's dispatch loop.
///
/// Carries no ownership information of its own — whoever holds a
/// `RawMsg` is trusted to hold exactly one logical reference and to
/// route it through a `ReleaseRoute` eventually.
#[derive(Clone, Copy)]
pub struct RawMsg(NonNull<u8>);

unsafe impl Send for RawMsg {}

impl RawMsg {
    /// # Safety
    /// `ptr` must address a live `MsgHeader` immediately followed by
    /// the message's payload bytes.
    pub unsafe fn from_header_ptr(ptr: NonNull<u8>) -> Self {
        Self(ptr)
    }

    pub fn header(&self) -> &MsgHeader {
        unsafe { &*(self.0.as_ptr() as *const MsgHeader) }
    }

    pub fn msg_id(&self) -> u16 {
        self.header().msg_id()
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.0.as_ptr()
    }

    /// Pointer to the payload bytes, reserved at `PAYLOAD_OFFSET` from
    /// the header regardless of the concrete payload type.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.0.as_ptr().add(PAYLOAD_OFFSET) }
    }

    /// # Safety
    /// The caller must know the message's true payload type `T`, and
    /// `align_of::<T>()` must not exceed `PAYLOAD_ALIGN`.
    pub unsafe fn payload<T>(&self) -> &T {
        debug_assert!(
            std::mem::align_of::<T>() <= PAYLOAD_ALIGN,
            "payload type's alignment exceeds PAYLOAD_ALIGN"
        );
        &*(self.payload_ptr() as *const T)
    }
}

/// Where a `RawMsg`'s final release should be routed. Pool-backed
/// messages route through their `AllocatorRegistry`; static, callback
/// and delayed messages route through `StaticRoute`, which needs no
/// pool table at all.
pub trait ReleaseRoute: Send + Sync {
    fn release(&self, raw: RawMsg);
}

impl<const MAX_POOLS: usize> ReleaseRoute for AllocatorRegistry<MAX_POOLS> {
    fn release(&self, raw: RawMsg) {
        AllocatorRegistry::release(self, raw);
    }
}

/// Release route for messages that are never pool-backed: static and
/// callback messages (and delayed messages, which are static messages
/// underneath). Mirrors `pub_sub_alloc_release`'s STATIC/CALLBACK
/// branches without needing an allocator table.
pub struct StaticRoute;

impl ReleaseRoute for StaticRoute {
    fn release(&self, raw: RawMsg) {
        let prev = raw.header().release();
        if prev != 1 {
            return;
        }
        match raw.header().allocator_id() {
            ALLOC_ID_STATIC => {}
            ALLOC_ID_CALLBACK => unsafe { crate::callback_msg::free_callback_msg(&raw) },
            other => {
                log::error!("StaticRoute::release called on allocator-id {other}; expected STATIC or CALLBACK");
            }
        }
    }
}

/// Owned, typed message reference. Dropping it releases the held
/// reference through the configured `ReleaseRoute`.
pub struct MsgHandle<T> {
    raw: RawMsg,
    route: Arc<dyn ReleaseRoute>,
    _marker: PhantomData<T>,
}

impl<T> MsgHandle<T> {
    /// Allocate a new pool-backed message of id `msg_id` holding
    /// `payload`, via `registry`'s pool registered under `alloc_id`.
    pub fn new<const MAX_POOLS: usize>(
        registry: &AllocatorRegistry<MAX_POOLS>,
        alloc_id: u8,
        msg_id: u16,
        payload: T,
        deadline: Deadline,
    ) -> Option<Self> {
        debug_assert!(
            std::mem::align_of::<T>() <= PAYLOAD_ALIGN,
            "payload type's alignment exceeds PAYLOAD_ALIGN"
        );
        let block = registry.new_msg(alloc_id, msg_id, std::mem::size_of::<T>(), deadline)?;
        unsafe {
            ptr::write(block.payload_ptr() as *mut T, payload);
        }
        let raw = unsafe { RawMsg::from_header_ptr(NonNull::new_unchecked(block.as_ptr())) };
        Some(Self { raw, route: Arc::new(registry.clone()), _marker: PhantomData })
    }

    /// # Safety
    /// `raw` must address a message whose payload is of type `T`, and
    /// `route` must be the correct release route for its
    /// allocator-id.
    pub unsafe fn from_raw(raw: RawMsg, route: Arc<dyn ReleaseRoute>) -> Self {
        Self { raw, route, _marker: PhantomData }
    }

    pub fn msg_id(&self) -> u16 {
        self.raw.msg_id()
    }

    pub fn payload(&self) -> &T {
        unsafe { self.raw.payload::<T>() }
    }

    /// Take an additional reference, returning a new owned handle
    /// sharing the same underlying message.
    pub fn acquire(&self) -> Self {
        self.raw.header().acquire();
        Self { raw: self.raw, route: self.route.clone(), _marker: PhantomData }
    }

    /// Erase the payload type and ownership, handing the raw pointer
    /// and its release route to whatever queue will carry it next
    /// (publish queue, mailbox, work-queue). Ownership transfers —
    /// the original handle must not be used again, which is why this
    /// consumes `self` without running `Drop`.
    pub fn into_raw(self) -> (RawMsg, Arc<dyn ReleaseRoute>) {
        let mut this = std::mem::ManuallyDrop::new(self);
        let raw = this.raw;
        // Safety: `this` is wrapped in `ManuallyDrop`, so `route` is
        // moved out exactly once and never dropped in place.
        let route = unsafe { std::ptr::read(&mut this.route) };
        (raw, route)
    }

    /// Reconstruct an owned handle from a `(RawMsg, route)` pair
    /// previously produced by `into_raw`.
    ///
    /// # Safety
    /// Same obligations as `from_raw`.
    pub unsafe fn from_parts(raw: RawMsg, route: Arc<dyn ReleaseRoute>) -> Self {
        Self::from_raw(raw, route)
    }
}

impl<T> Drop for MsgHandle<T> {
    fn drop(&mut self) {
        self.route.release(self.raw);
    }
}

/// A program-owned message, never pool-backed. May be republished
/// after its refcount returns to 0.
///
/// `_pad` pins the `payload` field at exactly `PAYLOAD_OFFSET` bytes
/// from `header`, independent of `T`'s own alignment requirement —
/// `RawMsg::payload_ptr` assumes that fixed offset and has no `T` to
/// recompute it from.
#[repr(C)]
pub struct StaticMsg<T> {
    header: MsgHeader,
    _pad: [u8; PAYLOAD_OFFSET - HEADER_SIZE],
    payload: T,
}

impl<T> StaticMsg<T> {
    pub const fn new(msg_id: u16, payload: T) -> Self {
        assert!(
            std::mem::align_of::<T>() <= PAYLOAD_ALIGN,
            "payload type's alignment exceeds PAYLOAD_ALIGN"
        );
        Self {
            header: MsgHeader::new(msg_id, ALLOC_ID_STATIC),
            _pad: [0u8; PAYLOAD_OFFSET - HEADER_SIZE],
            payload,
        }
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    /// A `RawMsg` view of this static message, suitable for
    /// `Broker::publish` or `Subscriber::publish_direct`.
    ///
    /// # Safety
    /// The caller must ensure the static message is not concurrently
    /// mutated through `&self.payload` while a `RawMsg` reference to
    /// it is live elsewhere in the system, beyond what the refcount
    /// protocol already arbitrates.
    pub unsafe fn as_raw(&self) -> RawMsg {
        RawMsg::from_header_ptr(NonNull::from(self).cast::<u8>())
    }

    /// Re-initialize for reuse. Only valid once refcount has reached 0.
    pub fn reinit(&self, msg_id: u16) {
        debug_assert_eq!(self.header.refcount(), 0, "StaticMsg reinit while still referenced");
        self.header.init(msg_id, ALLOC_ID_STATIC);
    }
}

/// A `RawMsg` paired with its release route — the unit that actually
/// flows through publish queues, mailboxes and work-queues. Carrying
/// the route alongside the pointer means the broker/subscriber layer
/// never needs to know which registry (or whether a registry at all)
/// a given message came from.
pub struct Envelope {
    raw: RawMsg,
    route: Arc<dyn ReleaseRoute>,
}

impl Envelope {
    /// Build an envelope directly from its parts.
    ///
    /// # Safety
    /// `route` must be the correct release route for `raw`'s
    /// allocator-id.
    pub unsafe fn from_parts(raw: RawMsg, route: Arc<dyn ReleaseRoute>) -> Self {
        Self { raw, route }
    }

    pub fn msg_id(&self) -> u16 {
        self.raw.msg_id()
    }

    pub fn raw(&self) -> RawMsg {
        self.raw
    }

    /// Take an additional reference, producing a new envelope for the
    /// same underlying message.
    pub fn acquire(&self) -> Envelope {
        self.raw.header().acquire();
        Envelope { raw: self.raw, route: self.route.clone() }
    }

    /// Release the reference this envelope represents.
    pub fn release(self) {
        self.route.release(self.raw);
    }
}

impl<T> From<MsgHandle<T>> for Envelope {
    fn from(handle: MsgHandle<T>) -> Self {
        let (raw, route) = handle.into_raw();
        Envelope { raw, route }
    }
}

impl<T> MsgHandle<T> {
    /// # Safety
    /// The envelope's underlying message must have payload type `T`.
    pub unsafe fn from_envelope(envelope: Envelope) -> Self {
        Self::from_parts(envelope.raw, envelope.route)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FixedPool;
    use std::sync::Arc;

    #[test]
    fn msg_handle_roundtrip() {
        let registry: AllocatorRegistry<2> = AllocatorRegistry::new();
        let pool: Arc<dyn crate::pool::Pool> = Arc::new(FixedPool::<32>::new(2));
        let id = registry.register(pool).unwrap();
        let handle: MsgHandle<u32> =
            MsgHandle::new(&registry, id, 7, 99u32, Deadline::NoWait).unwrap();
        assert_eq!(handle.msg_id(), 7);
        assert_eq!(*handle.payload(), 99);
    }

    #[test]
    fn static_msg_reusable_after_release() {
        static MSG: StaticMsg<u8> = StaticMsg::new(1, 0);
        unsafe {
            let raw = MSG.as_raw();
            let route: Arc<dyn ReleaseRoute> = Arc::new(StaticRoute);
            let handle: MsgHandle<u8> = MsgHandle::from_raw(raw, route);
            drop(handle);
        }
        assert_eq!(MSG.header().refcount(), 0);
        MSG.reinit(2);
        assert_eq!(MSG.header().refcount(), 1);
    }
}
