// SPDX-License-Identifier: MIT
//
// Callback messages: on final release the registry invokes a function
// pointer embedded in the message rather than returning it to a pool.
// Layout mirrors the original's `struct pub_sub_msg_callback { callback;
// pub_sub_msg; }`: the callback field sits immediately before the
// header, which in turn immediately precedes the payload, so release
// dispatch can find the callback with a fixed back-offset from the
// header address without needing to know the payload's type.

use std::mem::size_of;
use std::ptr::NonNull;

use crate::header::{MsgHeader, ALLOC_ID_CALLBACK, HEADER_SIZE, PAYLOAD_ALIGN, PAYLOAD_OFFSET};
use crate::message::RawMsg;

/// A plain function pointer, not a boxed closure — callback messages
/// are meant for hot, allocation-free release paths.
pub type CallbackFn = fn(*mut u8);

/// `_pad` pins `payload` at `PAYLOAD_OFFSET` bytes from `header`,
/// independent of `T`'s own alignment — see `StaticMsg`.
#[repr(C)]
pub struct CallbackMsg<T> {
    callback: CallbackFn,
    header: MsgHeader,
    _pad: [u8; PAYLOAD_OFFSET - HEADER_SIZE],
    payload: T,
}

impl<T> CallbackMsg<T> {
    pub const fn new(msg_id: u16, callback: CallbackFn, payload: T) -> Self {
        assert!(
            std::mem::align_of::<T>() <= PAYLOAD_ALIGN,
            "payload type's alignment exceeds PAYLOAD_ALIGN"
        );
        Self {
            callback,
            header: MsgHeader::new(msg_id, ALLOC_ID_CALLBACK),
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

    /// # Safety
    /// See `StaticMsg::as_raw` — the same aliasing obligations apply.
    pub unsafe fn as_raw(&self) -> RawMsg {
        RawMsg::from_header_ptr(NonNull::from(&self.header).cast::<u8>())
    }

    pub fn reinit(&self, msg_id: u16) {
        debug_assert_eq!(self.header.refcount(), 0, "CallbackMsg reinit while still referenced");
        self.header.init(msg_id, ALLOC_ID_CALLBACK);
    }
}

/// Invoke the callback embedded just before `raw`'s header and run it
/// with the message's payload pointer.
///
/// The callback may re-initialize the message in place (write a new
/// payload, call `reinit`) but must not call `acquire`/publish it from
/// within itself — republication is only legal once the callback has
/// returned, matching the original library's contract for
/// `pub_sub_free_callback_msg`.
///
/// # Safety
/// `raw` must address a message whose allocator-id is
/// `ALLOC_ID_CALLBACK` and whose true layout is `CallbackMsg<_>`.
pub unsafe fn free_callback_msg(raw: &RawMsg) {
    debug_assert_eq!(raw.header().allocator_id(), ALLOC_ID_CALLBACK);
    let header_ptr = raw.as_ptr();
    let callback_ptr = header_ptr.sub(size_of::<CallbackFn>()) as *const CallbackFn;
    let callback = *callback_ptr;
    callback(raw.payload_ptr());
}
