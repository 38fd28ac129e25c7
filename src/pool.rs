// SPDX-License-Identifier: MIT
//
// The Pool collaborator contract (C2) plus FixedPool, the fixed-block
// free-list reference implementation this crate ships so the broker,
// registry and HSM engine are directly exercisable without an external
// allocator. Any other `Pool` implementation plugs in the same way.

use std::ptr::NonNull;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use slab::Slab;

use crate::header::{MsgHeader, PAYLOAD_ALIGN, PAYLOAD_OFFSET};

/// How long the caller is willing to wait for a blocking operation.
#[derive(Clone, Copy, Debug)]
pub enum Deadline {
    /// Return immediately if the operation cannot complete now.
    NoWait,
    /// Block until the operation completes.
    Forever,
    /// Block until the given instant.
    At(Instant),
}

impl Deadline {
    pub fn after(timeout: Duration) -> Self {
        Deadline::At(Instant::now() + timeout)
    }

    /// Remaining time budget, if any. `None` mirrors `Forever` — wait
    /// with no timeout. Returns `Some(Duration::ZERO)` for `NoWait` or
    /// an already-elapsed `At`.
    fn remaining(&self) -> Option<Duration> {
        match self {
            Deadline::NoWait => Some(Duration::ZERO),
            Deadline::Forever => None,
            Deadline::At(when) => Some(when.saturating_duration_since(Instant::now())),
        }
    }
}

/// A raw, allocator-owned block of memory: `block_size()` bytes holding
/// a `MsgHeader` immediately followed by payload bytes. Pool
/// implementations hand these out and take them back; everything above
/// the `Pool` trait interprets the header and payload through typed
/// wrappers (see `message.rs`).
pub struct Block {
    ptr: NonNull<u8>,
    size: usize,
}

unsafe impl Send for Block {}

impl Block {
    /// # Safety
    /// `ptr` must point to `size` initialized, uniquely-owned bytes
    /// that remain valid until the block is freed back to its pool.
    pub unsafe fn new(ptr: NonNull<u8>, size: usize) -> Self {
        debug_assert!(size >= PAYLOAD_OFFSET);
        debug_assert_eq!(ptr.as_ptr() as usize % PAYLOAD_ALIGN, 0, "block not payload-aligned");
        Self { ptr, size }
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn payload_size(&self) -> usize {
        self.size - PAYLOAD_OFFSET
    }

    pub fn header(&self) -> &MsgHeader {
        unsafe { &*(self.ptr.as_ptr() as *const MsgHeader) }
    }

    /// Pointer to the payload bytes, reserved at `PAYLOAD_OFFSET` from
    /// the block's start regardless of the concrete payload type.
    pub fn payload_ptr(&self) -> *mut u8 {
        unsafe { self.ptr.as_ptr().add(PAYLOAD_OFFSET) }
    }
}

/// Fixed-block allocator contract. Implementers supply the storage;
/// this crate's core never allocates memory of its own.
pub trait Pool: Send + Sync {
    /// Allocate one block, blocking up to `deadline` if none is free.
    fn allocate(&self, deadline: Deadline) -> Option<Block>;

    /// Return a block to the free list. Must be safe to call from any
    /// context the broker dispatches in.
    fn free(&self, block: Block);

    /// Size in bytes of every block this pool hands out (header +
    /// payload slot).
    fn block_size(&self) -> usize;
}

/// A bounded-capacity, fixed-size-block pool backed by a `slab::Slab`
/// index allocator over a flat byte arena, the way the teacher crate's
/// `SlabPool` bounds a fixed-size object pool and `ChunkInfo` manages a
/// free list over a flat arena under a lock.
pub struct FixedPool<const BLOCK: usize> {
    capacity: usize,
    storage: Mutex<Inner<BLOCK>>,
    not_empty: Condvar,
}

/// Wraps a `[u8; BLOCK]` in a struct whose own alignment is forced to
/// `PAYLOAD_ALIGN` via a zero-sized `usize` array, so the heap
/// allocation backing each slab entry is always payload-aligned — a
/// plain `Box<[u8; BLOCK]>` only guarantees 1-byte alignment.
#[repr(C)]
struct AlignedBlock<const BLOCK: usize> {
    _align: [usize; 0],
    bytes: [u8; BLOCK],
}

struct Inner<const BLOCK: usize> {
    slab: Slab<Box<AlignedBlock<BLOCK>>>,
}

impl<const BLOCK: usize> FixedPool<BLOCK> {
    pub fn new(capacity: usize) -> Self {
        assert!(BLOCK >= PAYLOAD_OFFSET, "block size too small to hold a header and aligned payload");
        Self {
            capacity,
            storage: Mutex::new(Inner { slab: Slab::with_capacity(capacity) }),
            not_empty: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_use(&self) -> usize {
        self.storage.lock().unwrap().slab.len()
    }
}

impl<const BLOCK: usize> Pool for FixedPool<BLOCK> {
    fn allocate(&self, deadline: Deadline) -> Option<Block> {
        let mut inner = self.storage.lock().unwrap();
        loop {
            if inner.slab.len() < self.capacity {
                let entry = inner.slab.vacant_entry();
                let key = entry.key();
                let mut boxed: Box<AlignedBlock<BLOCK>> =
                    Box::new(AlignedBlock { _align: [], bytes: [0u8; BLOCK] });
                // Safe: `ptr` addresses the heap allocation the box
                // manages, not the (about to move) box handle itself.
                let ptr = unsafe { NonNull::new_unchecked(boxed.bytes.as_mut_ptr()) };
                entry.insert(boxed);
                log::trace!("FixedPool: allocated slot {key}");
                return Some(unsafe { Block::new(ptr, BLOCK) });
            }
            match deadline.remaining() {
                Some(d) if d.is_zero() => return None,
                Some(d) => {
                    let (guard, timed_out) = self.not_empty.wait_timeout(inner, d).unwrap();
                    inner = guard;
                    if timed_out.timed_out() {
                        return None;
                    }
                }
                None => {
                    inner = self.not_empty.wait(inner).unwrap();
                }
            }
        }
    }

    fn free(&self, block: Block) {
        debug_assert_eq!(block.size(), BLOCK);
        let mut inner = self.storage.lock().unwrap();
        // Find and remove the slab entry whose storage backs this
        // pointer. Blocks always originate from this pool's own slab,
        // so pointer identity is enough — no separate index needs to
        // travel with the Block.
        let target = block.as_ptr();
        let key = inner
            .slab
            .iter()
            .find(|(_, boxed)| boxed.bytes.as_ptr() as *mut u8 == target)
            .map(|(key, _)| key);
        if let Some(key) = key {
            let boxed = inner.slab.remove(key);
            drop(boxed);
        } else {
            log::warn!("FixedPool::free called with a block this pool does not own");
        }
        drop(inner);
        self.not_empty.notify_one();
    }

    fn block_size(&self) -> usize {
        BLOCK
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_and_free_roundtrip() {
        let pool: FixedPool<64> = FixedPool::new(4);
        let a = pool.allocate(Deadline::NoWait).unwrap();
        let b = pool.allocate(Deadline::NoWait).unwrap();
        assert_eq!(pool.in_use(), 2);
        pool.free(a);
        assert_eq!(pool.in_use(), 1);
        pool.free(b);
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn exhaustion_returns_none_then_recovers() {
        let pool: FixedPool<64> = FixedPool::new(1);
        let a = pool.allocate(Deadline::NoWait).unwrap();
        assert!(pool.allocate(Deadline::NoWait).is_none());
        pool.free(a);
        assert!(pool.allocate(Deadline::NoWait).is_some());
    }
}
