// SPDX-License-Identifier: MIT
//
// Allocator registry (C3): maps an 8-bit allocator-id to a registered
// Pool, assigns ids in registration order, and dispatches release to
// the owning pool, the callback-class handler, or a no-op for static
// messages.

use std::sync::{Arc, Mutex};

use thiserror::Error;

use crate::callback_msg::free_callback_msg;
use crate::header::{ALLOC_ID_CALLBACK, ALLOC_ID_STATIC};
use crate::message::RawMsg;
use crate::pool::{Block, Deadline, Pool};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("allocator-id space exhausted (at most {0} pools may be registered)")]
    OutOfSlots(usize),
}

/// A stable, never-reused allocator id.
pub type AllocId = u8;

/// Default pool-table bound, used by the optional process-wide
/// default broker (`default_broker::default_broker`). Callers building
/// their own `Broker<MAX_POOLS>` are free to pick any bound.
pub const MAX_POOLS: usize = 8;

struct Inner {
    pools: Vec<Arc<dyn Pool>>,
    frozen: bool,
}

/// Maps allocator-ids to pools and dispatches `release`.
///
/// Cheaply cloneable: internally `Arc`-wrapped, like the broker and
/// message handles that need to share one registry across threads.
#[derive(Clone)]
pub struct AllocatorRegistry<const MAX_POOLS: usize> {
    inner: Arc<Mutex<Inner>>,
}

impl<const MAX_POOLS: usize> AllocatorRegistry<MAX_POOLS> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner { pools: Vec::new(), frozen: false })),
        }
    }

    /// Register a pool, returning its stable allocator-id.
    ///
    /// Ids are assigned in registration order starting at 0.
    /// Registering after any `new_msg` call on this registry is a
    /// freeze violation: debug builds assert, release builds simply
    /// risk colliding ids with already-allocated messages, exactly as
    /// the original C library's doc-only warning describes.
    pub fn register(&self, pool: Arc<dyn Pool>) -> Result<AllocId, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        debug_assert!(
            !inner.frozen,
            "registering a pool after messages have been allocated invalidates existing allocator ids"
        );
        if inner.pools.len() >= MAX_POOLS {
            return Err(RegistryError::OutOfSlots(MAX_POOLS));
        }
        inner.pools.push(pool);
        let id = (inner.pools.len() - 1) as AllocId;
        log::debug!("registered pool {id} (block_size={})", inner.pools[id as usize].block_size());
        Ok(id)
    }

    /// Allocate a message from the pool registered under `alloc_id`,
    /// writing the header with `(msg_id, alloc_id, refcount=1)`.
    pub fn new_msg(
        &self,
        alloc_id: AllocId,
        msg_id: u16,
        payload_size: usize,
        deadline: Deadline,
    ) -> Option<Block> {
        let pool = {
            let mut inner = self.inner.lock().unwrap();
            inner.frozen = true;
            inner.pools.get(alloc_id as usize).cloned()?
        };
        debug_assert!(
            pool.block_size() >= payload_size + crate::header::PAYLOAD_OFFSET,
            "requested payload does not fit in allocator {alloc_id}'s block size"
        );
        let block = pool.allocate(deadline)?;
        block.header().init(msg_id, alloc_id);
        Some(block)
    }

    /// Release one reference. On the 1→0 transition, dispatches the
    /// free back to the owning pool, invokes the callback-class
    /// handler, or is a no-op for static messages.
    pub fn release(&self, raw: RawMsg) {
        let prev = raw.header().release();
        if prev != 1 {
            return;
        }
        match raw.header().allocator_id() {
            ALLOC_ID_STATIC => {
                // Program-owned storage; nothing to free.
            }
            ALLOC_ID_CALLBACK => unsafe {
                free_callback_msg(&raw);
            },
            id => {
                let pool = {
                    let inner = self.inner.lock().unwrap();
                    inner.pools.get(id as usize).cloned()
                };
                match pool {
                    Some(pool) => {
                        // Safety: this pool handed `raw` out originally, so
                        // its pointer addresses `pool.block_size()` bytes
                        // owned by this pool.
                        let block = unsafe {
                            Block::new(
                                std::ptr::NonNull::new_unchecked(raw.as_ptr()),
                                pool.block_size(),
                            )
                        };
                        pool.free(block)
                    }
                    None => log::error!("release: allocator-id {id} does not resolve to a pool"),
                }
            }
        }
    }
}

impl<const MAX_POOLS: usize> Default for AllocatorRegistry<MAX_POOLS> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::FixedPool;

    #[test]
    fn register_assigns_ids_in_order() {
        let registry: AllocatorRegistry<4> = AllocatorRegistry::new();
        let a: Arc<dyn Pool> = Arc::new(FixedPool::<32>::new(4));
        let b: Arc<dyn Pool> = Arc::new(FixedPool::<32>::new(4));
        assert_eq!(registry.register(a).unwrap(), 0);
        assert_eq!(registry.register(b).unwrap(), 1);
    }

    #[test]
    fn out_of_slots() {
        let registry: AllocatorRegistry<1> = AllocatorRegistry::new();
        let a: Arc<dyn Pool> = Arc::new(FixedPool::<32>::new(4));
        let b: Arc<dyn Pool> = Arc::new(FixedPool::<32>::new(4));
        registry.register(a).unwrap();
        assert_eq!(registry.register(b), Err(RegistryError::OutOfSlots(1)));
    }

    #[test]
    fn new_msg_and_release_roundtrip() {
        let registry: AllocatorRegistry<2> = AllocatorRegistry::new();
        let pool: Arc<dyn Pool> = Arc::new(FixedPool::<32>::new(2));
        let id = registry.register(pool.clone()).unwrap();
        let block = registry.new_msg(id, 42, 4, Deadline::NoWait).unwrap();
        assert_eq!(block.header().msg_id(), 42);
        assert_eq!(block.header().refcount(), 1);
        let raw = unsafe { RawMsg::from_header_ptr(std::ptr::NonNull::new_unchecked(block.as_ptr())) };
        std::mem::forget(block);
        registry.release(raw);
    }
}
