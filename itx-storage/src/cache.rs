//! Read caches in front of the gateway.
//!
//! Both caches are plain LRUs. They are never updated by an import, only invalidated through
//! [`ChainCache`], so a read after an import always goes back to the store.

use std::{
    num::NonZeroUsize,
    sync::{Mutex, MutexGuard, PoisonError},
};

use itx_common::{
    models::{address::AddressParam, Address, BlockHash, BlockNumber},
    storage::ChainCache,
};
use lru::LruCache;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 10_000;

#[derive(Debug)]
pub struct EntityCache {
    addresses: Mutex<LruCache<Address, AddressParam>>,
    block_hashes: Mutex<LruCache<BlockNumber, BlockHash>>,
}

impl Default for EntityCache {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN))
    }
}

impl EntityCache {
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            addresses: Mutex::new(LruCache::new(capacity)),
            block_hashes: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get_address(&self, address: &Address) -> Option<AddressParam> {
        lock(&self.addresses)
            .get(address)
            .cloned()
    }

    pub fn put_address(&self, address: AddressParam) {
        lock(&self.addresses).put(address.hash, address);
    }

    pub fn get_block_hash(&self, block_number: BlockNumber) -> Option<BlockHash> {
        lock(&self.block_hashes)
            .get(&block_number)
            .copied()
    }

    pub fn put_block_hash(&self, block_number: BlockNumber, hash: BlockHash) {
        lock(&self.block_hashes).put(block_number, hash);
    }

    pub fn len(&self) -> (usize, usize) {
        (lock(&self.addresses).len(), lock(&self.block_hashes).len())
    }
}

impl ChainCache for EntityCache {
    fn evict_addresses(&self, addresses: &[Address]) {
        let mut cache = lock(&self.addresses);
        for address in addresses {
            cache.pop(address);
        }
        trace!(count = addresses.len(), "Evicted addresses");
    }

    fn evict_blocks(&self, block_numbers: &[BlockNumber]) {
        let mut cache = lock(&self.block_hashes);
        for block_number in block_numbers {
            cache.pop(block_number);
        }
        trace!(count = block_numbers.len(), "Evicted blocks");
    }
}

/// A panic while holding the lock can not leave an LRU in a state that matters for a cache.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
}
