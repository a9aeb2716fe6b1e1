#![forbid(unsafe_code)]

//! Process-wide storage-memory budget shared by every block writer.

use std::sync::atomic::{AtomicI64, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info};

use crate::config::MemoryConfig;
use crate::types::BlockId;

/// Shared counter of storage memory still available for memory-tier blocks.
///
/// [`acquire`](Self::acquire) always subtracts, even when it reports a
/// denial, so the counter may go negative. Every caller that is denied must
/// hand the same amount back through [`release`](Self::release); the block
/// output writer is the only caller in this crate and follows that rule.
/// Denial is immediate: nothing here blocks.
#[derive(Debug)]
pub struct StorageMemoryPool {
    capacity: u64,
    remaining: AtomicI64,
    charges: Mutex<FxHashMap<BlockId, u64>>,
}

fn signed(amount: u64) -> i64 {
    i64::try_from(amount).unwrap_or(i64::MAX)
}

impl StorageMemoryPool {
    /// Creates a pool holding `capacity` bytes.
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            remaining: AtomicI64::new(signed(capacity)),
            charges: Mutex::new(FxHashMap::default()),
        }
    }

    /// Sizes the pool as the storage share of the executor's memory.
    pub fn from_config(config: &MemoryConfig) -> Self {
        let capacity = config.storage_pool_bytes();
        info!(
            executor_memory_mb = config.executor_memory_mb,
            ratio = config.storage_pool_ratio,
            capacity,
            "storage memory pool configured"
        );
        Self::new(capacity)
    }

    /// Subtracts `amount` and reports whether the pool is still positive.
    pub fn acquire(&self, amount: u64) -> bool {
        let amount = signed(amount);
        let previous = self.remaining.fetch_sub(amount, Ordering::AcqRel);
        let remaining = previous.wrapping_sub(amount);
        debug!(amount, previous, remaining, "storage memory acquire");
        remaining > 0
    }

    /// Adds `amount` back to the pool.
    pub fn release(&self, amount: u64) {
        let amount = signed(amount);
        let previous = self.remaining.fetch_add(amount, Ordering::AcqRel);
        debug!(
            amount,
            remaining = previous.wrapping_add(amount),
            "storage memory release"
        );
    }

    /// Current counter value; negative while denied callers have not yet released.
    pub fn remaining(&self) -> i64 {
        self.remaining.load(Ordering::Acquire)
    }

    /// Bytes the pool started with.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Acquires `amount` on behalf of `block`, recording the charge only if granted.
    ///
    /// A denied caller still owes a [`release`](Self::release) of `amount`.
    pub fn reserve_block(&self, block: &BlockId, amount: u64) -> bool {
        let granted = self.acquire(amount);
        if granted {
            *self.charges.lock().entry(block.clone()).or_insert(0) += amount;
        }
        granted
    }

    /// Releases whatever was recorded for `block` and forgets it.
    pub fn release_block(&self, block: &BlockId) -> Option<u64> {
        let charged = self.charges.lock().remove(block)?;
        self.release(charged);
        Some(charged)
    }

    /// Bytes currently recorded against `block`.
    pub fn charged(&self, block: &BlockId) -> Option<u64> {
        self.charges.lock().get(block).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{EdgeId, TaskId};

    fn block(name: &str) -> BlockId {
        BlockId::new(&EdgeId::from(name), &TaskId::from("t0"))
    }

    #[test]
    fn acquire_reports_strictly_positive_remainder() {
        let pool = StorageMemoryPool::new(1000);
        assert!(pool.acquire(800));
        assert_eq!(pool.remaining(), 200);
        assert!(!pool.acquire(200));
        assert_eq!(pool.remaining(), 0);
    }

    #[test]
    fn denied_acquire_still_subtracts_until_released() {
        let pool = StorageMemoryPool::new(1000);
        assert!(!pool.acquire(1200));
        assert_eq!(pool.remaining(), -200);
        pool.release(1200);
        assert_eq!(pool.remaining(), 1000);
    }

    #[test]
    fn block_charges_are_recorded_only_on_grant() {
        let pool = StorageMemoryPool::new(1000);
        let a = block("a");
        let b = block("b");
        assert!(pool.reserve_block(&a, 300));
        assert_eq!(pool.charged(&a), Some(300));
        assert!(!pool.reserve_block(&b, 5000));
        assert_eq!(pool.charged(&b), None);
        pool.release(5000);
        assert_eq!(pool.release_block(&a), Some(300));
        assert_eq!(pool.release_block(&a), None);
        assert_eq!(pool.remaining(), 1000);
    }

    #[test]
    fn sized_from_executor_memory() {
        let config = MemoryConfig {
            executor_memory_mb: 100,
            storage_pool_ratio: 0.5,
        };
        let pool = StorageMemoryPool::from_config(&config);
        assert_eq!(pool.capacity(), 50 * 1024 * 1024);
        assert_eq!(pool.remaining(), 50 * 1024 * 1024);
    }
}
