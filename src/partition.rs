//! Element-to-partition mapping.

use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use rustc_hash::FxHasher;

use crate::types::{PartitionKey, Result, SpillwayError};

/// Maps an element to the partition it is written under.
pub trait Partitioner<T>: Send {
    /// Partition key for `element`.
    fn partition(&self, element: &T) -> PartitionKey;

    /// Whether every element gets a key of its own.
    ///
    /// Writers commit a block's partitions after each element when this holds.
    fn dedicated_key_per_element(&self) -> bool {
        false
    }
}

/// Sends every element to partition 0.
#[derive(Debug, Default, Clone, Copy)]
pub struct IntactPartitioner;

impl<T> Partitioner<T> for IntactPartitioner {
    fn partition(&self, _element: &T) -> PartitionKey {
        PartitionKey(0)
    }
}

/// Hashes each element into one of a fixed number of partitions.
#[derive(Debug)]
pub struct HashPartitioner<T> {
    partitions: u32,
    _marker: PhantomData<fn(&T)>,
}

impl<T> HashPartitioner<T> {
    /// Creates a partitioner over `partitions` keys; must be positive.
    pub fn new(partitions: u32) -> Result<Self> {
        if partitions == 0 {
            return Err(SpillwayError::Invalid("partition count must be positive"));
        }
        Ok(Self {
            partitions,
            _marker: PhantomData,
        })
    }
}

impl<T: Hash> Partitioner<T> for HashPartitioner<T> {
    fn partition(&self, element: &T) -> PartitionKey {
        let mut hasher = FxHasher::default();
        element.hash(&mut hasher);
        PartitionKey((hasher.finish() % u64::from(self.partitions)) as u32)
    }
}

/// Hands out a fresh key for every element, in write order.
#[derive(Debug, Default)]
pub struct DedicatedKeyPartitioner {
    next: AtomicU32,
}

impl<T> Partitioner<T> for DedicatedKeyPartitioner {
    fn partition(&self, _element: &T) -> PartitionKey {
        PartitionKey(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn dedicated_key_per_element(&self) -> bool {
        true
    }
}
