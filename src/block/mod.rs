#![forbid(unsafe_code)]

//! Physical blocks and the registry that receives committed ones.

use std::collections::BTreeMap;
use std::path::Path;

use crate::types::{BlockId, BlockState, PartitionKey, Result, SpillwayError};

mod codec;
mod file;
mod manager;
mod memory;

pub use codec::{decode_frames, encode_frame, Codec, JsonCodec, FRAME_HEADER_LEN};
pub use file::FileBlock;
pub use manager::{BlockInfo, BlockManager, BlockReplacement, LocalBlockManager};
pub use memory::{MemoryBlock, SerializedMemoryBlock};

/// Committed byte size of each partition of a block.
pub type PartitionSizes = BTreeMap<PartitionKey, u64>;

/// Storage tier a block is declared to live in.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum StoreKind {
    /// Deserialized values in process memory.
    Memory,
    /// Encoded values in process memory.
    SerializedMemory,
    /// Encoded values in a local file.
    LocalFile,
    /// Deserialized values in memory when the storage pool admits them, else a local file.
    MemoryFile,
    /// Encoded values in memory when the storage pool admits them, else a local file.
    SerializedMemoryFile,
}

impl StoreKind {
    /// Whether output on this store is buffered and may spill to a local file.
    pub fn spills_to_disk(self) -> bool {
        matches!(self, StoreKind::MemoryFile | StoreKind::SerializedMemoryFile)
    }

    /// Whether the block is held in process memory.
    pub fn is_memory_tier(self) -> bool {
        !matches!(self, StoreKind::LocalFile)
    }

    /// Whether committing a block of this store reports partition sizes.
    pub fn tracks_sizes(self) -> bool {
        !matches!(self, StoreKind::Memory | StoreKind::MemoryFile)
    }
}

/// A keyed, partitioned unit of output that is committed exactly once.
pub trait Block<T>: Send {
    /// Block identifier.
    fn id(&self) -> &BlockId;

    /// Store this block materializes.
    fn store(&self) -> StoreKind;

    /// Current lifecycle state.
    fn state(&self) -> BlockState;

    /// Appends `element` to partition `key`.
    fn write(&mut self, key: PartitionKey, element: T) -> Result<()>;

    /// Seals the partitions written so far; later writes start new partitions.
    fn commit_partitions(&mut self) -> Result<()>;

    /// Seals the block; returns partition sizes when the store tracks them.
    fn commit(&mut self) -> Result<Option<PartitionSizes>>;

    /// Abandons an open block after its data moved to a disk-resident twin.
    fn mark_spilled(&mut self) -> Result<()>;

    /// Values of partition `key` in write order; the block must be committed.
    fn read_partition(&self, key: PartitionKey) -> Result<Vec<T>>;

    /// On-disk location, for stores backed by a file.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// Sum of partition sizes, the total a writer reports.
pub fn total_size(sizes: &PartitionSizes) -> u64 {
    sizes.values().sum()
}

pub(crate) fn ensure_state(
    id: &BlockId,
    state: BlockState,
    expected: BlockState,
    op: &'static str,
) -> Result<()> {
    if state == expected {
        Ok(())
    } else {
        Err(SpillwayError::BlockState {
            block: id.clone(),
            state,
            op,
        })
    }
}
