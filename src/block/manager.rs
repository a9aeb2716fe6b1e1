use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::{debug, info, warn};

use super::codec::Codec;
use super::file::FileBlock;
use super::memory::{MemoryBlock, SerializedMemoryBlock};
use super::{Block, StoreKind};
use crate::config::SpillwayConfig;
use crate::edge::Persistence;
use crate::memory::StorageMemoryPool;
use crate::types::{BlockId, BlockState, PartitionKey, Result, SpillwayError};

/// Creates blocks and receives committed ones for downstream reads.
pub trait BlockManager<T>: Send + Sync {
    /// Creates an open block of `store` under `id`.
    fn create_block(&self, id: &BlockId, store: StoreKind) -> Result<Box<dyn Block<T>>>;

    /// Registers a committed block for `expected_reads` downstream reads.
    fn write_block(
        &self,
        block: Box<dyn Block<T>>,
        store: StoreKind,
        expected_reads: u32,
        persistence: Persistence,
    ) -> Result<()>;

    /// Records that the block `id` declared on `from` now lives on `to`.
    fn put_spilled_block(&self, id: &BlockId, from: StoreKind, to: StoreKind) -> Result<()>;
}

/// Registration details of a committed block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockInfo {
    /// Store the block was registered on.
    pub store: StoreKind,
    /// Number of downstream reads expected.
    pub expected_reads: u32,
    /// What happens after the reads complete.
    pub persistence: Persistence,
    /// Backing file, for file-tier blocks.
    pub location: Option<PathBuf>,
}

/// A memory-tier block replaced by its disk-tier twin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockReplacement {
    /// Shared id of both blocks.
    pub id: BlockId,
    /// Store the writer was declared with.
    pub from: StoreKind,
    /// Store the block actually lives on.
    pub to: StoreKind,
}

struct RegisteredBlock<T> {
    block: Box<dyn Block<T>>,
    info: BlockInfo,
}

/// In-process block registry backed by memory and a local spill directory.
pub struct LocalBlockManager<T> {
    spill_dir: PathBuf,
    codec: Arc<dyn Codec<T>>,
    pool: Option<Arc<StorageMemoryPool>>,
    blocks: Mutex<FxHashMap<BlockId, RegisteredBlock<T>>>,
    replacements: Mutex<Vec<BlockReplacement>>,
    created: AtomicU64,
}

impl<T> LocalBlockManager<T> {
    /// Creates a manager writing file-tier blocks under `spill_dir`.
    pub fn new(spill_dir: impl Into<PathBuf>, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            spill_dir: spill_dir.into(),
            codec,
            pool: None,
            blocks: Mutex::new(FxHashMap::default()),
            replacements: Mutex::new(Vec::new()),
            created: AtomicU64::new(0),
        }
    }

    /// Creates a manager spilling under the configured directory.
    pub fn from_config(config: &SpillwayConfig, codec: Arc<dyn Codec<T>>) -> Self {
        Self::new(config.spill.directory(), codec)
    }

    /// Returns block charges to `pool` when blocks are removed.
    pub fn with_pool(mut self, pool: Arc<StorageMemoryPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    /// Directory holding file-tier blocks.
    pub fn spill_dir(&self) -> &Path {
        &self.spill_dir
    }

    /// Registration details of `id`, if registered.
    pub fn info(&self, id: &BlockId) -> Option<BlockInfo> {
        self.blocks.lock().get(id).map(|entry| entry.info.clone())
    }

    /// Values of partition `key` of the registered block `id`, in write order.
    pub fn read_partition(&self, id: &BlockId, key: PartitionKey) -> Result<Vec<T>> {
        let blocks = self.blocks.lock();
        let entry = blocks
            .get(id)
            .ok_or_else(|| SpillwayError::NotFound(format!("block {id}")))?;
        entry.block.read_partition(key)
    }

    /// Drops the block `id`, returning its memory charge and deleting its file.
    pub fn remove_block(&self, id: &BlockId) -> Result<BlockInfo> {
        let entry = self
            .blocks
            .lock()
            .remove(id)
            .ok_or_else(|| SpillwayError::NotFound(format!("block {id}")))?;
        if let Some(pool) = &self.pool {
            if let Some(bytes) = pool.release_block(id) {
                debug!(block = %id, bytes, "block charge returned to storage pool");
            }
        }
        if let Some(path) = entry.block.location() {
            fs::remove_file(path)?;
        }
        Ok(entry.info)
    }

    /// Replacement notifications received so far, oldest first.
    pub fn replacements(&self) -> Vec<BlockReplacement> {
        self.replacements.lock().clone()
    }

    /// Number of blocks created through this manager.
    pub fn blocks_created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Number of committed blocks currently registered.
    pub fn registered_count(&self) -> usize {
        self.blocks.lock().len()
    }
}

impl<T: Clone + Send + 'static> BlockManager<T> for LocalBlockManager<T> {
    fn create_block(&self, id: &BlockId, store: StoreKind) -> Result<Box<dyn Block<T>>> {
        let block: Box<dyn Block<T>> = match store {
            StoreKind::Memory | StoreKind::MemoryFile => {
                Box::new(MemoryBlock::new(id.clone(), store))
            }
            StoreKind::SerializedMemory | StoreKind::SerializedMemoryFile => Box::new(
                SerializedMemoryBlock::new(id.clone(), store, Arc::clone(&self.codec)),
            ),
            StoreKind::LocalFile => Box::new(FileBlock::create(
                &self.spill_dir,
                id.clone(),
                store,
                Arc::clone(&self.codec),
            )?),
        };
        self.created.fetch_add(1, Ordering::Relaxed);
        debug!(block = %id, ?store, "block created");
        Ok(block)
    }

    fn write_block(
        &self,
        block: Box<dyn Block<T>>,
        store: StoreKind,
        expected_reads: u32,
        persistence: Persistence,
    ) -> Result<()> {
        if block.state() != BlockState::Committed {
            return Err(SpillwayError::BlockState {
                block: block.id().clone(),
                state: block.state(),
                op: "register",
            });
        }
        let id = block.id().clone();
        let info = BlockInfo {
            store,
            expected_reads,
            persistence,
            location: block.location().map(Path::to_path_buf),
        };
        debug!(block = %id, ?store, expected_reads, ?persistence, "block registered");
        if self
            .blocks
            .lock()
            .insert(id.clone(), RegisteredBlock { block, info })
            .is_some()
        {
            warn!(block = %id, "registration replaced an existing block");
        }
        Ok(())
    }

    fn put_spilled_block(&self, id: &BlockId, from: StoreKind, to: StoreKind) -> Result<()> {
        let registered = self.blocks.lock().get(id).map(|entry| entry.info.store);
        if registered != Some(to) {
            return Err(SpillwayError::NotFound(format!("spilled block {id} on {to:?}")));
        }
        info!(block = %id, ?from, ?to, "block replaced by disk-tier twin");
        self.replacements.lock().push(BlockReplacement {
            id: id.clone(),
            from,
            to,
        });
        Ok(())
    }
}
