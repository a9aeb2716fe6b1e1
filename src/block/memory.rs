use std::collections::BTreeMap;
use std::sync::Arc;

use super::codec::{decode_frames, encode_frame, Codec};
use super::{ensure_state, Block, PartitionSizes, StoreKind};
use crate::types::{BlockId, BlockState, PartitionKey, Result};

/// Block holding deserialized values; reports no partition sizes.
pub struct MemoryBlock<T> {
    id: BlockId,
    store: StoreKind,
    state: BlockState,
    pending: BTreeMap<PartitionKey, Vec<T>>,
    committed: Vec<(PartitionKey, Vec<T>)>,
}

impl<T> MemoryBlock<T> {
    /// Creates an open block.
    pub fn new(id: BlockId, store: StoreKind) -> Self {
        Self {
            id,
            store,
            state: BlockState::Open,
            pending: BTreeMap::new(),
            committed: Vec::new(),
        }
    }

    /// Number of sealed partitions.
    pub fn committed_partitions(&self) -> usize {
        self.committed.len()
    }
}

impl<T: Clone + Send> Block<T> for MemoryBlock<T> {
    fn id(&self) -> &BlockId {
        &self.id
    }

    fn store(&self) -> StoreKind {
        self.store
    }

    fn state(&self) -> BlockState {
        self.state
    }

    fn write(&mut self, key: PartitionKey, element: T) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "write")?;
        self.pending.entry(key).or_default().push(element);
        Ok(())
    }

    fn commit_partitions(&mut self) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "commit partitions of")?;
        self.committed
            .extend(std::mem::take(&mut self.pending).into_iter());
        Ok(())
    }

    fn commit(&mut self) -> Result<Option<PartitionSizes>> {
        self.commit_partitions()?;
        self.state = BlockState::Committed;
        Ok(None)
    }

    fn mark_spilled(&mut self) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "spill")?;
        self.pending.clear();
        self.committed.clear();
        self.state = BlockState::Spilled;
        Ok(())
    }

    fn read_partition(&self, key: PartitionKey) -> Result<Vec<T>> {
        ensure_state(&self.id, self.state, BlockState::Committed, "read")?;
        Ok(self
            .committed
            .iter()
            .filter(|(k, _)| *k == key)
            .flat_map(|(_, values)| values.iter().cloned())
            .collect())
    }
}

/// Block holding encoded values in memory; reports encoded partition sizes.
pub struct SerializedMemoryBlock<T> {
    id: BlockId,
    store: StoreKind,
    state: BlockState,
    codec: Arc<dyn Codec<T>>,
    pending: BTreeMap<PartitionKey, Vec<u8>>,
    committed: Vec<(PartitionKey, Vec<u8>)>,
    sizes: PartitionSizes,
    scratch: Vec<u8>,
}

impl<T> SerializedMemoryBlock<T> {
    /// Creates an open block encoding through `codec`.
    pub fn new(id: BlockId, store: StoreKind, codec: Arc<dyn Codec<T>>) -> Self {
        Self {
            id,
            store,
            state: BlockState::Open,
            codec,
            pending: BTreeMap::new(),
            committed: Vec::new(),
            sizes: PartitionSizes::new(),
            scratch: Vec::new(),
        }
    }
}

impl<T: Send> Block<T> for SerializedMemoryBlock<T> {
    fn id(&self) -> &BlockId {
        &self.id
    }

    fn store(&self) -> StoreKind {
        self.store
    }

    fn state(&self) -> BlockState {
        self.state
    }

    fn write(&mut self, key: PartitionKey, element: T) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "write")?;
        self.scratch.clear();
        self.codec.encode(&element, &mut self.scratch)?;
        let buf = self.pending.entry(key).or_default();
        let written = encode_frame(key, &self.scratch, buf)?;
        *self.sizes.entry(key).or_insert(0) += written as u64;
        Ok(())
    }

    fn commit_partitions(&mut self) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "commit partitions of")?;
        self.committed
            .extend(std::mem::take(&mut self.pending).into_iter());
        Ok(())
    }

    fn commit(&mut self) -> Result<Option<PartitionSizes>> {
        self.commit_partitions()?;
        self.state = BlockState::Committed;
        Ok(Some(self.sizes.clone()))
    }

    fn mark_spilled(&mut self) -> Result<()> {
        ensure_state(&self.id, self.state, BlockState::Open, "spill")?;
        self.pending.clear();
        self.committed.clear();
        self.sizes.clear();
        self.state = BlockState::Spilled;
        Ok(())
    }

    fn read_partition(&self, key: PartitionKey) -> Result<Vec<T>> {
        ensure_state(&self.id, self.state, BlockState::Committed, "read")?;
        let mut values = Vec::new();
        for (_, bytes) in self.committed.iter().filter(|(k, _)| *k == key) {
            for (_, payload) in decode_frames(bytes)? {
                values.push(self.codec.decode(payload)?);
            }
        }
        Ok(values)
    }
}
