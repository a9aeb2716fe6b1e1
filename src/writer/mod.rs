#![forbid(unsafe_code)]

//! Per task-output-edge writer that buffers, admits or spills, and commits one block.

use std::sync::Arc;

use tracing::{debug, info, trace, warn};

use crate::block::{total_size, Block, StoreKind};
use crate::edge::{CommunicationPattern, Persistence, RuntimeEdge, VertexProperties};
use crate::estimate::{Estimate, SizeTracker};
use crate::partition::Partitioner;
use crate::types::{BlockId, Result, SpillwayError, TaskId};

mod context;

pub use context::WriterContext;

/// Event-time progress marker forwarded by upstream operators.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct Watermark(pub u64);

/// Where a writer is in its lifecycle.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum WriterState {
    /// Accepting writes.
    Writing,
    /// Closed with its block committed to a memory-tier store.
    CommittedMemory,
    /// Closed with its block committed to a local file.
    CommittedDisk,
    /// Output is carried by another edge of the duplicate group; writes and close do nothing.
    NoOp,
}

/// Writes the output of one task on one edge into exactly one committed block.
///
/// Edges declared on a memory-with-file-fallback store buffer every element
/// in a [`SizeTracker`]. On [`close`](Self::close) the tracked size is
/// offered to the storage pool: if admitted the buffer is flushed into the
/// memory-tier block, otherwise it is replayed in order into a file block
/// sharing the same id and the tentative pool charge is handed back. Every
/// other store is written through directly.
pub struct BlockOutputWriter<T> {
    edge: RuntimeEdge,
    dst: VertexProperties,
    partitioner: Box<dyn Partitioner<T>>,
    ctx: WriterContext<T>,
    block_id: BlockId,
    store: StoreKind,
    block: Option<Box<dyn Block<T>>>,
    tracker: Option<SizeTracker<T>>,
    state: WriterState,
    written_bytes: Option<u64>,
    spilled: bool,
}

impl<T: Estimate + Send> BlockOutputWriter<T> {
    /// Creates the writer for `task` on `edge` towards `dst`.
    ///
    /// Fails when the edge has no declared store. A non-representative
    /// member of a duplicate group gets a writer that never touches a block.
    pub fn new(
        task: &TaskId,
        edge: RuntimeEdge,
        dst: VertexProperties,
        partitioner: Box<dyn Partitioner<T>>,
        ctx: WriterContext<T>,
    ) -> Result<Self> {
        let store = edge.store()?;
        let block_id = BlockId::new(edge.id(), task);
        let mut writer = Self {
            edge,
            dst,
            partitioner,
            ctx,
            block_id,
            store,
            block: None,
            tracker: None,
            state: WriterState::Writing,
            written_bytes: None,
            spilled: false,
        };
        if writer.edge.is_duplicate_omitted() {
            trace!(
                block = %writer.block_id,
                edge = %writer.edge.id(),
                "duplicate edge output omitted"
            );
            writer.ctx.metrics.duplicate_omitted();
            writer.state = WriterState::NoOp;
            return Ok(writer);
        }
        writer.block = Some(writer.ctx.manager.create_block(&writer.block_id, store)?);
        if store.spills_to_disk() {
            writer.tracker = Some(SizeTracker::new(
                Arc::clone(&writer.ctx.estimator),
                &writer.ctx.tracker,
            )?);
        }
        Ok(writer)
    }

    /// Buffers or writes one element.
    pub fn write(&mut self, element: T) -> Result<()> {
        match self.state {
            WriterState::Writing => {}
            WriterState::NoOp => return Ok(()),
            _ => return Err(SpillwayError::Invalid("write on a closed writer")),
        }
        if let Some(tracker) = self.tracker.as_mut() {
            let before = tracker.samples_taken();
            tracker.append(element)?;
            if tracker.samples_taken() > before {
                self.ctx.metrics.tracker_sampled();
            }
            return Ok(());
        }
        let block = self
            .block
            .as_mut()
            .ok_or(SpillwayError::Invalid("writer has no open block"))?;
        let key = self.partitioner.partition(&element);
        block.write(key, element)?;
        if self.partitioner.dedicated_key_per_element() {
            block.commit_partitions()?;
        }
        Ok(())
    }

    /// Watermarks pass through this layer untouched.
    pub fn write_watermark(&mut self, _watermark: Watermark) {}

    /// Decides the storage tier, commits the block and registers it.
    ///
    /// Required edge properties are checked before anything is committed.
    /// Denied admission is not an error: the block is spilled instead.
    pub fn close(&mut self) -> Result<()> {
        match self.state {
            WriterState::Writing => {}
            WriterState::NoOp => return Ok(()),
            _ => return Err(SpillwayError::Invalid("writer already closed")),
        }
        let persistence = self.edge.persistence()?;
        let expected_reads = self.expected_reads()?;
        let block = self
            .block
            .take()
            .ok_or(SpillwayError::Invalid("writer has no open block"))?;

        let Some(mut tracker) = self.tracker.take() else {
            let next = if self.store.is_memory_tier() {
                WriterState::CommittedMemory
            } else {
                WriterState::CommittedDisk
            };
            return self.commit(block, self.store, expected_reads, persistence, next);
        };

        let candidate = tracker.estimate_size();
        let elements = tracker.take_elements()?;
        if self.ctx.pool.reserve_block(&self.block_id, candidate) {
            debug!(
                block = %self.block_id,
                bytes = candidate,
                remaining = self.ctx.pool.remaining(),
                "storage memory granted"
            );
            self.ctx.metrics.admission_granted(candidate);
            let outcome = self.admit(block, elements, expected_reads, persistence);
            if let Err(err) = &outcome {
                warn!(block = %self.block_id, %err, "admitted block failed to commit");
                self.ctx.pool.release_block(&self.block_id);
            }
            return outcome;
        }

        info!(
            block = %self.block_id,
            remaining = self.ctx.pool.remaining(),
            size = candidate,
            "not enough storage memory, spilling block"
        );
        self.ctx.metrics.admission_denied(candidate);
        let outcome = self.spill(block, elements, expected_reads, persistence);
        self.ctx.pool.release(candidate);
        outcome
    }

    /// Reads downstream consumers will issue against the committed block.
    ///
    /// One per block for one-to-one edges, else the destination parallelism,
    /// multiplied by the duplicate group size.
    pub fn expected_reads(&self) -> Result<u32> {
        let per_block = match self.edge.pattern()? {
            CommunicationPattern::OneToOne => 1,
            CommunicationPattern::BroadCast | CommunicationPattern::Shuffle => {
                self.dst.parallelism(&self.edge)?
            }
        };
        Ok(per_block.saturating_mul(self.edge.duplicate_multiplier()))
    }

    /// Total committed bytes, when the committed store reports sizes.
    pub fn written_bytes(&self) -> Option<u64> {
        self.written_bytes
    }

    /// Whether the output went to a file because the pool refused it.
    pub fn is_spilled(&self) -> bool {
        self.spilled
    }

    /// Lifecycle state.
    pub fn state(&self) -> WriterState {
        self.state
    }

    /// Id of the block this writer produces.
    pub fn block_id(&self) -> &BlockId {
        &self.block_id
    }

    /// Running size estimate of the buffer, for buffering stores.
    pub fn tracked_size(&self) -> Option<u64> {
        self.tracker.as_ref().map(SizeTracker::estimate_size)
    }

    fn flush(&self, block: &mut dyn Block<T>, elements: Vec<T>) -> Result<()> {
        let eager = self.partitioner.dedicated_key_per_element();
        for element in elements {
            let key = self.partitioner.partition(&element);
            block.write(key, element)?;
            if eager {
                block.commit_partitions()?;
            }
        }
        Ok(())
    }

    fn admit(
        &mut self,
        mut block: Box<dyn Block<T>>,
        elements: Vec<T>,
        expected_reads: u32,
        persistence: Persistence,
    ) -> Result<()> {
        self.flush(block.as_mut(), elements)?;
        self.commit(
            block,
            self.store,
            expected_reads,
            persistence,
            WriterState::CommittedMemory,
        )
    }

    fn spill(
        &mut self,
        mut candidate: Box<dyn Block<T>>,
        elements: Vec<T>,
        expected_reads: u32,
        persistence: Persistence,
    ) -> Result<()> {
        candidate.mark_spilled()?;
        let mut fallback = self
            .ctx
            .manager
            .create_block(&self.block_id, StoreKind::LocalFile)?;
        self.flush(fallback.as_mut(), elements)?;
        self.commit(
            fallback,
            StoreKind::LocalFile,
            expected_reads,
            persistence,
            WriterState::CommittedDisk,
        )?;
        self.ctx
            .manager
            .put_spilled_block(&self.block_id, self.store, StoreKind::LocalFile)?;
        self.spilled = true;
        Ok(())
    }

    fn commit(
        &mut self,
        mut block: Box<dyn Block<T>>,
        store: StoreKind,
        expected_reads: u32,
        persistence: Persistence,
        next: WriterState,
    ) -> Result<()> {
        let total = block.commit()?.as_ref().map(total_size);
        self.written_bytes = total;
        self.ctx.metrics.block_committed(store, total);
        self.ctx
            .manager
            .write_block(block, store, expected_reads, persistence)?;
        self.state = next;
        debug!(block = %self.block_id, ?store, bytes = ?total, expected_reads, "block committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockManager, Codec, JsonCodec, LocalBlockManager, PartitionSizes};
    use crate::config::SpillwayConfig;
    use crate::edge::DuplicateEdgeGroup;
    use crate::memory::StorageMemoryPool;
    use crate::metrics::{CounterMetrics, ShuffleMetrics};
    use crate::partition::{DedicatedKeyPartitioner, IntactPartitioner};
    use crate::types::{BlockState, EdgeId, PartitionKey};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        manager: Arc<LocalBlockManager<u64>>,
        metrics: Arc<CounterMetrics>,
        ctx: WriterContext<u64>,
    }

    fn fixture(pool_bytes: u64) -> Fixture {
        let dir = tempdir().expect("tempdir");
        let manager = Arc::new(LocalBlockManager::new(
            dir.path(),
            Arc::new(JsonCodec::<u64>::new()),
        ));
        let metrics = Arc::new(CounterMetrics::default());
        let ctx = WriterContext::new(
            Arc::clone(&manager) as Arc<dyn BlockManager<u64>>,
            Arc::new(StorageMemoryPool::new(pool_bytes)),
        )
        .with_metrics(Arc::clone(&metrics) as Arc<dyn ShuffleMetrics>);
        Fixture {
            _dir: dir,
            manager,
            metrics,
            ctx,
        }
    }

    fn edge(id: &str, store: StoreKind) -> RuntimeEdge {
        RuntimeEdge::new(id)
            .with_store(store)
            .with_pattern(CommunicationPattern::Shuffle)
            .with_persistence(Persistence::Keep)
    }

    fn dst() -> VertexProperties {
        VertexProperties::new("v2").with_parallelism(2)
    }

    #[test]
    fn non_representative_duplicate_never_touches_a_block() -> Result<()> {
        let fx = fixture(1 << 20);
        let group = DuplicateEdgeGroup {
            group_id: "g".into(),
            group_size: 2,
            representative: EdgeId::from("e-rep"),
        };
        let mut writer = BlockOutputWriter::new(
            &TaskId::from("t0"),
            edge("e-dup", StoreKind::MemoryFile).with_duplicate_group(group),
            dst(),
            Box::new(IntactPartitioner),
            fx.ctx.clone(),
        )?;
        assert_eq!(writer.state(), WriterState::NoOp);
        for value in 0..10u64 {
            writer.write(value)?;
        }
        writer.close()?;
        assert_eq!(fx.manager.blocks_created(), 0);
        assert_eq!(fx.manager.registered_count(), 0);
        assert_eq!(fx.metrics.snapshot().duplicates_omitted, 1);
        assert_eq!(fx.ctx.pool().remaining(), 1 << 20);
        Ok(())
    }

    #[test]
    fn file_store_writes_through_with_eager_partition_commits() -> Result<()> {
        let fx = fixture(1 << 20);
        let mut writer = BlockOutputWriter::new(
            &TaskId::from("t1"),
            edge("e1", StoreKind::LocalFile),
            dst(),
            Box::new(DedicatedKeyPartitioner::default()),
            fx.ctx.clone(),
        )?;
        assert_eq!(writer.tracked_size(), None);
        writer.write(10)?;
        writer.write(20)?;
        writer.close()?;
        assert_eq!(writer.state(), WriterState::CommittedDisk);
        assert!(!writer.is_spilled());
        // "10" and "20" framed with a 12-byte header each
        assert_eq!(writer.written_bytes(), Some(28));
        let id = writer.block_id().clone();
        assert_eq!(fx.manager.read_partition(&id, PartitionKey(0))?, vec![10]);
        assert_eq!(fx.manager.read_partition(&id, PartitionKey(1))?, vec![20]);
        assert_eq!(fx.manager.info(&id).map(|info| info.expected_reads), Some(2));
        Ok(())
    }

    #[test]
    fn missing_persistence_fails_close_before_committing() -> Result<()> {
        let fx = fixture(1 << 20);
        let edge = RuntimeEdge::new("e2")
            .with_store(StoreKind::MemoryFile)
            .with_pattern(CommunicationPattern::OneToOne);
        let mut writer = BlockOutputWriter::new(
            &TaskId::from("t2"),
            edge,
            dst(),
            Box::new(IntactPartitioner),
            fx.ctx.clone(),
        )?;
        writer.write(1)?;
        let err = writer.close().expect_err("persistence unset");
        assert_eq!(err.to_string(), "missing property data persistence on edge e2");
        assert_eq!(fx.manager.registered_count(), 0);
        assert_eq!(fx.ctx.pool().remaining(), 1 << 20);
        Ok(())
    }

    #[test]
    fn missing_store_fails_construction() {
        let fx = fixture(1 << 20);
        let edge = RuntimeEdge::new("e3").with_pattern(CommunicationPattern::OneToOne);
        let result = BlockOutputWriter::new(
            &TaskId::from("t3"),
            edge,
            dst(),
            Box::new(IntactPartitioner),
            fx.ctx.clone(),
        );
        assert!(matches!(
            result,
            Err(SpillwayError::MissingProperty {
                property: "data store",
                ..
            })
        ));
    }

    #[test]
    fn context_from_config_sizes_the_pool() -> Result<()> {
        let dir = tempdir()?;
        let mut config = SpillwayConfig::default();
        config.memory.executor_memory_mb = 8;
        config.spill.directory = Some(dir.path().to_path_buf());
        let manager: Arc<dyn BlockManager<u64>> = Arc::new(LocalBlockManager::from_config(
            &config,
            Arc::new(JsonCodec::<u64>::new()),
        ));
        let ctx = WriterContext::from_config(&config, manager)?;
        assert_eq!(ctx.pool().capacity(), 4 * 1024 * 1024);
        assert_eq!(ctx.estimator().options().sampling_threshold, 400);
        Ok(())
    }

    #[test]
    fn closed_writer_rejects_more_output() -> Result<()> {
        let fx = fixture(1 << 20);
        let mut writer = BlockOutputWriter::new(
            &TaskId::from("t4"),
            edge("e4", StoreKind::Memory),
            dst(),
            Box::new(IntactPartitioner),
            fx.ctx.clone(),
        )?;
        writer.write(5)?;
        writer.write_watermark(Watermark(100));
        writer.close()?;
        assert_eq!(writer.state(), WriterState::CommittedMemory);
        assert_eq!(writer.written_bytes(), None);
        assert!(writer.write(6).is_err());
        assert!(writer.close().is_err());
        Ok(())
    }

    struct FailingCodec;

    impl Codec<u64> for FailingCodec {
        fn encode(&self, _value: &u64, _out: &mut Vec<u8>) -> Result<()> {
            Err(SpillwayError::Codec("boom".into()))
        }

        fn decode(&self, _bytes: &[u8]) -> Result<u64> {
            Err(SpillwayError::Codec("boom".into()))
        }
    }

    #[test]
    fn failed_admitted_commit_returns_its_charge() -> Result<()> {
        let dir = tempdir()?;
        let pool = Arc::new(StorageMemoryPool::new(1_000_000));
        let manager = Arc::new(
            LocalBlockManager::new(dir.path(), Arc::new(FailingCodec) as Arc<dyn Codec<u64>>)
                .with_pool(Arc::clone(&pool)),
        );
        let ctx = WriterContext::new(
            Arc::clone(&manager) as Arc<dyn BlockManager<u64>>,
            Arc::clone(&pool),
        );
        let mut writer = BlockOutputWriter::new(
            &TaskId::from("t5"),
            edge("e5", StoreKind::SerializedMemoryFile),
            dst(),
            Box::new(IntactPartitioner),
            ctx,
        )?;
        writer.write(7)?;
        let err = writer.close().expect_err("codec fails");
        assert!(matches!(err, SpillwayError::Codec(_)));
        assert_eq!(pool.remaining(), 1_000_000);
        assert_eq!(pool.charged(writer.block_id()), None);
        assert_eq!(manager.registered_count(), 0);
        Ok(())
    }

    struct CountingBlock {
        inner: Box<dyn Block<u64>>,
        partition_commits: Arc<AtomicUsize>,
    }

    impl Block<u64> for CountingBlock {
        fn id(&self) -> &BlockId {
            self.inner.id()
        }

        fn store(&self) -> StoreKind {
            self.inner.store()
        }

        fn state(&self) -> BlockState {
            self.inner.state()
        }

        fn write(&mut self, key: PartitionKey, element: u64) -> Result<()> {
            self.inner.write(key, element)
        }

        fn commit_partitions(&mut self) -> Result<()> {
            self.partition_commits.fetch_add(1, Ordering::SeqCst);
            self.inner.commit_partitions()
        }

        fn commit(&mut self) -> Result<Option<PartitionSizes>> {
            self.inner.commit()
        }

        fn mark_spilled(&mut self) -> Result<()> {
            self.inner.mark_spilled()
        }

        fn read_partition(&self, key: PartitionKey) -> Result<Vec<u64>> {
            self.inner.read_partition(key)
        }

        fn location(&self) -> Option<&Path> {
            self.inner.location()
        }
    }

    struct CountingManager {
        inner: Arc<LocalBlockManager<u64>>,
        partition_commits: Arc<AtomicUsize>,
    }

    impl BlockManager<u64> for CountingManager {
        fn create_block(&self, id: &BlockId, store: StoreKind) -> Result<Box<dyn Block<u64>>> {
            Ok(Box::new(CountingBlock {
                inner: self.inner.create_block(id, store)?,
                partition_commits: Arc::clone(&self.partition_commits),
            }))
        }

        fn write_block(
            &self,
            block: Box<dyn Block<u64>>,
            store: StoreKind,
            expected_reads: u32,
            persistence: Persistence,
        ) -> Result<()> {
            self.inner.write_block(block, store, expected_reads, persistence)
        }

        fn put_spilled_block(&self, id: &BlockId, from: StoreKind, to: StoreKind) -> Result<()> {
            self.inner.put_spilled_block(id, from, to)
        }
    }

    fn buffered_dedicated_keys(pool_bytes: u64) -> Result<()> {
        let fx = fixture(pool_bytes);
        let partition_commits = Arc::new(AtomicUsize::new(0));
        let manager = Arc::new(CountingManager {
            inner: Arc::clone(&fx.manager),
            partition_commits: Arc::clone(&partition_commits),
        });
        let ctx = WriterContext::new(
            manager as Arc<dyn BlockManager<u64>>,
            Arc::clone(fx.ctx.pool()),
        );
        let mut writer = BlockOutputWriter::new(
            &TaskId::from("t6"),
            edge("e6", StoreKind::MemoryFile),
            dst(),
            Box::new(DedicatedKeyPartitioner::default()),
            ctx,
        )?;
        for value in [30u64, 10, 20] {
            writer.write(value)?;
        }
        assert_eq!(partition_commits.load(Ordering::SeqCst), 0);
        writer.close()?;
        assert_eq!(writer.is_spilled(), pool_bytes == 0);
        assert_eq!(partition_commits.load(Ordering::SeqCst), 3);
        let id = writer.block_id().clone();
        for (key, value) in [(0, 30u64), (1, 10), (2, 20)] {
            assert_eq!(fx.manager.read_partition(&id, PartitionKey(key))?, vec![value]);
        }
        Ok(())
    }

    #[test]
    fn buffered_dedicated_keys_commit_each_partition_when_admitted() -> Result<()> {
        buffered_dedicated_keys(1 << 20)
    }

    #[test]
    fn buffered_dedicated_keys_commit_each_partition_when_spilled() -> Result<()> {
        buffered_dedicated_keys(0)
    }
}
