//! Memory-aware buffering of shuffle output.
//!
//! A [`BlockOutputWriter`] collects one task's output on one edge. For
//! edges declared on a memory store with file fallback, elements are held in
//! a [`SizeTracker`] whose running size estimate is offered to the shared
//! [`StorageMemoryPool`] when the writer closes; an admitted buffer becomes a
//! memory-tier block, a refused one is spilled to a local file block.

#![warn(missing_docs)]

pub mod block;
pub mod config;
pub mod edge;
pub mod estimate;
pub mod memory;
pub mod metrics;
pub mod partition;
pub mod types;
pub mod writer;

pub use block::{
    Block, BlockManager, Codec, FileBlock, JsonCodec, LocalBlockManager, MemoryBlock,
    PartitionSizes, SerializedMemoryBlock, StoreKind,
};
pub use config::{ConfigError, SpillwayConfig};
pub use edge::{
    CommunicationPattern, DuplicateEdgeGroup, Persistence, RuntimeEdge, VertexProperties,
};
pub use estimate::{Estimate, EstimatorOptions, SizeEstimator, SizeTracker, TrackerOptions};
pub use memory::StorageMemoryPool;
pub use metrics::{CounterMetrics, NoopMetrics, ShuffleMetrics};
pub use partition::{DedicatedKeyPartitioner, HashPartitioner, IntactPartitioner, Partitioner};
pub use types::{BlockId, EdgeId, PartitionKey, Result, SpillwayError, TaskId, VertexId};
pub use writer::{BlockOutputWriter, Watermark, WriterContext, WriterState};
