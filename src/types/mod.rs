#![forbid(unsafe_code)]

//! Identifiers and the crate-wide error type.

use std::fmt;

pub mod checksum;

pub use checksum::{frame_crc32, FrameCrc};

/// Identifier of a runtime edge between two vertices.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EdgeId(pub String);
/// Identifier of a vertex in the dataflow graph.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct VertexId(pub String);
/// Identifier of a task producing output on an edge.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TaskId(pub String);
/// Key of one partition inside a block.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct PartitionKey(pub u32);

/// Identifier of a block, derived from the producing edge and task.
#[derive(Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct BlockId(String);

impl BlockId {
    /// Builds the block id for the output of `task` on `edge`.
    pub fn new(edge: &EdgeId, task: &TaskId) -> Self {
        BlockId(format!("{}-{}", edge.0, task.0))
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Lifecycle state of a physical block.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum BlockState {
    /// Accepting writes.
    Open,
    /// Partition sizes finalized; immutable.
    Committed,
    /// Replaced by a disk-resident twin.
    Spilled,
}

/// Errors surfaced by the buffering layer.
#[allow(missing_docs)]
#[derive(thiserror::Error, Debug)]
pub enum SpillwayError {
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing property {property} on edge {edge}")]
    MissingProperty {
        property: &'static str,
        edge: EdgeId,
    },
    #[error("cannot read field {field} of {shape}")]
    FieldAccess {
        shape: &'static str,
        field: &'static str,
    },
    #[error("codec: {0}")]
    Codec(String),
    #[error("corruption: {0}")]
    Corruption(&'static str),
    #[error("cannot {op} block {block} in state {state:?}")]
    BlockState {
        block: BlockId,
        state: BlockState,
        op: &'static str,
    },
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SpillwayError>;

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EdgeId {
    fn from(value: &str) -> Self {
        EdgeId(value.to_owned())
    }
}

impl From<&str> for VertexId {
    fn from(value: &str) -> Self {
        VertexId(value.to_owned())
    }
}

impl From<String> for EdgeId {
    fn from(value: String) -> Self {
        EdgeId(value)
    }
}

impl From<String> for VertexId {
    fn from(value: String) -> Self {
        VertexId(value)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        TaskId(value.to_owned())
    }
}

impl From<u32> for PartitionKey {
    fn from(value: u32) -> Self {
        PartitionKey(value)
    }
}

impl From<PartitionKey> for u32 {
    fn from(value: PartitionKey) -> Self {
        value.0
    }
}
