//! Execution properties attached to runtime edges and vertices.
//!
//! Properties are assigned by optimization passes upstream of this crate;
//! here they are plain data with getters that fail fast when a required
//! property was never set.

use crate::block::StoreKind;
use crate::types::{EdgeId, Result, SpillwayError, VertexId};

/// How data flows from source tasks to destination tasks.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommunicationPattern {
    /// Each source task feeds exactly one destination task.
    OneToOne,
    /// Every destination task reads every source block.
    BroadCast,
    /// Source output is partitioned across destination tasks.
    Shuffle,
}

/// What happens to a block after its expected reads are done.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Persistence {
    /// Keep the block after reads complete.
    Keep,
    /// Discard the block once read.
    Discard,
}

/// Group of edges known to carry identical data.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DuplicateEdgeGroup {
    /// Group identifier.
    pub group_id: String,
    /// Number of edges in the group.
    pub group_size: u32,
    /// The one edge whose output is materialized.
    pub representative: EdgeId,
}

/// Runtime edge and the properties a block writer needs from it.
#[derive(Clone, Debug)]
pub struct RuntimeEdge {
    id: EdgeId,
    store: Option<StoreKind>,
    pattern: Option<CommunicationPattern>,
    persistence: Option<Persistence>,
    duplicate_group: Option<DuplicateEdgeGroup>,
}

impl RuntimeEdge {
    /// Creates an edge with no properties set.
    pub fn new(id: impl Into<EdgeId>) -> Self {
        Self {
            id: id.into(),
            store: None,
            pattern: None,
            persistence: None,
            duplicate_group: None,
        }
    }

    /// Sets the declared store.
    pub fn with_store(mut self, store: StoreKind) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the communication pattern.
    pub fn with_pattern(mut self, pattern: CommunicationPattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Sets the persistence policy.
    pub fn with_persistence(mut self, persistence: Persistence) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Places the edge in a duplicate group.
    pub fn with_duplicate_group(mut self, group: DuplicateEdgeGroup) -> Self {
        self.duplicate_group = Some(group);
        self
    }

    /// Edge identifier.
    pub fn id(&self) -> &EdgeId {
        &self.id
    }

    /// Declared store; required.
    pub fn store(&self) -> Result<StoreKind> {
        self.store.ok_or_else(|| self.missing("data store"))
    }

    /// Communication pattern; required.
    pub fn pattern(&self) -> Result<CommunicationPattern> {
        self.pattern
            .ok_or_else(|| self.missing("communication pattern"))
    }

    /// Persistence policy; required.
    pub fn persistence(&self) -> Result<Persistence> {
        self.persistence.ok_or_else(|| self.missing("data persistence"))
    }

    /// Duplicate group, when the edge belongs to one.
    pub fn duplicate_group(&self) -> Option<&DuplicateEdgeGroup> {
        self.duplicate_group.as_ref()
    }

    /// Whether this edge's output is carried by another edge of its group.
    pub fn is_duplicate_omitted(&self) -> bool {
        self.duplicate_group
            .as_ref()
            .is_some_and(|group| group.group_size > 1 && group.representative != self.id)
    }

    /// Multiplier applied to expected reads: the group size, or 1.
    pub fn duplicate_multiplier(&self) -> u32 {
        self.duplicate_group
            .as_ref()
            .map_or(1, |group| group.group_size.max(1))
    }

    pub(crate) fn missing(&self, property: &'static str) -> SpillwayError {
        SpillwayError::MissingProperty {
            property,
            edge: self.id.clone(),
        }
    }
}

/// Destination vertex properties.
#[derive(Clone, Debug)]
pub struct VertexProperties {
    id: VertexId,
    parallelism: Option<u32>,
}

impl VertexProperties {
    /// Creates a vertex with no properties set.
    pub fn new(id: impl Into<VertexId>) -> Self {
        Self {
            id: id.into(),
            parallelism: None,
        }
    }

    /// Sets the declared parallelism.
    pub fn with_parallelism(mut self, parallelism: u32) -> Self {
        self.parallelism = Some(parallelism);
        self
    }

    /// Vertex identifier.
    pub fn id(&self) -> &VertexId {
        &self.id
    }

    /// Declared parallelism; required and at least 1.
    ///
    /// `edge` is the edge being written and is named in the error.
    pub fn parallelism(&self, edge: &RuntimeEdge) -> Result<u32> {
        match self.parallelism {
            Some(0) => Err(SpillwayError::Invalid("parallelism must be at least 1")),
            Some(parallelism) => Ok(parallelism),
            None => Err(edge.missing("destination parallelism")),
        }
    }
}
