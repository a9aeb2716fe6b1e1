use std::any::TypeId;
use std::sync::Arc;

use rand::seq::index;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rustc_hash::FxHashSet;
use tracing::trace;

use super::layout::{ClassLayout, LayoutCache};
use super::{Estimate, Kind, Shape};
use crate::types::{Result, SpillwayError};

/// Width of the length field carried by every sequence header.
const LENGTH_FIELD_SIZE: u64 = 4;

/// Identities already charged during one estimate: address plus concrete type.
///
/// The type half keeps a struct and its first member, which share an
/// address, from being mistaken for one another.
pub type VisitedSet = FxHashSet<(usize, TypeId)>;

/// Tuning knobs for [`SizeEstimator`].
#[derive(Clone, Debug)]
pub struct EstimatorOptions {
    /// Sequences longer than this are sampled instead of walked.
    pub sampling_threshold: usize,
    /// Number of distinct elements drawn from a sampled sequence.
    pub sample_count: usize,
    /// Seed of the sampling random source.
    pub seed: u64,
    /// Every charged size is rounded up to a multiple of this.
    pub alignment: u64,
    /// Size of one reference slot.
    pub pointer_size: u64,
    /// Header of every object and sequence.
    pub object_header: u64,
}

impl Default for EstimatorOptions {
    fn default() -> Self {
        Self {
            sampling_threshold: 400,
            sample_count: 100,
            seed: 42,
            alignment: 8,
            pointer_size: 8,
            object_header: 16,
        }
    }
}

impl EstimatorOptions {
    /// Checks the invariants the sampler relies on.
    pub fn validate(&self) -> Result<()> {
        if self.sample_count == 0 {
            return Err(SpillwayError::Invalid("sample count must be positive"));
        }
        if self.sample_count >= self.sampling_threshold {
            return Err(SpillwayError::Invalid(
                "sample count must be below the sampling threshold",
            ));
        }
        if !self.alignment.is_power_of_two() {
            return Err(SpillwayError::Invalid("alignment must be a power of two"));
        }
        Ok(())
    }
}

/// Approximates the in-memory footprint of a value and everything it reaches.
///
/// One estimator is meant to be shared by every writer in a process; the
/// layout cache is the only state it keeps between calls.
#[derive(Debug)]
pub struct SizeEstimator {
    options: EstimatorOptions,
    layouts: LayoutCache,
}

struct TraversalState<'a, 'v> {
    visited: &'v mut VisitedSet,
    pending: Vec<&'a dyn Estimate>,
    size: u64,
}

impl<'a> TraversalState<'a, '_> {
    fn enqueue(&mut self, value: &'a dyn Estimate) {
        if self.visited.insert(identity(value)) {
            self.pending.push(value);
        }
    }

    // Zero-sized elements of one sequence share an address, so each index
    // is charged on its own instead of by identity.
    fn enqueue_element(&mut self, element: &'a dyn Estimate) {
        if std::mem::size_of_val(element) == 0 {
            self.pending.push(element);
        } else {
            self.enqueue(element);
        }
    }
}

fn identity(value: &dyn Estimate) -> (usize, TypeId) {
    (
        std::ptr::from_ref(value).cast::<()>() as usize,
        value.type_key(),
    )
}

impl Default for SizeEstimator {
    fn default() -> Self {
        Self::with_valid_options(EstimatorOptions::default())
    }
}

impl SizeEstimator {
    /// Creates an estimator after validating `options`.
    pub fn new(options: EstimatorOptions) -> Result<Self> {
        options.validate()?;
        Ok(Self::with_valid_options(options))
    }

    /// Creates a shareable estimator after validating `options`.
    pub fn shared(options: EstimatorOptions) -> Result<Arc<Self>> {
        Self::new(options).map(Arc::new)
    }

    fn with_valid_options(options: EstimatorOptions) -> Self {
        let layouts = LayoutCache::new(options.object_header, options.pointer_size);
        Self { options, layouts }
    }

    /// Options this estimator runs with.
    pub fn options(&self) -> &EstimatorOptions {
        &self.options
    }

    /// Estimates `value` and everything reachable from it, each value once.
    pub fn estimate(&self, value: &dyn Estimate) -> Result<u64> {
        let mut visited = VisitedSet::default();
        self.estimate_with(value, &mut visited)
    }

    /// Estimates `value`, skipping anything already in `visited`.
    ///
    /// Newly charged identities are added to `visited`, so consecutive calls
    /// never charge shared structure twice.
    pub fn estimate_with(&self, value: &dyn Estimate, visited: &mut VisitedSet) -> Result<u64> {
        let mut state = TraversalState {
            visited,
            pending: Vec::new(),
            size: 0,
        };
        state.enqueue(value);
        self.drain(&mut state)
    }

    fn estimate_element(&self, element: &dyn Estimate, visited: &mut VisitedSet) -> Result<u64> {
        let mut state = TraversalState {
            visited,
            pending: Vec::new(),
            size: 0,
        };
        state.enqueue_element(element);
        self.drain(&mut state)
    }

    fn drain<'a>(&self, state: &mut TraversalState<'a, '_>) -> Result<u64> {
        while let Some(next) = state.pending.pop() {
            self.visit(next, state)?;
        }
        Ok(state.size)
    }

    /// Layout of `shape`, from the cache when available.
    pub fn layout(&self, shape: &'static Shape) -> Arc<ClassLayout> {
        self.layouts.layout(shape)
    }

    /// Rounds `size` up to the configured alignment.
    pub fn align(&self, size: u64) -> u64 {
        let mask = self.options.alignment - 1;
        (size + mask) & !mask
    }

    /// Header plus reference slots of a sequence of `len` non-scalar elements.
    pub fn sequence_overhead(&self, len: usize) -> u64 {
        self.align(self.options.object_header + LENGTH_FIELD_SIZE)
            + self.align(len as u64 * self.options.pointer_size)
    }

    fn visit<'a>(&self, value: &'a dyn Estimate, state: &mut TraversalState<'a, '_>) -> Result<()> {
        match value.kind() {
            Kind::Metadata => {}
            Kind::Primitive(kind) => state.size += self.align(kind.width()),
            Kind::Pointer => {
                if let Some(target) = value.element(0) {
                    state.enqueue(target);
                }
            }
            Kind::Object(shape) => {
                let layout = self.layouts.layout(shape);
                state.size += self.align(layout.base_size);
                for field in &layout.reference_fields {
                    if let Some(target) = value.reference(field)? {
                        state.enqueue(target);
                    }
                }
            }
            Kind::Sequence => self.visit_sequence(value, state)?,
        }
        Ok(())
    }

    fn visit_sequence<'a>(
        &self,
        sequence: &'a dyn Estimate,
        state: &mut TraversalState<'a, '_>,
    ) -> Result<()> {
        let len = sequence.element_count();
        let header = self.align(self.options.object_header + LENGTH_FIELD_SIZE);
        let first = match sequence.element(0) {
            Some(first) => first,
            None => {
                state.size += header;
                return Ok(());
            }
        };
        if let Kind::Primitive(kind) = first.kind() {
            state.size += header + self.align(len as u64 * kind.width());
            return Ok(());
        }
        state.size += self.sequence_overhead(len);
        if len <= self.options.sampling_threshold {
            for index in 0..len {
                if let Some(element) = sequence.element(index) {
                    state.enqueue_element(element);
                }
            }
            return Ok(());
        }

        let mut rng = ChaCha8Rng::seed_from_u64(self.options.seed);
        let mut sampled = 0u64;
        for index in sample_indices(&mut rng, len, self.options.sample_count) {
            if let Some(element) = sequence.element(index) {
                sampled += self.estimate_element(element, &mut *state.visited)?;
            }
        }
        let extrapolated = len as f64 / self.options.sample_count as f64 * sampled as f64;
        trace!(len, sampled, extrapolated, "sampled large sequence");
        state.size += extrapolated as u64;
        Ok(())
    }
}

/// Draws `count` distinct indices below `len` from `rng`.
///
/// Returns every index when `count >= len`.
pub fn sample_indices<R: Rng + ?Sized>(rng: &mut R, len: usize, count: usize) -> Vec<usize> {
    if count >= len {
        return (0..len).collect();
    }
    index::sample(rng, len, count).into_vec()
}
