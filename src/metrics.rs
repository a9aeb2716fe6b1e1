//! Counters for admission, spill and commit decisions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::block::StoreKind;

/// Trait for observing block writer decisions.
///
/// Implementations must be cheap; writers call them inline on the
/// close path and, for tracker samples, on the write path.
pub trait ShuffleMetrics: Send + Sync {
    /// Records a buffered block admitted to the memory tier.
    fn admission_granted(&self, bytes: u64);

    /// Records a buffered block refused by the storage pool and spilled.
    fn admission_denied(&self, bytes: u64);

    /// Records a block committed to `store`.
    ///
    /// # Parameters
    /// * `bytes` - Total partition size, when the store tracks sizes.
    fn block_committed(&self, store: StoreKind, bytes: Option<u64>);

    /// Records a writer that skipped its output because another edge of its
    /// duplicate group carries it.
    fn duplicate_omitted(&self);

    /// Records a full re-estimate taken by a size tracker.
    fn tracker_sampled(&self);
}

/// A no-op implementation of [`ShuffleMetrics`].
#[derive(Default)]
pub struct NoopMetrics;

impl ShuffleMetrics for NoopMetrics {
    fn admission_granted(&self, _bytes: u64) {}
    fn admission_denied(&self, _bytes: u64) {}
    fn block_committed(&self, _store: StoreKind, _bytes: Option<u64>) {}
    fn duplicate_omitted(&self) {}
    fn tracker_sampled(&self) {}
}

/// A thread-safe counter-based implementation of [`ShuffleMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Blocks admitted to the memory tier.
    pub admissions_granted: AtomicU64,

    /// Blocks refused and spilled.
    pub admissions_denied: AtomicU64,

    /// Estimated bytes admitted to the memory tier.
    pub bytes_admitted: AtomicU64,

    /// Estimated bytes spilled to disk.
    pub bytes_spilled: AtomicU64,

    /// Blocks committed to a memory-tier store.
    pub memory_commits: AtomicU64,

    /// Blocks committed to a local file.
    pub file_commits: AtomicU64,

    /// Sum of reported committed sizes.
    pub committed_bytes: AtomicU64,

    /// Writers suppressed by duplicate-edge groups.
    pub duplicates_omitted: AtomicU64,

    /// Tracker re-estimates.
    pub tracker_samples: AtomicU64,
}

/// Point-in-time copy of [`CounterMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub admissions_granted: u64,
    pub admissions_denied: u64,
    pub bytes_admitted: u64,
    pub bytes_spilled: u64,
    pub memory_commits: u64,
    pub file_commits: u64,
    pub committed_bytes: u64,
    pub duplicates_omitted: u64,
    pub tracker_samples: u64,
}

impl CounterMetrics {
    /// Reads every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            admissions_granted: self.admissions_granted.load(Ordering::Relaxed),
            admissions_denied: self.admissions_denied.load(Ordering::Relaxed),
            bytes_admitted: self.bytes_admitted.load(Ordering::Relaxed),
            bytes_spilled: self.bytes_spilled.load(Ordering::Relaxed),
            memory_commits: self.memory_commits.load(Ordering::Relaxed),
            file_commits: self.file_commits.load(Ordering::Relaxed),
            committed_bytes: self.committed_bytes.load(Ordering::Relaxed),
            duplicates_omitted: self.duplicates_omitted.load(Ordering::Relaxed),
            tracker_samples: self.tracker_samples.load(Ordering::Relaxed),
        }
    }
}

impl ShuffleMetrics for CounterMetrics {
    fn admission_granted(&self, bytes: u64) {
        self.admissions_granted.fetch_add(1, Ordering::Relaxed);
        self.bytes_admitted.fetch_add(bytes, Ordering::Relaxed);
    }

    fn admission_denied(&self, bytes: u64) {
        self.admissions_denied.fetch_add(1, Ordering::Relaxed);
        self.bytes_spilled.fetch_add(bytes, Ordering::Relaxed);
    }

    fn block_committed(&self, store: StoreKind, bytes: Option<u64>) {
        if store.is_memory_tier() {
            self.memory_commits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.file_commits.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(bytes) = bytes {
            self.committed_bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    fn duplicate_omitted(&self) {
        self.duplicates_omitted.fetch_add(1, Ordering::Relaxed);
    }

    fn tracker_sampled(&self) {
        self.tracker_samples.fetch_add(1, Ordering::Relaxed);
    }
}

/// Returns the default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn ShuffleMetrics> {
    Arc::new(NoopMetrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_split_commits_by_tier() {
        let metrics = CounterMetrics::default();
        metrics.block_committed(StoreKind::MemoryFile, None);
        metrics.block_committed(StoreKind::LocalFile, Some(120));
        metrics.admission_denied(900);
        metrics.tracker_sampled();
        let snap = metrics.snapshot();
        assert_eq!(snap.memory_commits, 1);
        assert_eq!(snap.file_commits, 1);
        assert_eq!(snap.committed_bytes, 120);
        assert_eq!(snap.admissions_denied, 1);
        assert_eq!(snap.bytes_spilled, 900);
        assert_eq!(snap.tracker_samples, 1);
        assert_eq!(snap.admissions_granted, 0);
    }
}
