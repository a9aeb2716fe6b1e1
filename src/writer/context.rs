use std::sync::Arc;

use crate::block::BlockManager;
use crate::config::SpillwayConfig;
use crate::estimate::{SizeEstimator, TrackerOptions};
use crate::memory::StorageMemoryPool;
use crate::metrics::{default_metrics, ShuffleMetrics};
use crate::types::Result;

/// Collaborators shared by every writer of an executor.
pub struct WriterContext<T> {
    pub(crate) manager: Arc<dyn BlockManager<T>>,
    pub(crate) pool: Arc<StorageMemoryPool>,
    pub(crate) estimator: Arc<SizeEstimator>,
    pub(crate) tracker: TrackerOptions,
    pub(crate) metrics: Arc<dyn ShuffleMetrics>,
}

impl<T> Clone for WriterContext<T> {
    fn clone(&self) -> Self {
        Self {
            manager: Arc::clone(&self.manager),
            pool: Arc::clone(&self.pool),
            estimator: Arc::clone(&self.estimator),
            tracker: self.tracker.clone(),
            metrics: Arc::clone(&self.metrics),
        }
    }
}

impl<T> WriterContext<T> {
    /// Context with the default estimator, tracker options and no-op metrics.
    pub fn new(manager: Arc<dyn BlockManager<T>>, pool: Arc<StorageMemoryPool>) -> Self {
        Self {
            manager,
            pool,
            estimator: Arc::new(SizeEstimator::default()),
            tracker: TrackerOptions::default(),
            metrics: default_metrics(),
        }
    }

    /// Builds the pool, estimator and tracker options from `config`.
    pub fn from_config(config: &SpillwayConfig, manager: Arc<dyn BlockManager<T>>) -> Result<Self> {
        let tracker = config.tracker_options();
        tracker.validate()?;
        Ok(Self {
            manager,
            pool: Arc::new(StorageMemoryPool::from_config(&config.memory)),
            estimator: SizeEstimator::shared(config.estimator_options())?,
            tracker,
            metrics: default_metrics(),
        })
    }

    /// Replaces the estimator.
    pub fn with_estimator(mut self, estimator: Arc<SizeEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    /// Replaces the tracker options.
    pub fn with_tracker_options(mut self, options: TrackerOptions) -> Self {
        self.tracker = options;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn ShuffleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Shared storage pool.
    pub fn pool(&self) -> &Arc<StorageMemoryPool> {
        &self.pool
    }

    /// Shared estimator.
    pub fn estimator(&self) -> &Arc<SizeEstimator> {
        &self.estimator
    }
}
