//! TOML configuration for the buffering layer.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::estimate::{EstimatorOptions, TrackerOptions};

/// Environment variable naming a config file for [`SpillwayConfig::load_default`].
pub const CONFIG_ENV: &str = "SPILLWAY_CONFIG";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SpillwayConfig {
    /// Executor memory and the storage share of it.
    pub memory: MemoryConfig,
    /// Size estimator tuning.
    pub estimator: EstimatorConfig,
    /// Size tracker tuning.
    pub tracker: TrackerConfig,
    /// Where disk-tier blocks are written.
    pub spill: SpillConfig,
}

/// Executor memory and the fraction of it reserved for storage.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Executor memory in MiB.
    pub executor_memory_mb: u64,
    /// Fraction of executor memory given to the storage pool, in (0, 1].
    pub storage_pool_ratio: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            executor_memory_mb: 1024,
            storage_pool_ratio: 0.5,
        }
    }
}

impl MemoryConfig {
    /// Storage pool size in bytes.
    pub fn storage_pool_bytes(&self) -> u64 {
        let mb = (self.executor_memory_mb as f64 * self.storage_pool_ratio).floor() as u64;
        mb.saturating_mul(1024 * 1024)
    }
}

/// Size estimator settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EstimatorConfig {
    /// Sequences longer than this are sampled.
    pub sampling_threshold: usize,
    /// Elements drawn from a sampled sequence.
    pub sample_count: usize,
    /// Sampling seed.
    pub seed: u64,
    /// Size alignment in bytes.
    pub alignment: u64,
    /// Reference slot width in bytes.
    pub pointer_size: u64,
    /// Object header width in bytes.
    pub object_header: u64,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        let defaults = EstimatorOptions::default();
        Self {
            sampling_threshold: defaults.sampling_threshold,
            sample_count: defaults.sample_count,
            seed: defaults.seed,
            alignment: defaults.alignment,
            pointer_size: defaults.pointer_size,
            object_header: defaults.object_header,
        }
    }
}

/// Size tracker settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Growth factor of the sampling interval.
    pub sample_growth_rate: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            sample_growth_rate: TrackerOptions::default().sample_growth_rate,
        }
    }
}

/// Disk-tier settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct SpillConfig {
    /// Directory for file-tier blocks; the OS temp dir when unset.
    pub directory: Option<PathBuf>,
}

impl SpillConfig {
    /// Resolved spill directory.
    pub fn directory(&self) -> PathBuf {
        self.directory
            .clone()
            .unwrap_or_else(|| env::temp_dir().join("spillway"))
    }
}

impl SpillwayConfig {
    /// Reads and validates the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the file named by `SPILLWAY_CONFIG`, or defaults when unset.
    pub fn load_default() -> Result<Self, ConfigError> {
        match env::var_os(CONFIG_ENV) {
            Some(path) => Self::load(Path::new(&path)),
            None => Ok(Self::default()),
        }
    }

    /// Checks ranges that serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory.executor_memory_mb == 0 {
            return Err(ConfigError::Invalid(
                "memory.executor_memory_mb must be positive".into(),
            ));
        }
        let ratio = self.memory.storage_pool_ratio;
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(ConfigError::Invalid(format!(
                "memory.storage_pool_ratio {ratio} is outside (0, 1]"
            )));
        }
        self.estimator_options()
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("estimator: {err}")))?;
        self.tracker_options()
            .validate()
            .map_err(|err| ConfigError::Invalid(format!("tracker: {err}")))?;
        Ok(())
    }

    /// Estimator options described by this config.
    pub fn estimator_options(&self) -> EstimatorOptions {
        EstimatorOptions {
            sampling_threshold: self.estimator.sampling_threshold,
            sample_count: self.estimator.sample_count,
            seed: self.estimator.seed,
            alignment: self.estimator.alignment,
            pointer_size: self.estimator.pointer_size,
            object_header: self.estimator.object_header,
        }
    }

    /// Tracker options described by this config.
    pub fn tracker_options(&self) -> TrackerOptions {
        TrackerOptions {
            sample_growth_rate: self.tracker.sample_growth_rate,
        }
    }
}

/// Failures while loading configuration.
#[allow(missing_docs)]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_are_valid() {
        let config = SpillwayConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.memory.storage_pool_bytes(), 512 * 1024 * 1024);
        assert_eq!(config.estimator_options().sampling_threshold, 400);
    }

    #[test]
    fn partial_documents_fill_in_defaults() -> Result<(), ConfigError> {
        let config = SpillwayConfig::from_toml_str(
            r#"
            [memory]
            executor_memory_mb = 64

            [estimator]
            seed = 7
            "#,
        )?;
        assert_eq!(config.memory.executor_memory_mb, 64);
        assert_eq!(config.memory.storage_pool_ratio, 0.5);
        assert_eq!(config.estimator.seed, 7);
        assert_eq!(config.estimator.sample_count, 100);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad_ratio = SpillwayConfig::from_toml_str("[memory]\nstorage_pool_ratio = 1.5\n");
        assert!(matches!(bad_ratio, Err(ConfigError::Invalid(_))));
        let bad_growth = SpillwayConfig::from_toml_str("[tracker]\nsample_growth_rate = 0.9\n");
        assert!(matches!(bad_growth, Err(ConfigError::Invalid(_))));
        let bad_samples =
            SpillwayConfig::from_toml_str("[estimator]\nsample_count = 500\n");
        assert!(matches!(bad_samples, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn loads_from_file() -> Result<(), ConfigError> {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("spillway.toml");
        fs::write(&path, "[spill]\ndirectory = \"/var/spill\"\n").expect("write config");
        let config = SpillwayConfig::load(&path)?;
        assert_eq!(config.spill.directory(), PathBuf::from("/var/spill"));
        let missing = SpillwayConfig::load(&dir.path().join("absent.toml"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));
        Ok(())
    }
}
