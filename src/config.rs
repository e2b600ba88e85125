//! Configuration of the checkpointing and consistent-region runtime.
//!
//! A [`RuntimeConfig`] can be built programmatically or loaded from a TOML
//! document. Every loaded configuration goes through [`RuntimeConfig::validate`]
//! before it is used, so invalid values surface as a typed
//! [`ConfigurationError`] at startup instead of failing mid-checkpoint.

use serde::Deserialize;
use thiserror::Error;

/// Number of deltas between base checkpoints when incremental checkpointing
/// starts disabled (`1` means every checkpoint is a base).
const DEFAULT_INCREMENTAL_INTERVAL: u32 = 1;
/// Threshold ratio of accumulated delta size to base size.
const DEFAULT_SIZE_RATIO: f64 = 1.0;
/// Workers in the checkpoint/reset pool.
const DEFAULT_WORKERS: usize = 4;
/// Capacity of the work queue feeding the pool.
const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// An error in the user-provided configuration.
///
/// All variants are fatal: the runtime refuses to start with a configuration
/// it cannot honor.
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("size_ratio must be a finite value >= 0, got {0}")]
    InvalidSizeRatio(f64),
    #[error("incremental_interval must be >= 1")]
    InvalidInterval,
    #[error("region worker pool needs at least one worker")]
    NoWorkers,
    #[error("region work queue capacity must be >= 1")]
    EmptyQueue,
    #[error("window policy mismatch: {0}")]
    PolicyMismatch(String),
}

/// Top level configuration of the runtime.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub region: RegionConfig,
}

/// Tuning of the incremental checkpointing machinery.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CheckpointConfig {
    /// Starting number of checkpoints between two bases. `1` disables
    /// incremental checkpointing until the controller re-probes.
    #[serde(default = "default_interval")]
    pub incremental_interval: u32,
    /// Deltas accumulated in an interval may grow up to
    /// `size_ratio * base_size` before the controller shrinks the interval.
    /// `0.0` disables incremental checkpointing entirely.
    #[serde(default = "default_size_ratio")]
    pub size_ratio: f64,
}

/// Sizing of the consistent-region checkpoint/reset worker pool.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_interval() -> u32 {
    DEFAULT_INCREMENTAL_INTERVAL
}

fn default_size_ratio() -> f64 {
    DEFAULT_SIZE_RATIO
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_queue_capacity() -> usize {
    DEFAULT_QUEUE_CAPACITY
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            incremental_interval: DEFAULT_INCREMENTAL_INTERVAL,
            size_ratio: DEFAULT_SIZE_RATIO,
        }
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            checkpoint: CheckpointConfig::default(),
            region: RegionConfig::default(),
        }
    }
}

impl RuntimeConfig {
    /// Parse a configuration from a TOML document and validate it.
    pub fn from_toml(content: &str) -> Result<Self, ConfigurationError> {
        let config: RuntimeConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check that all values are in their legal ranges.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.checkpoint.size_ratio.is_finite() || self.checkpoint.size_ratio < 0.0 {
            return Err(ConfigurationError::InvalidSizeRatio(
                self.checkpoint.size_ratio,
            ));
        }
        if self.checkpoint.incremental_interval == 0 {
            return Err(ConfigurationError::InvalidInterval);
        }
        if self.region.workers == 0 {
            return Err(ConfigurationError::NoWorkers);
        }
        if self.region.queue_capacity == 0 {
            return Err(ConfigurationError::EmptyQueue);
        }
        Ok(())
    }
}
