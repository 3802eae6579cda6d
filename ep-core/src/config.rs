//! Bucket-wide configuration, loaded from YAML via `serde_yaml` with a
//! `clap` front door in `ep-server` for field overrides -- the same split
//! the reference workspace uses for its node binaries.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Whether closed-checkpoint removal happens synchronously on cursor
/// advance or is left to a periodic background sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReclamationMode {
    Eager,
    Lazy,
}

impl Default for ReclamationMode {
    fn default() -> Self {
        ReclamationMode::Lazy
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BucketConfig {
    /// Open-Checkpoint item count above which the next append forces a new
    /// Checkpoint.
    pub checkpoint_item_count_threshold: usize,
    /// Per-vBucket checkpoint memory usage above which the Remover starts
    /// reclaiming.
    pub checkpoint_memory_high_watermark_bytes: usize,
    /// Checkpoint memory usage below which the Remover stops.
    pub checkpoint_memory_low_watermark_bytes: usize,
    /// Maximum items the Flusher drains from the persistence cursor per
    /// batch.
    pub flusher_batch_size: usize,
    pub reclamation_mode: ReclamationMode,
    /// Default durability timeout substituted for the wire's "server
    /// default" (`0`) sentinel.
    pub durability_default_timeout: Duration,
    /// Where the production `RocksKvStore` persists its column families.
    pub data_dir: PathBuf,
    /// Wakeup interval for the CheckpointRemover/Destroyer and
    /// DurabilityTimeoutTask background tasks.
    pub background_task_interval: Duration,
    /// Wakeup interval for the ExpiryPager.
    pub expiry_pager_interval: Duration,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            checkpoint_item_count_threshold: 500,
            checkpoint_memory_high_watermark_bytes: 64 * 1024 * 1024,
            checkpoint_memory_low_watermark_bytes: 48 * 1024 * 1024,
            flusher_batch_size: 1000,
            reclamation_mode: ReclamationMode::Lazy,
            durability_default_timeout: Duration::from_secs(30),
            data_dir: PathBuf::from("./data"),
            background_task_interval: Duration::from_millis(250),
            expiry_pager_interval: Duration::from_secs(60),
        }
    }
}

impl BucketConfig {
    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_str(contents)
    }

    pub fn from_yaml_file(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(Self::from_yaml(&contents)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_falls_back_to_defaults_for_missing_fields() {
        let config = BucketConfig::from_yaml("flusher_batch_size: 42\n").unwrap();
        assert_eq!(config.flusher_batch_size, 42);
        assert_eq!(config.checkpoint_item_count_threshold, BucketConfig::default().checkpoint_item_count_threshold);
    }
}
