//! Configuration for CaskDB
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{CaskError, Result};

/// Main configuration for a CaskDB instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all data files
    /// Internal structure:
    ///   {data_dir}/
    ///     ├── 000000000.data   (segment files, one active)
    ///     ├── hint-index       (written by merge)
    ///     ├── merge-finished   (written by merge)
    ///     ├── disk-index       (disk-resident index backend only)
    ///     └── flock            (single-writer lock)
    pub data_dir: PathBuf,

    /// Size (in bytes) after which the active segment is sealed and a new one opened
    pub max_active_file_size: u64,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// Sync strategy: how often to fsync the active segment
    pub sync_strategy: SyncStrategy,

    // -------------------------------------------------------------------------
    // Index Configuration
    // -------------------------------------------------------------------------
    /// Which index backend maps keys to record positions
    pub index_backend: IndexBackend,

    // -------------------------------------------------------------------------
    // Merge Configuration
    // -------------------------------------------------------------------------
    /// Fraction of reclaimable bytes over total segment bytes that triggers auto-merge
    pub merge_ratio_threshold: f32,

    /// Run merges in the background once `merge_ratio_threshold` is reached
    pub auto_merge: bool,
}

/// Segment sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync after every write (safest, slowest)
    EveryWrite,

    /// fsync once N bytes have been appended since the last sync
    EveryNBytes { bytes: u64 },

    /// Leave flushing to the OS; files are still synced on rotation and close
    Never,
}

/// Index backend selected at open time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    /// Ordered in-memory map, rebuilt from the log on every open
    BTree,

    /// Ordered map persisted in its own journal, rebuilt incrementally
    Disk,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./caskdb_data"),
            max_active_file_size: 256 * 1024 * 1024, // 256 MB
            sync_strategy: SyncStrategy::EveryNBytes { bytes: 1024 * 1024 },
            index_backend: IndexBackend::BTree,
            merge_ratio_threshold: 0.5,
            auto_merge: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the configuration before the engine touches the disk
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(CaskError::Config("data_dir is empty".to_string()));
        }
        if self.max_active_file_size == 0 {
            return Err(CaskError::Config(
                "max_active_file_size must be greater than 0".to_string(),
            ));
        }
        if let SyncStrategy::EveryNBytes { bytes: 0 } = self.sync_strategy {
            return Err(CaskError::Config(
                "EveryNBytes sync strategy needs a non-zero byte count".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.merge_ratio_threshold) {
            return Err(CaskError::Config(format!(
                "merge_ratio_threshold must be within [0, 1], got {}",
                self.merge_ratio_threshold
            )));
        }
        Ok(())
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the data directory (root for all storage)
    pub fn data_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.data_dir = path.into();
        self
    }

    /// Set the rotation threshold for the active segment (in bytes)
    pub fn max_active_file_size(mut self, size: u64) -> Self {
        self.config.max_active_file_size = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Shortcut: `true` syncs every write, `false` leaves it to the OS
    pub fn sync_on_write(mut self, sync: bool) -> Self {
        self.config.sync_strategy = if sync {
            SyncStrategy::EveryWrite
        } else {
            SyncStrategy::Never
        };
        self
    }

    /// Set the index backend
    pub fn index_backend(mut self, backend: IndexBackend) -> Self {
        self.config.index_backend = backend;
        self
    }

    /// Set the reclaimable-space ratio that triggers auto-merge
    pub fn merge_ratio_threshold(mut self, ratio: f32) -> Self {
        self.config.merge_ratio_threshold = ratio;
        self
    }

    /// Enable or disable background merges
    pub fn auto_merge(mut self, enabled: bool) -> Self {
        self.config.auto_merge = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

/// Options for a single write batch
#[derive(Debug, Clone)]
pub struct WriteBatchOptions {
    /// Maximum number of staged mutations a batch may commit
    pub max_batch_num: usize,

    /// fsync the active segment when the batch commits
    pub sync_writes: bool,
}

impl Default for WriteBatchOptions {
    fn default() -> Self {
        Self {
            max_batch_num: 10_000,
            sync_writes: true,
        }
    }
}

/// Options for an engine iterator
#[derive(Debug, Clone, Default)]
pub struct IteratorOptions {
    /// Only visit keys starting with this prefix (empty = all keys)
    pub prefix: Vec<u8>,

    /// Visit keys in descending order
    pub reverse: bool,
}
