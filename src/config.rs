//! Configuration for the commit log
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{LogError, Result};
use crate::log::DIRECT_IO_ALIGN;

/// Main configuration for a log manager instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Directory holding the numbered log files and the replay point
    /// Internal structure:
    ///   {log_dir}/
    ///     ├── 00000001.log
    ///     ├── 00000002.log
    ///     └── replay_point
    pub log_dir: PathBuf,

    /// Rotate to a new file once the current one reaches this size (bytes)
    pub log_file_max_size: u64,

    /// Sync strategy: how often to fsync log files
    pub sync_strategy: LogSyncStrategy,

    /// Tolerate a known start file with no recoverable position when
    /// promoting to master
    pub allow_missing_log_file: bool,

    // -------------------------------------------------------------------------
    // Cache Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the recent log cache (bytes)
    pub log_cache_capacity: usize,

    /// Upper bound for a single fetch served to a slave (bytes)
    pub fetch_buffer_size: usize,

    // -------------------------------------------------------------------------
    // Replay Configuration
    // -------------------------------------------------------------------------
    /// Upper bound for a single chunk pulled by the replay loop (bytes)
    pub replay_buffer_size: usize,

    /// Max batches queued in the replay worker before submit blocks
    pub replay_queue_depth: usize,

    /// Back-off after NeedRetry in the replay loop (milliseconds)
    pub replay_retry_wait_ms: u64,

    /// Wait for new log after NeedWait in the replay loop (milliseconds)
    pub replay_wait_timeout_ms: u64,
}

/// Log sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSyncStrategy {
    /// fsync after every batch (safest, slowest)
    EveryWrite,

    /// fsync after N unsynced batches
    EveryNBatches { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("./clog_data"),
            log_file_max_size: 64 * 1024 * 1024, // 64 MB
            sync_strategy: LogSyncStrategy::EveryWrite,
            allow_missing_log_file: true,
            log_cache_capacity: 16 * 1024 * 1024, // 16 MB
            fetch_buffer_size: 1024 * 1024,
            replay_buffer_size: 1024 * 1024,
            replay_queue_depth: 64,
            replay_retry_wait_ms: 10,
            replay_wait_timeout_ms: 100,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the settings before any component is built
    pub fn validate(&self) -> Result<()> {
        if self.log_dir.as_os_str().is_empty() {
            return Err(LogError::InvalidArgument("log_dir is empty".to_string()));
        }
        if self.log_file_max_size < DIRECT_IO_ALIGN as u64 {
            return Err(LogError::InvalidArgument(format!(
                "log_file_max_size {} is smaller than one aligned block",
                self.log_file_max_size
            )));
        }
        if self.log_cache_capacity < DIRECT_IO_ALIGN {
            return Err(LogError::InvalidArgument(format!(
                "log_cache_capacity {} is smaller than one aligned block",
                self.log_cache_capacity
            )));
        }
        if self.fetch_buffer_size == 0 || self.replay_buffer_size == 0 {
            return Err(LogError::InvalidArgument(
                "fetch/replay buffer size must be positive".to_string(),
            ));
        }
        if self.replay_queue_depth == 0 {
            return Err(LogError::InvalidArgument(
                "replay_queue_depth must be positive".to_string(),
            ));
        }
        if let LogSyncStrategy::EveryNBatches { count: 0 } = self.sync_strategy {
            return Err(LogError::InvalidArgument(
                "sync strategy batch count must be positive".to_string(),
            ));
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
    /// Set the log directory
    pub fn log_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.log_dir = path.into();
        self
    }

    /// Set the max size of a single log file (in bytes)
    pub fn log_file_max_size(mut self, size: u64) -> Self {
        self.config.log_file_max_size = size;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: LogSyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    pub fn allow_missing_log_file(mut self, allow: bool) -> Self {
        self.config.allow_missing_log_file = allow;
        self
    }

    /// Set the recent log cache capacity (in bytes)
    pub fn log_cache_capacity(mut self, size: usize) -> Self {
        self.config.log_cache_capacity = size;
        self
    }

    pub fn fetch_buffer_size(mut self, size: usize) -> Self {
        self.config.fetch_buffer_size = size;
        self
    }

    pub fn replay_buffer_size(mut self, size: usize) -> Self {
        self.config.replay_buffer_size = size;
        self
    }

    pub fn replay_queue_depth(mut self, depth: usize) -> Self {
        self.config.replay_queue_depth = depth;
        self
    }

    /// Set the replay loop retry back-off (in milliseconds)
    pub fn replay_retry_wait_ms(mut self, ms: u64) -> Self {
        self.config.replay_retry_wait_ms = ms;
        self
    }

    /// Set the replay loop new-log wait (in milliseconds)
    pub fn replay_wait_timeout_ms(mut self, ms: u64) -> Self {
        self.config.replay_wait_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
