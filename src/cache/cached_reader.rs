//! Cache-over-disk reader

use std::sync::Arc;

use tracing::debug;

use crate::error::{LogError, Result};
use crate::log::{LogChunk, PositionedLogReader};

use super::RecentLogCache;

/// Reads from the recent log cache, then from the log files
pub struct CachedLogReader {
    cache: Arc<RecentLogCache>,
    disk: Arc<PositionedLogReader>,
}

impl CachedLogReader {
    pub fn new(cache: Arc<RecentLogCache>, disk: Arc<PositionedLogReader>) -> Self {
        Self { cache, disk }
    }

    /// Whole batches from `start_id`, about `max_len` bytes
    pub fn get_log(&self, start_id: u64, max_len: usize) -> Result<LogChunk> {
        match self.cache.get_log(start_id, max_len) {
            Err(LogError::DataNotServed(reason)) => {
                debug!(start_id, %reason, "cache miss, reading from disk");
                self.disk.read_log(start_id, max_len)
            }
            other => other,
        }
    }
}
