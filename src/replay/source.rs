//! Replay log source
//!
//! Where a slave gets the next batch to replay.

use std::sync::Arc;

use tracing::trace;

use crate::cache::RecentLogCache;
use crate::error::{LogError, Result};
use crate::log::{LogChunk, LogCursor};
use crate::replication::MasterClient;

/// Recent log cache first, the master second
pub struct ReplayLogSource {
    cache: Arc<RecentLogCache>,
    master: Arc<dyn MasterClient>,
}

impl ReplayLogSource {
    pub fn new(cache: Arc<RecentLogCache>, master: Arc<dyn MasterClient>) -> Self {
        Self { cache, master }
    }

    /// Ask the master where replay should begin
    pub fn fill_start_cursor(&self, cursor: &mut LogCursor) -> Result<()> {
        self.master.fill_start_cursor(cursor)
    }

    /// Whole batches starting at `cursor.log_id`
    ///
    /// `DataNotServed` when neither the cache nor the master has them yet.
    pub fn get_log(&self, cursor: &LogCursor, max_len: usize) -> Result<LogChunk> {
        match self.cache.get_log(cursor.log_id, max_len) {
            Ok(chunk) => {
                trace!(start_id = chunk.start_id, end_id = chunk.end_id, "replay source hit cache");
                Ok(chunk)
            }
            Err(LogError::DataNotServed(_)) => {
                let chunk = self.master.pull_from_master(cursor, max_len)?;
                if chunk.is_empty() {
                    return Err(LogError::DataNotServed(format!(
                        "master has nothing after log_id {}",
                        cursor.log_id
                    )));
                }
                trace!(start_id = chunk.start_id, end_id = chunk.end_id, "replay source pulled from master");
                Ok(chunk)
            }
            Err(e) => Err(e),
        }
    }

    /// Whether the master pushes continuously instead of being polled
    pub fn is_using_lsync(&self) -> bool {
        self.master.is_using_lsync()
    }
}
