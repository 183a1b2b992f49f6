//! Log Recovery
//!
//! Replays the local log files into the replay worker after a restart and
//! recovers the position writing should continue from.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{LogError, Result};
use crate::replay::{ReplayMode, ReplayWorker};

use super::{log_file_path, LogCursor, LogDirScanner, PositionedLogReader};

const APPLY_POLL: Duration = Duration::from_millis(100);

/// Submit every whole batch from `start` onward, then wait until applied
///
/// The worker is positioned at `start` first.
/// Follows SWITCH_LOG entries into later files. Returns the cursor after
/// the last replayed entry, which is `start` itself when the start file
/// does not exist. A file that ends without a switch while a later file
/// exists means the log has a hole.
pub fn replay_local_files(
    reader: &PositionedLogReader,
    worker: &ReplayWorker,
    start: LogCursor,
    max_len: usize,
    stop: &AtomicBool,
) -> Result<LogCursor> {
    info!(%start, "replaying local log files");
    worker.start_log(start)?;

    // Step 1: Feed the worker, batch by batch
    let mut cursor = start;
    let mut submitted = 0usize;
    loop {
        if stop.load(Ordering::Acquire) {
            return Err(LogError::Canceled);
        }

        let chunk = match reader.read_at(&cursor, max_len) {
            Ok(chunk) => chunk,
            Err(LogError::EntryNotFound) => break,
            Err(e) => return Err(e),
        };

        if chunk.data.is_empty() {
            let next = cursor.file_id + 1;
            if log_file_path(reader.dir(), next).exists() {
                return Err(LogError::CorruptEntry(format!(
                    "log file {} ends at offset {} without switch_log but file {} exists",
                    cursor.file_id, cursor.offset, next
                )));
            }
            break;
        }

        worker.submit_batch(chunk.data, ReplayMode::Replay)?;
        cursor = chunk.end;
        submitted += 1;
    }

    // Step 2: Wait for the worker to apply everything
    while worker.get_replayed_log_id() < cursor.log_id {
        if let Some((log_id, reason)) = worker.fault() {
            return Err(LogError::Apply { log_id, reason });
        }
        if stop.load(Ordering::Acquire) {
            return Err(LogError::Canceled);
        }
        worker.wait_replayed_log_id(cursor.log_id, APPLY_POLL);
    }
    if let Some((log_id, reason)) = worker.fault() {
        return Err(LogError::Apply { log_id, reason });
    }

    info!(end = %cursor, batches = submitted, "local log replay complete");
    Ok(cursor)
}

/// Cursor after the last whole batch on disk
///
/// Walks the newest file from its start; if it holds no entry yet, the
/// file before it decides. `None` when no file has an entry.
pub fn get_local_max_log_cursor(reader: &PositionedLogReader) -> Result<Option<LogCursor>> {
    let scanner = LogDirScanner::scan(reader.dir())?;
    let Some(min) = scanner.min_file_id() else {
        return Ok(None);
    };

    for file_id in scanner.file_ids().iter().rev().copied() {
        if file_id < min {
            break;
        }
        let end = walk_file(reader, file_id)?;
        if end.is_established() {
            debug!(%end, "recovered local max log cursor");
            return Ok(Some(end));
        }
    }
    Ok(None)
}

fn walk_file(reader: &PositionedLogReader, file_id: u64) -> Result<LogCursor> {
    let mut cursor = LogCursor::at_file(file_id);
    loop {
        let chunk = match reader.read_at(&cursor, 1024 * 1024) {
            Ok(chunk) => chunk,
            Err(LogError::EntryNotFound) => return Ok(cursor),
            Err(e) => return Err(e),
        };
        if chunk.data.is_empty() {
            return Ok(cursor);
        }
        cursor = chunk.end;
        if cursor.file_id != file_id {
            return Ok(cursor);
        }
    }
}
