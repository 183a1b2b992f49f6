//! Log Writer
//!
//! Appends aligned batches to the current log file and rotates to the next
//! file after every SWITCH_LOG entry.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::LogSyncStrategy;
use crate::error::{LogError, Result};
use crate::replication::ReplicaRegistry;

use super::{
    log_file_path, EntryIter, LogBatch, LogChunk, LogCommand, LogCursor, DIRECT_IO_ALIGN,
    MAX_PAYLOAD_SIZE,
};

/// Callback invoked after every successful write
///
/// `is_master` is true for batches the writer framed itself (master
/// writes and rollovers), false for pre-framed buffers handed to `append`.
pub trait WriteHook: Send + Sync {
    fn on_log_written(
        &self,
        is_master: bool,
        start: &LogCursor,
        end: &LogCursor,
        data: &Bytes,
    ) -> Result<()>;
}

/// Appends to the numbered log files
///
/// One writer per directory. All state sits behind a single mutex, so
/// writes, pushes and hook calls happen in log_id order.
pub struct LogWriter {
    dir: PathBuf,
    max_file_size: u64,
    sync_strategy: LogSyncStrategy,
    replicas: Arc<ReplicaRegistry>,
    hook: Option<Arc<dyn WriteHook>>,
    state: Mutex<WriterState>,
}

struct WriterState {
    /// None until `start_log`
    file: Option<File>,

    /// Position after the last written entry
    cursor: LogCursor,

    /// Batches written since the last fsync
    uncommitted: usize,

    /// Set when a failed write could not be undone
    poisoned: Option<String>,
}

/// A run of the buffer that ends a file or the buffer
struct Segment {
    from: usize,
    to: usize,
    switches: bool,

    /// Cursor after the segment
    end: LogCursor,
}

impl LogWriter {
    pub fn new(
        dir: &Path,
        max_file_size: u64,
        sync_strategy: LogSyncStrategy,
        replicas: Arc<ReplicaRegistry>,
        hook: Option<Arc<dyn WriteHook>>,
    ) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_file_size,
            sync_strategy,
            replicas,
            hook,
            state: Mutex::new(WriterState {
                file: None,
                cursor: LogCursor::default(),
                uncommitted: 0,
                poisoned: None,
            }),
        }
    }

    /// Open the file named by `cursor` and position at its offset
    ///
    /// Anything past the offset is a torn tail from a crash and is cut off.
    pub fn start_log(&self, cursor: LogCursor) -> Result<()> {
        if !cursor.is_valid() {
            return Err(LogError::InvalidArgument(format!("start_log({})", cursor)));
        }

        let mut state = self.state.lock();
        if state.file.is_some() {
            return Err(LogError::AlreadyInitialized);
        }

        let path = log_file_path(&self.dir, cursor.file_id);
        if cursor.offset > 0 && !path.exists() {
            return Err(LogError::LogMissing(cursor.file_id));
        }

        let mut file = OpenOptions::new().create(true).write(true).open(&path)?;
        let len = file.metadata()?.len();
        if len > cursor.offset {
            warn!(
                file_id = cursor.file_id,
                file_len = len,
                offset = cursor.offset,
                "truncating unreplayed tail"
            );
            file.set_len(cursor.offset)?;
        } else if len < cursor.offset {
            return Err(LogError::CorruptEntry(format!(
                "file {} is {} bytes, shorter than cursor offset {}",
                cursor.file_id, len, cursor.offset
            )));
        }
        file.seek(SeekFrom::Start(cursor.offset))?;

        state.file = Some(file);
        state.cursor = cursor;
        state.uncommitted = 0;

        info!(%cursor, "log writer started");
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.state.lock().file.is_some()
    }

    /// Position after the last written entry
    pub fn cursor(&self) -> LogCursor {
        self.state.lock().cursor
    }

    pub fn current_file_id(&self) -> u64 {
        self.state.lock().cursor.file_id
    }

    pub fn uncommitted_count(&self) -> usize {
        self.state.lock().uncommitted
    }

    /// Write a pre-framed buffer
    ///
    /// The buffer must be aligned, continue the current position, and be
    /// split into aligned segments by any SWITCH_LOG it contains. Nothing
    /// is written when any of that fails. With `push` the buffer is also
    /// sent to the registered replicas.
    pub fn append(&self, data: Bytes, push: bool) -> Result<LogCursor> {
        if data.is_empty() {
            return Err(LogError::InvalidArgument("append of empty buffer".to_string()));
        }
        if data.len() % DIRECT_IO_ALIGN != 0 {
            return Err(LogError::AlignmentViolation {
                len: data.len(),
                align: DIRECT_IO_ALIGN,
            });
        }

        let mut state = self.state.lock();
        let start = state.cursor;
        let end = self.write_locked(&mut state, &data)?;
        let start = if start.is_established() {
            start
        } else {
            LogCursor::new(start.file_id, first_sequence(&data)?, start.offset)
        };
        self.after_write(false, push, &start, &end, &data);
        Ok(end)
    }

    /// Frame `payloads` as DATA entries and write them as one batch
    ///
    /// Rolls over first when the current file has reached its size limit.
    /// Returns the cursors before and after the batch.
    pub fn append_entries<P: AsRef<[u8]>>(&self, payloads: &[P]) -> Result<(LogCursor, LogCursor)> {
        if payloads.is_empty() {
            return Err(LogError::InvalidArgument("no entries to append".to_string()));
        }
        if let Some(p) = payloads.iter().find(|p| p.as_ref().len() > MAX_PAYLOAD_SIZE) {
            return Err(LogError::InvalidArgument(format!(
                "payload of {} bytes exceeds {}",
                p.as_ref().len(),
                MAX_PAYLOAD_SIZE
            )));
        }

        let mut state = self.state.lock();
        if !state.cursor.is_established() {
            return Err(LogError::NotInitialized);
        }
        if state.cursor.offset >= self.max_file_size {
            self.switch_locked(&mut state)?;
        }

        let start = state.cursor;
        let mut batch = LogBatch::new(start.log_id);
        for payload in payloads {
            batch.push_data(payload.as_ref());
        }
        let (buf, _) = batch.finish();
        let data = Bytes::from(buf);

        let end = self.write_locked(&mut state, &data)?;
        self.after_write(true, true, &start, &end, &data);
        Ok((start, end))
    }

    /// Write a rollover batch and continue in the next file
    pub fn switch_log_file(&self) -> Result<u64> {
        let mut state = self.state.lock();
        if !state.cursor.is_established() {
            return Err(LogError::NotInitialized);
        }
        self.switch_locked(&mut state)
    }

    /// fsync the current file
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(file) = state.file.as_mut() {
            file.sync_data()?;
        }
        state.uncommitted = 0;
        Ok(())
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn switch_locked(&self, state: &mut WriterState) -> Result<u64> {
        let start = state.cursor;
        let next_file_id = start.file_id + 1;
        let (buf, _) = LogBatch::switch_log(start.log_id, next_file_id);
        let data = Bytes::from(buf);

        let end = self.write_locked(state, &data)?;
        self.after_write(true, true, &start, &end, &data);
        info!(from = start.file_id, to = next_file_id, log_id = end.log_id, "switched log file");
        Ok(next_file_id)
    }

    /// Validate then write `data`, rotating after each SWITCH_LOG
    ///
    /// A segment that fails to reach disk is cut off again, so the file
    /// and the cursor always end at the last segment written in full. If
    /// that cleanup fails as well, the writer refuses every later write.
    fn write_locked(&self, state: &mut WriterState, data: &[u8]) -> Result<LogCursor> {
        if let Some(reason) = &state.poisoned {
            return Err(LogError::WriterPoisoned(reason.clone()));
        }
        if state.file.is_none() {
            return Err(LogError::NotInitialized);
        }

        // Step 1: Validate the whole buffer and find the segment boundaries
        let mut cursor = state.cursor;
        let mut segments = Vec::new();
        let mut segment_start = 0;
        for item in EntryIter::new(data) {
            let (entry, pos) = item?;
            cursor.advance(&entry)?;
            if entry.command == LogCommand::SwitchLog {
                let segment_end = pos + entry.serialized_len();
                segments.push(Segment {
                    from: segment_start,
                    to: segment_end,
                    switches: true,
                    end: cursor,
                });
                segment_start = segment_end;
            }
        }
        if segment_start < data.len() {
            segments.push(Segment {
                from: segment_start,
                to: data.len(),
                switches: false,
                end: cursor,
            });
        }
        if let Some(segment) = segments
            .iter()
            .find(|s| (s.to - s.from) % DIRECT_IO_ALIGN != 0)
        {
            return Err(LogError::AlignmentViolation {
                len: segment.to - segment.from,
                align: DIRECT_IO_ALIGN,
            });
        }

        // Step 2: Write each segment, opening the next file after a switch
        for segment in &segments {
            let offset = state.cursor.offset;
            if let Err(e) = self.write_segment(state, &data[segment.from..segment.to], segment) {
                self.rollback(state, offset, segment.switches, &e);
                return Err(e);
            }
        }

        Ok(cursor)
    }

    fn write_segment(&self, state: &mut WriterState, bytes: &[u8], segment: &Segment) -> Result<()> {
        let file = state.file.as_mut().ok_or(LogError::NotInitialized)?;
        file.write_all(bytes)?;
        state.uncommitted += 1;

        if segment.switches {
            file.sync_data()?;
            let path = log_file_path(&self.dir, segment.end.file_id);
            let next = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?;
            state.file = Some(next);
            state.uncommitted = 0;
            debug!(file_id = segment.end.file_id, "opened new log file");
        } else {
            self.maybe_sync(state)?;
        }

        state.cursor = segment.end;
        Ok(())
    }

    /// Cut the current file back to `offset` after a failed segment
    fn rollback(&self, state: &mut WriterState, offset: u64, switches: bool, cause: &LogError) {
        let file_id = state.cursor.file_id;
        let truncated = match state.file.as_mut() {
            Some(file) => file
                .set_len(offset)
                .and_then(|()| file.seek(SeekFrom::Start(offset)))
                .map(|_| ()),
            None => Ok(()),
        };

        if switches {
            // An empty next file would be taken for the newest log file
            let next = log_file_path(&self.dir, file_id + 1);
            if let Err(e) = fs::remove_file(&next) {
                if e.kind() != io::ErrorKind::NotFound {
                    debug!(path = %next.display(), error = %e, "could not remove next log file");
                }
            }
        }

        match truncated {
            Ok(()) => warn!(file_id, offset, error = %cause, "write failed, rolled back"),
            Err(e) => {
                error!(file_id, offset, error = %e, "rollback failed, writer poisoned");
                state.poisoned = Some(format!(
                    "file {} could not be cut back to {} after: {}",
                    file_id, offset, cause
                ));
            }
        }
    }

    fn maybe_sync(&self, state: &mut WriterState) -> Result<()> {
        let due = match self.sync_strategy {
            LogSyncStrategy::EveryWrite => true,
            LogSyncStrategy::EveryNBatches { count } => state.uncommitted >= count,
        };
        if due {
            if let Some(file) = state.file.as_mut() {
                file.sync_data()?;
            }
            state.uncommitted = 0;
        }
        Ok(())
    }

    /// Push and notify; the write itself is already durable per strategy
    fn after_write(&self, is_master: bool, push: bool, start: &LogCursor, end: &LogCursor, data: &Bytes) {
        if push && !self.replicas.is_empty() {
            let chunk = LogChunk::new(start.log_id, end.log_id, data.clone());
            if let Err(e) = self.replicas.push_log(&chunk) {
                warn!(start_id = start.log_id, end_id = end.log_id, error = %e, "push to replicas failed");
            }
        }
        if let Some(hook) = &self.hook {
            if let Err(e) = hook.on_log_written(is_master, start, end, data) {
                warn!(start_id = start.log_id, end_id = end.log_id, error = %e, "write hook failed");
            }
        }
    }
}

impl Drop for LogWriter {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(file) = state.file.as_mut() {
            if let Err(e) = file.sync_data() {
                warn!(error = %e, "failed to sync log file on drop");
            }
        }
    }
}

fn first_sequence(data: &[u8]) -> Result<u64> {
    match EntryIter::new(data).next() {
        Some(item) => Ok(item?.0.sequence),
        None => Err(LogError::InvalidArgument("append of empty buffer".to_string())),
    }
}
