//! Log Reader
//!
//! Directory scanning and positioned reads over the numbered log files.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{LogError, Result};

use super::{LogChunk, LogCommand, LogCursor, LogEntry, DIRECT_IO_ALIGN, HEADER_SIZE};

/// Window used while walking a file to locate a log_id
const LOCATE_WINDOW: usize = 1024 * 1024;

/// Generate the path of a log file
pub fn log_file_path(dir: &Path, file_id: u64) -> PathBuf {
    dir.join(format!("{:08}.log", file_id))
}

/// Parse a file_id from a log file name
/// "00000042.log" → Some(42)
pub fn parse_log_file_id(path: &Path) -> Option<u64> {
    if path.extension()? != "log" {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    if stem.is_empty() || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok().filter(|id| *id > 0)
}

// =============================================================================
// Directory Scanner
// =============================================================================

/// Ordered view of the log files present in a directory
#[derive(Debug, Clone, Default)]
pub struct LogDirScanner {
    /// Sorted ascending
    file_ids: Vec<u64>,
}

impl LogDirScanner {
    /// Scan `dir` for log files; a missing directory is empty
    pub fn scan(dir: &Path) -> Result<Self> {
        let mut file_ids = Vec::new();
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if path.is_file() {
                if let Some(id) = parse_log_file_id(&path) {
                    file_ids.push(id);
                }
            }
        }
        file_ids.sort_unstable();
        Ok(Self { file_ids })
    }

    pub fn file_ids(&self) -> &[u64] {
        &self.file_ids
    }

    pub fn is_empty(&self) -> bool {
        self.file_ids.is_empty()
    }

    pub fn max_file_id(&self) -> Option<u64> {
        self.file_ids.last().copied()
    }

    /// First file of the continuous run that ends at the newest file
    ///
    /// Older files separated by a gap can never be replayed through and are
    /// ignored.
    pub fn min_file_id(&self) -> Option<u64> {
        let mut min = *self.file_ids.last()?;
        for id in self.file_ids.iter().rev().skip(1) {
            if *id + 1 != min {
                break;
            }
            min = *id;
        }
        Some(min)
    }

    /// Whether every file between the oldest and newest is present
    pub fn is_continuous(&self) -> bool {
        self.file_ids.windows(2).all(|w| w[0] + 1 == w[1])
    }

    pub fn contains(&self, file_id: u64) -> bool {
        self.file_ids.binary_search(&file_id).is_ok()
    }
}

// =============================================================================
// Positioned Reader
// =============================================================================

/// A run of whole entries read from one file
#[derive(Debug, Clone)]
pub struct ReadChunk {
    pub data: Bytes,

    /// Cursor the read started at
    pub start: LogCursor,

    /// Cursor after the last returned entry
    pub end: LogCursor,
}

/// Reads log files by cursor or by log_id
///
/// Every returned chunk ends on an aligned entry boundary, so only whole
/// batches are ever handed out and a torn batch at the tail of the newest
/// file is never returned.
pub struct PositionedLogReader {
    dir: PathBuf,

    /// file_id → first log_id; stable once a file has an entry
    first_log_ids: Mutex<BTreeMap<u64, u64>>,

    /// Position of the last served read, to avoid rescanning from offset 0
    hint: Mutex<Option<LogCursor>>,
}

impl PositionedLogReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            first_log_ids: Mutex::new(BTreeMap::new()),
            hint: Mutex::new(None),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// log_id of the first entry in `file_id`
    pub fn get_first_log_id(&self, file_id: u64) -> Result<u64> {
        if let Some(id) = self.first_log_ids.lock().get(&file_id) {
            return Ok(*id);
        }
        let buf = read_window(&log_file_path(&self.dir, file_id), 0, HEADER_SIZE)?;
        let sequence = LogEntry::peek_sequence(&buf)?.ok_or(LogError::EntryNotFound)?;
        self.first_log_ids.lock().insert(file_id, sequence);
        Ok(sequence)
    }

    /// Read whole batches starting at `cursor`, about `max_len` bytes
    ///
    /// Stops after a SWITCH_LOG entry. Returns an empty chunk when nothing
    /// complete follows `cursor` in its file. A batch larger than
    /// `max_len` is still returned whole.
    pub fn read_at(&self, cursor: &LogCursor, max_len: usize) -> Result<ReadChunk> {
        if !cursor.is_valid() {
            return Err(LogError::InvalidArgument(format!("read_at({})", cursor)));
        }
        let path = log_file_path(&self.dir, cursor.file_id);
        let mut window = max_len.max(DIRECT_IO_ALIGN);
        loop {
            let buf = read_window(&path, cursor.offset, window)?;
            let (len, end) = collect_aligned(&buf, cursor)?;
            if len > 0 || buf.len() < window {
                let mut buf = buf;
                buf.truncate(len);
                return Ok(ReadChunk {
                    data: Bytes::from(buf),
                    start: *cursor,
                    end,
                });
            }
            window *= 2;
        }
    }

    /// Read whole batches starting at `start_id`
    ///
    /// Returns `DataNotServed` if no retained file holds `start_id`.
    pub fn read_log(&self, start_id: u64, max_len: usize) -> Result<LogChunk> {
        let cursor = self.locate(start_id)?;
        let chunk = match self.read_at(&cursor, max_len) {
            Err(LogError::EntryNotFound) => return Err(not_served(start_id)),
            other => other?,
        };
        if chunk.data.is_empty() {
            return Err(LogError::DataNotServed(format!(
                "log_id {} not yet complete on disk",
                start_id
            )));
        }
        *self.hint.lock() = Some(chunk.end);
        debug!(start_id, end_id = chunk.end.log_id, len = chunk.data.len(), "read log from disk");
        Ok(LogChunk::new(start_id, chunk.end.log_id, chunk.data))
    }

    /// Find the cursor of the entry with `log_id`
    pub fn locate(&self, log_id: u64) -> Result<LogCursor> {
        if log_id == 0 {
            return Err(LogError::InvalidArgument("log_id 0".to_string()));
        }

        let hint = *self.hint.lock();
        if let Some(h) = hint.filter(|h| h.is_valid() && h.is_established() && h.log_id <= log_id) {
            match self.walk_to(h, log_id) {
                Err(LogError::DataNotServed(_)) => *self.hint.lock() = None,
                other => return other,
            }
        }
        let start = self.find_file(log_id)?;
        self.walk_to(start, log_id)
    }

    /// Step entry by entry from `cursor` until reaching `log_id`
    fn walk_to(&self, mut cursor: LogCursor, log_id: u64) -> Result<LogCursor> {
        let mut window = LOCATE_WINDOW;
        while cursor.log_id != log_id {
            let path = log_file_path(&self.dir, cursor.file_id);
            let buf = match read_window(&path, cursor.offset, window) {
                Ok(buf) => buf,
                Err(LogError::EntryNotFound) => return Err(not_served(log_id)),
                Err(e) => return Err(e),
            };

            let mut pos = 0;
            while pos < buf.len() && cursor.log_id != log_id {
                let Some((entry, len)) = LogEntry::decode(&buf[pos..])? else {
                    break;
                };
                cursor.advance(&entry)?;
                pos += len;
                if entry.command == LogCommand::SwitchLog {
                    // Continue in the next file
                    break;
                }
            }

            if cursor.log_id > log_id {
                return Err(not_served(log_id));
            }
            if pos == 0 {
                if buf.len() < window {
                    return Err(not_served(log_id));
                }
                window *= 2;
            }
        }
        Ok(cursor)
    }

    /// Cursor at the start of the newest file whose first log_id ≤ `log_id`
    fn find_file(&self, log_id: u64) -> Result<LogCursor> {
        let scanner = LogDirScanner::scan(&self.dir)?;
        let min = scanner.min_file_id();
        for file_id in scanner.file_ids().iter().rev() {
            if Some(*file_id) < min {
                break;
            }
            match self.get_first_log_id(*file_id) {
                Ok(first) if first <= log_id => return Ok(LogCursor::new(*file_id, first, 0)),
                Ok(_) => continue,
                Err(LogError::EntryNotFound) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(not_served(log_id))
    }
}

fn not_served(log_id: u64) -> LogError {
    LogError::DataNotServed(format!("log_id {} is not on disk", log_id))
}

/// Read up to `len` bytes of `path` starting at `offset`
fn read_window(path: &Path, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(LogError::EntryNotFound),
        Err(e) => return Err(e.into()),
    };
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::with_capacity(len);
    file.take(len as u64).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Length of the longest aligned prefix of whole entries, and the cursor after it
///
/// Corruption after some aligned data ends the prefix; the next read from
/// that point reports it.
fn collect_aligned(buf: &[u8], start: &LogCursor) -> Result<(usize, LogCursor)> {
    let mut cursor = *start;
    let mut pos = 0;
    let mut aligned = (0, *start);

    while pos < buf.len() {
        let (entry, len) = match LogEntry::decode(&buf[pos..]) {
            Ok(Some(decoded)) => decoded,
            Ok(None) => break,
            Err(e) if aligned.0 > 0 => {
                warn!(file_id = start.file_id, pos, error = %e, "stopping read before bad entry");
                break;
            }
            Err(e) => return Err(e),
        };
        cursor.advance(&entry)?;
        pos += len;
        if pos % DIRECT_IO_ALIGN == 0 {
            aligned = (pos, cursor);
        }
        if entry.command == LogCommand::SwitchLog {
            break;
        }
    }

    Ok(aligned)
}
