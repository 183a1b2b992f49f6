//! Log cursor
//!
//! Identity (log_id) and physical address (file_id, offset) of a position
//! in the commit log.

use std::fmt;

use crate::error::{LogError, Result};

use super::{LogCommand, LogEntry};

/// Position in the commit log
///
/// Ordered by `log_id`. `file_id`/`offset` are the derived physical address.
/// A cursor is valid once `file_id >= 1`; `log_id == 0` means the position
/// has not been established yet and any first sequence is accepted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct LogCursor {
    pub file_id: u64,
    pub log_id: u64,
    pub offset: u64,
}

impl LogCursor {
    pub fn new(file_id: u64, log_id: u64, offset: u64) -> Self {
        Self {
            file_id,
            log_id,
            offset,
        }
    }

    /// Cursor pointing at the start of a file with unknown log_id
    pub fn at_file(file_id: u64) -> Self {
        Self::new(file_id, 0, 0)
    }

    pub fn is_valid(&self) -> bool {
        self.file_id >= 1
    }

    /// Whether the log_id has been established
    pub fn is_established(&self) -> bool {
        self.log_id > 0
    }

    /// Step over one entry
    ///
    /// The entry's sequence must equal `log_id` once established. A
    /// SWITCH_LOG entry must name `file_id + 1` and moves the cursor to the
    /// start of that file.
    pub fn advance(&mut self, entry: &LogEntry) -> Result<()> {
        if self.log_id > 0 && entry.sequence != self.log_id {
            return Err(LogError::DiscontinuousLog {
                expected: self.log_id,
                actual: entry.sequence,
            });
        }

        if entry.command == LogCommand::SwitchLog {
            let next_file_id = entry.switch_target()?;
            if next_file_id != self.file_id + 1 {
                return Err(LogError::CorruptEntry(format!(
                    "switch_log at log_id {} targets file {}, expected {}",
                    entry.sequence,
                    next_file_id,
                    self.file_id + 1
                )));
            }
            self.file_id = next_file_id;
            self.offset = 0;
        } else {
            self.offset += entry.serialized_len() as u64;
        }
        self.log_id = entry.sequence + 1;

        Ok(())
    }
}

impl fmt::Display for LogCursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LogCursor(file_id={}, log_id={}, offset={})",
            self.file_id, self.log_id, self.offset
        )
    }
}
