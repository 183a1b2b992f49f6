//! Commit Log Module
//!
//! Append-only, numbered log files holding framed, checksummed entries.
//!
//! ## Responsibilities
//! - Frame entries with CRC32 checksums for corruption detection
//! - Track positions with `LogCursor` (log_id + file_id/offset)
//! - Append aligned batches durably and rotate files
//! - Read back by cursor or by log_id for replay and slave fetch
//! - Persist the replay point and recover positions after a crash
//!
//! ## File Format
//! ```text
//! {log_dir}/00000001.log
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Batch (multiple of 512 bytes)                                │
//! │ ┌──────────────────────────────────────────────────┬───────┐ │
//! │ │ Entry: Magic(4) Cmd(4) Seq(8) Len(4) DataCRC(4)  │ Data  │ │
//! │ │        HeaderCRC(4)                              │       │ │
//! │ └──────────────────────────────────────────────────┴───────┘ │
//! │ ... more entries, then one NOP entry padding to alignment    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ ... more batches                                             │
//! ├──────────────────────────────────────────────────────────────┤
//! │ Rollover batch: NOP padding, SWITCH_LOG(next file_id)        │
//! └──────────────────────────────────────────────────────────────┘
//! ```

use bytes::Bytes;

mod cursor;
mod entry;
mod reader;
mod recovery;
mod replay_point;
mod writer;

pub use cursor::LogCursor;
pub use entry::{
    nop_padding_len, parse_log_buffer, scan_log_range, EntryIter, LogBatch, LogCommand, LogEntry,
    DIRECT_IO_ALIGN, HEADER_SIZE, LOG_MAGIC, MAX_PAYLOAD_SIZE,
};
pub use reader::{log_file_path, parse_log_file_id, LogDirScanner, PositionedLogReader, ReadChunk};
pub use recovery::{get_local_max_log_cursor, replay_local_files};
pub use replay_point::ReplayPointFile;
pub use writer::{LogWriter, WriteHook};

/// A contiguous run of framed entries covering `[start_id, end_id)`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogChunk {
    pub start_id: u64,
    pub end_id: u64,
    pub data: Bytes,
}

impl LogChunk {
    pub fn new(start_id: u64, end_id: u64, data: impl Into<Bytes>) -> Self {
        Self {
            start_id,
            end_id,
            data: data.into(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}
