//! Log entry definitions
//!
//! Framing, integrity checking and batch construction for individual
//! commit log entries.

use bytes::Bytes;

use crate::error::{LogError, Result};

use super::LogCursor;

/// Size of the fixed entry header
pub const HEADER_SIZE: usize = 28;

/// Every write and every served range is a multiple of this
pub const DIRECT_IO_ALIGN: usize = 512;

/// "CLOG" read as a little-endian u32
pub const LOG_MAGIC: u32 = 0x474F_4C43;

/// Upper bound on a single payload; anything larger is treated as garbage
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

const SWITCH_LOG_PAYLOAD_SIZE: usize = 8;

/// Kind of a log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogCommand {
    /// A mutation for the storage engine
    Data = 1,

    /// Rollover marker; payload is the next file_id
    SwitchLog = 2,

    /// Alignment padding
    Nop = 3,
}

impl LogCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            1 => Some(LogCommand::Data),
            2 => Some(LogCommand::SwitchLog),
            3 => Some(LogCommand::Nop),
            _ => None,
        }
    }
}

/// A single entry in the commit log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub command: LogCommand,

    /// The entry's log_id
    pub sequence: u64,

    pub payload: Bytes,
}

impl LogEntry {
    pub fn new(command: LogCommand, sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self {
            command,
            sequence,
            payload: payload.into(),
        }
    }

    pub fn data(sequence: u64, payload: impl Into<Bytes>) -> Self {
        Self::new(LogCommand::Data, sequence, payload)
    }

    pub fn switch_log(sequence: u64, next_file_id: u64) -> Self {
        Self::new(
            LogCommand::SwitchLog,
            sequence,
            next_file_id.to_le_bytes().to_vec(),
        )
    }

    /// A padding entry occupying exactly `total_len` bytes on disk
    pub fn nop(sequence: u64, total_len: usize) -> Self {
        debug_assert!(total_len >= HEADER_SIZE);
        Self::new(LogCommand::Nop, sequence, vec![0u8; total_len - HEADER_SIZE])
    }

    /// Bytes this entry occupies when framed
    pub fn serialized_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Target file of a SWITCH_LOG entry
    pub fn switch_target(&self) -> Result<u64> {
        if self.command != LogCommand::SwitchLog {
            return Err(LogError::InvalidArgument(format!(
                "log_id {} is not a switch_log entry",
                self.sequence
            )));
        }
        let raw: [u8; SWITCH_LOG_PAYLOAD_SIZE] =
            self.payload.as_ref().try_into().map_err(|_| {
                LogError::CorruptEntry(format!(
                    "switch_log at log_id {} has a {}-byte payload",
                    self.sequence,
                    self.payload.len()
                ))
            })?;
        Ok(u64::from_le_bytes(raw))
    }

    /// Append the framed entry to `buf`
    ///
    /// Format: magic (4) + command (4) + sequence (8) + payload_len (4)
    ///       + payload_crc (4) + header_crc (4) + payload
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        let header_start = buf.len();
        buf.extend_from_slice(&LOG_MAGIC.to_le_bytes());
        buf.extend_from_slice(&(self.command as u32).to_le_bytes());
        buf.extend_from_slice(&self.sequence.to_le_bytes());
        buf.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        buf.extend_from_slice(&crc32fast::hash(&self.payload).to_le_bytes());
        let header_crc = crc32fast::hash(&buf[header_start..]);
        buf.extend_from_slice(&header_crc.to_le_bytes());
        buf.extend_from_slice(&self.payload);
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.serialized_len());
        self.serialize_into(&mut buf);
        buf
    }

    /// Sequence from a header alone, checking magic and header checksum
    pub fn peek_sequence(bytes: &[u8]) -> Result<Option<u64>> {
        if bytes.len() < HEADER_SIZE {
            return Ok(None);
        }
        check_header(bytes)?;
        Ok(Some(read_u64(bytes, 8)))
    }

    /// Decode the entry at the start of `bytes`
    ///
    /// Returns `Ok(None)` when `bytes` ends before the entry does, so a
    /// torn tail can be told apart from corruption.
    pub fn decode(bytes: &[u8]) -> Result<Option<(LogEntry, usize)>> {
        if bytes.len() < HEADER_SIZE {
            return Ok(None);
        }

        check_header(bytes)?;

        let raw_command = read_u32(bytes, 4);
        let command = LogCommand::from_u32(raw_command).ok_or_else(|| {
            LogError::CorruptEntry(format!("unknown command {}", raw_command))
        })?;
        let sequence = read_u64(bytes, 8);
        let payload_len = read_u32(bytes, 16) as usize;
        let payload_crc = read_u32(bytes, 20);

        if payload_len > MAX_PAYLOAD_SIZE {
            return Err(LogError::CorruptEntry(format!(
                "payload too large: {} bytes (max {})",
                payload_len, MAX_PAYLOAD_SIZE
            )));
        }

        let total_len = HEADER_SIZE + payload_len;
        if bytes.len() < total_len {
            return Ok(None);
        }

        let payload = &bytes[HEADER_SIZE..total_len];
        if crc32fast::hash(payload) != payload_crc {
            return Err(LogError::CorruptEntry(format!(
                "payload checksum mismatch at log_id {}",
                sequence
            )));
        }

        let entry = LogEntry {
            command,
            sequence,
            payload: Bytes::copy_from_slice(payload),
        };
        Ok(Some((entry, total_len)))
    }

    /// Decode the entry at the start of `bytes`, treating truncation as corruption
    pub fn deserialize(bytes: &[u8]) -> Result<(LogEntry, usize)> {
        Self::decode(bytes)?.ok_or_else(|| {
            LogError::CorruptEntry(format!("truncated entry ({} bytes left)", bytes.len()))
        })
    }
}

fn check_header(bytes: &[u8]) -> Result<()> {
    let magic = read_u32(bytes, 0);
    if magic != LOG_MAGIC {
        return Err(LogError::CorruptEntry(format!("bad magic 0x{:08x}", magic)));
    }
    let header_crc = read_u32(bytes, 24);
    if crc32fast::hash(&bytes[..24]) != header_crc {
        return Err(LogError::CorruptEntry("header checksum mismatch".to_string()));
    }
    Ok(())
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

fn read_u64(bytes: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[at..at + 8]);
    u64::from_le_bytes(raw)
}

// =============================================================================
// Buffer Scanning
// =============================================================================

/// Iterator over the entries packed in a buffer
///
/// Yields `(entry, start_position)`. A trailing partial entry is an error.
pub struct EntryIter<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> EntryIter<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self {
            buf,
            pos: 0,
            failed: false,
        }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Iterator for EntryIter<'_> {
    type Item = Result<(LogEntry, usize)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.buf.len() {
            return None;
        }
        let start = self.pos;
        match LogEntry::deserialize(&self.buf[start..]) {
            Ok((entry, len)) => {
                self.pos += len;
                Some(Ok((entry, start)))
            }
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Validate `buf` against `start` and return the cursor after it
///
/// Every entry must decode, pass its integrity check, continue the
/// sequence, and every SWITCH_LOG must name the next file. The buffer must
/// be consumed exactly. Pure function of its inputs.
pub fn parse_log_buffer(buf: &[u8], start: &LogCursor) -> Result<LogCursor> {
    if buf.is_empty() || !start.is_valid() {
        return Err(LogError::InvalidArgument(format!(
            "parse_log_buffer(len={}, start={})",
            buf.len(),
            start
        )));
    }

    let mut end = *start;
    for item in EntryIter::new(buf) {
        let (entry, _) = item?;
        end.advance(&entry)?;
    }
    Ok(end)
}

/// Return the `[start_id, end_id)` range covered by `buf`
///
/// Checks framing, integrity and internal contiguity without a known
/// starting position. Consecutive SWITCH_LOG entries must name
/// consecutive files.
pub fn scan_log_range(buf: &[u8]) -> Result<(u64, u64)> {
    if buf.is_empty() {
        return Err(LogError::InvalidArgument("empty log buffer".to_string()));
    }

    let mut start_id = None;
    let mut next_id = 0u64;
    let mut last_switch: Option<u64> = None;

    for item in EntryIter::new(buf) {
        let (entry, _) = item?;
        match start_id {
            None => start_id = Some(entry.sequence),
            Some(_) if entry.sequence != next_id => {
                return Err(LogError::DiscontinuousLog {
                    expected: next_id,
                    actual: entry.sequence,
                });
            }
            Some(_) => {}
        }
        if entry.command == LogCommand::SwitchLog {
            let target = entry.switch_target()?;
            if let Some(prev) = last_switch {
                if target != prev + 1 {
                    return Err(LogError::CorruptEntry(format!(
                        "switch_log targets file {} after file {}",
                        target, prev
                    )));
                }
            }
            last_switch = Some(target);
        }
        next_id = entry.sequence + 1;
    }

    // Non-empty buffer with no error yields at least one entry
    let start_id = start_id.ok_or_else(|| LogError::CorruptEntry("no entries".to_string()))?;
    Ok((start_id, next_id))
}

// =============================================================================
// Batch Construction
// =============================================================================

/// Bytes of NOP padding needed after `len` bytes to reach alignment
///
/// Zero when already aligned; otherwise at least one header's worth.
pub fn nop_padding_len(len: usize) -> usize {
    let rem = len % DIRECT_IO_ALIGN;
    if rem == 0 {
        return 0;
    }
    let mut pad = DIRECT_IO_ALIGN - rem;
    while pad < HEADER_SIZE {
        pad += DIRECT_IO_ALIGN;
    }
    pad
}

/// Builds one aligned batch of consecutive entries
pub struct LogBatch {
    buf: Vec<u8>,
    start_id: u64,
    next_id: u64,
}

impl LogBatch {
    pub fn new(start_id: u64) -> Self {
        Self {
            buf: Vec::new(),
            start_id,
            next_id: start_id,
        }
    }

    pub fn push(&mut self, command: LogCommand, payload: &[u8]) {
        LogEntry::new(command, self.next_id, Bytes::copy_from_slice(payload))
            .serialize_into(&mut self.buf);
        self.next_id += 1;
    }

    pub fn push_data(&mut self, payload: &[u8]) {
        self.push(LogCommand::Data, payload);
    }

    pub fn start_id(&self) -> u64 {
        self.start_id
    }

    pub fn is_empty(&self) -> bool {
        self.next_id == self.start_id
    }

    /// Pad with a trailing NOP and return `(bytes, end_id)`
    pub fn finish(mut self) -> (Vec<u8>, u64) {
        let pad = nop_padding_len(self.buf.len());
        if pad > 0 {
            LogEntry::nop(self.next_id, pad).serialize_into(&mut self.buf);
            self.next_id += 1;
        }
        (self.buf, self.next_id)
    }

    /// A rollover batch: NOP padding first, SWITCH_LOG last
    ///
    /// The switch entry ends the batch so everything before it lands in
    /// the old file.
    pub fn switch_log(start_id: u64, next_file_id: u64) -> (Vec<u8>, u64) {
        let switch = LogEntry::switch_log(start_id + 1, next_file_id);
        let pad = nop_padding_len(switch.serialized_len());
        let mut buf = Vec::with_capacity(pad + switch.serialized_len());
        LogEntry::nop(start_id, pad).serialize_into(&mut buf);
        switch.serialize_into(&mut buf);
        (buf, start_id + 2)
    }
}
