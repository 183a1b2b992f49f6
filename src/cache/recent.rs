//! Recent log cache
//!
//! Bounded ring of the most recent log batches, indexed by log_id.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use parking_lot::RwLock;
use tracing::{trace, warn};

use crate::error::{LogError, Result};
use crate::log::{EntryIter, LogChunk};

/// One appended batch covering `[start_id, end_id)`
#[derive(Debug, Clone)]
struct CachedBatch {
    start_id: u64,
    end_id: u64,
    data: Bytes,
}

#[derive(Debug, Default)]
struct CacheState {
    batches: VecDeque<CachedBatch>,

    /// Total bytes held by `batches`
    size: usize,

    start_id: u64,
    end_id: u64,

    /// False until the first append; an uninitialized cache accepts any start
    initialized: bool,
}

/// In-memory window `[start_id, end_id)` over the most recent log
///
/// A single producer appends contiguous batches; the oldest are evicted
/// once `capacity` bytes are held. Any number of readers.
pub struct RecentLogCache {
    capacity: usize,
    state: RwLock<CacheState>,
}

impl RecentLogCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            state: RwLock::new(CacheState::default()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn start_id(&self) -> u64 {
        self.state.read().start_id
    }

    pub fn end_id(&self) -> u64 {
        self.state.read().end_id
    }

    /// Bytes currently held
    pub fn size(&self) -> usize {
        self.state.read().size
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().batches.is_empty()
    }

    /// Whether `log_id` can be served
    pub fn contains(&self, log_id: u64) -> bool {
        let state = self.state.read();
        state.start_id <= log_id && log_id < state.end_id
    }

    /// Append the batch covering `[start_id, end_id)`
    ///
    /// `start_id` must equal the current end. On error the cache is
    /// unchanged.
    pub fn append(&self, start_id: u64, end_id: u64, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        if start_id >= end_id || data.is_empty() {
            return Err(LogError::InvalidArgument(format!(
                "cache append [{}, {}) with {} bytes",
                start_id,
                end_id,
                data.len()
            )));
        }

        let mut state = self.state.write();
        if state.initialized && start_id != state.end_id {
            return Err(LogError::DiscontinuousLog {
                expected: state.end_id,
                actual: start_id,
            });
        }
        state.initialized = true;

        if data.len() > self.capacity {
            warn!(
                start_id,
                end_id,
                len = data.len(),
                capacity = self.capacity,
                "batch larger than log cache, resetting"
            );
            state.batches.clear();
            state.size = 0;
            state.start_id = end_id;
            state.end_id = end_id;
            return Ok(());
        }

        while state.size + data.len() > self.capacity {
            let Some(evicted) = state.batches.pop_front() else {
                break;
            };
            state.size -= evicted.data.len();
            state.start_id = evicted.end_id;
        }

        if state.batches.is_empty() {
            state.start_id = start_id;
        }
        state.size += data.len();
        state.end_id = end_id;
        state.batches.push_back(CachedBatch {
            start_id,
            end_id,
            data,
        });

        trace!(start_id, end_id, cache_start = state.start_id, "log cache append");
        Ok(())
    }

    /// Exactly the bytes of `[start_id, end_id)`
    pub fn read(&self, start_id: u64, end_id: u64) -> Result<Bytes> {
        let state = self.state.read();
        if start_id > end_id || start_id < state.start_id || end_id > state.end_id {
            return Err(not_served(start_id, end_id, &state));
        }
        if start_id == end_id {
            return Ok(Bytes::new());
        }

        let first = batch_index(&state, start_id)?;
        let mut out = BytesMut::new();
        for batch in state.batches.iter().skip(first) {
            if batch.start_id >= end_id {
                break;
            }
            let from = if start_id > batch.start_id {
                entry_offset(batch, start_id)?
            } else {
                0
            };
            let to = if end_id < batch.end_id {
                entry_offset(batch, end_id)?
            } else {
                batch.data.len()
            };
            if batch.start_id <= start_id && end_id <= batch.end_id {
                return Ok(batch.data.slice(from..to));
            }
            out.extend_from_slice(&batch.data[from..to]);
        }
        Ok(out.freeze())
    }

    /// Whole batches from `start_id`'s position, up to about `max_len` bytes
    ///
    /// At least one batch is returned even if it alone exceeds `max_len`.
    pub fn get_log(&self, start_id: u64, max_len: usize) -> Result<LogChunk> {
        let state = self.state.read();
        if start_id < state.start_id || start_id >= state.end_id {
            return Err(not_served(start_id, start_id + 1, &state));
        }

        let first = batch_index(&state, start_id)?;
        let mut out = BytesMut::new();
        let mut end_id = start_id;
        for batch in state.batches.iter().skip(first) {
            let from = if start_id > batch.start_id {
                entry_offset(batch, start_id)?
            } else {
                0
            };
            let part = &batch.data[from..];
            if !out.is_empty() && out.len() + part.len() > max_len {
                break;
            }
            out.extend_from_slice(part);
            end_id = batch.end_id;
        }

        Ok(LogChunk::new(start_id, end_id, out.freeze()))
    }

    /// Drop everything and accept any next start
    pub fn reset(&self) {
        *self.state.write() = CacheState::default();
    }
}

fn not_served(start_id: u64, end_id: u64, state: &CacheState) -> LogError {
    LogError::DataNotServed(format!(
        "[{}, {}) outside cache [{}, {})",
        start_id, end_id, state.start_id, state.end_id
    ))
}

/// Index of the batch holding `log_id`
fn batch_index(state: &CacheState, log_id: u64) -> Result<usize> {
    let idx = state.batches.partition_point(|b| b.end_id <= log_id);
    match state.batches.get(idx) {
        Some(b) if b.start_id <= log_id => Ok(idx),
        _ => Err(not_served(log_id, log_id + 1, state)),
    }
}

/// Byte offset of entry `log_id` inside `batch`
fn entry_offset(batch: &CachedBatch, log_id: u64) -> Result<usize> {
    for item in EntryIter::new(&batch.data) {
        let (entry, pos) = item?;
        if entry.sequence == log_id {
            return Ok(pos);
        }
    }
    Err(LogError::CorruptEntry(format!(
        "log_id {} missing from cached batch [{}, {})",
        log_id, batch.start_id, batch.end_id
    )))
}
