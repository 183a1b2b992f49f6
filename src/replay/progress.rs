//! Replay progress
//!
//! Watermarks over the log_id space, each an exclusive end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::log::LogCursor;

/// A monotonic log_id that callers can block on
///
/// Reads are lock-free. Updates take the mutex so a waiter can never miss
/// one between checking the value and going to sleep.
pub struct Watermark {
    value: AtomicU64,

    /// Closed flag; set once no further progress will be made
    closed: Mutex<bool>,
    changed: Condvar,
}

impl Watermark {
    pub fn new(initial: u64) -> Self {
        Self {
            value: AtomicU64::new(initial),
            closed: Mutex::new(false),
            changed: Condvar::new(),
        }
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    /// Raise to `log_id`; lower values are ignored. Returns the new value
    pub fn advance(&self, log_id: u64) -> u64 {
        let _guard = self.closed.lock();
        let prev = self.value.fetch_max(log_id, Ordering::AcqRel);
        if log_id > prev {
            self.changed.notify_all();
        }
        prev.max(log_id)
    }

    /// Block until the value reaches `target`, the timeout passes, or the
    /// watermark is closed. Returns the value seen last.
    pub fn wait_until(&self, target: u64, timeout: Duration) -> u64 {
        let deadline = Instant::now() + timeout;
        let mut closed = self.closed.lock();
        loop {
            let current = self.get();
            if current >= target || *closed {
                return current;
            }
            if self.changed.wait_until(&mut closed, deadline).timed_out() {
                return self.get();
            }
        }
    }

    /// Wake every waiter; later waits return immediately
    pub fn close(&self) {
        *self.closed.lock() = true;
        self.changed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Shared replay state
///
/// `cursor` is the position after the last batch handed to the worker (or,
/// on a master, after the last batch written). The watermarks trail it.
#[derive(Default)]
pub struct ReplayProgress {
    cursor: Mutex<LogCursor>,
    pub replayed: Watermark,
    pub committed: Watermark,
    pub flushed: Watermark,
}

impl ReplayProgress {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cursor(&self) -> LogCursor {
        *self.cursor.lock()
    }

    pub(crate) fn cursor_mut(&self) -> parking_lot::MutexGuard<'_, LogCursor> {
        self.cursor.lock()
    }

    /// Position at `cursor` with nothing in flight
    pub fn start_log(&self, cursor: LogCursor) {
        *self.cursor.lock() = cursor;
        self.advance_all(cursor.log_id);
    }

    /// Master path: the batch ending at `cursor` is written and applied
    pub fn update_replay_cursor(&self, cursor: LogCursor) {
        {
            let mut current = self.cursor.lock();
            if cursor.log_id >= current.log_id {
                *current = cursor;
            }
        }
        self.advance_all(cursor.log_id);
    }

    fn advance_all(&self, log_id: u64) {
        self.replayed.advance(log_id);
        self.committed.advance(log_id);
        self.flushed.advance(log_id);
    }

    pub fn close(&self) {
        self.replayed.close();
        self.committed.close();
        self.flushed.close();
    }
}
