//! Engine Module
//!
//! The storage engine contract the commit log replays into.
//!
//! ## Responsibilities
//! - Apply every log entry, in log_id order, without gaps
//! - Report how much of the log it has made durable on its own, so
//!   local replay can skip it

use thiserror::Error;

use crate::log::LogEntry;

/// Failure to apply one entry; always fatal for the log manager
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ApplyError(pub String);

impl ApplyError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// Storage engine fed by the commit log
///
/// `apply` is called for every entry including SWITCH_LOG and NOP, which
/// engines are expected to ignore.
pub trait StorageEngine: Send + Sync {
    /// Newest log file whose contents are durable in the engine itself
    fn get_max_persisted_log_file_id(&self) -> Option<u64>;

    /// Log file of the last major checkpoint; where a new slave starts
    fn get_last_major_checkpoint_log_file_id(&self) -> Option<u64>;

    fn apply(&self, entry: &LogEntry) -> std::result::Result<(), ApplyError>;
}
