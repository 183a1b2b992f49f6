//! Error types for the commit log
//!
//! Provides a unified error type for all log operations.

use thiserror::Error;

/// Result type alias using LogError
pub type Result<T> = std::result::Result<T, LogError>;

/// Unified error type for commit log operations
#[derive(Debug, Error)]
pub enum LogError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Log manager is not initialized")]
    NotInitialized,

    #[error("Log manager is already initialized")]
    AlreadyInitialized,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Invalid role transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Log writer is poisoned: {0}")]
    WriterPoisoned(String),

    // -------------------------------------------------------------------------
    // Log Content Errors
    // -------------------------------------------------------------------------
    #[error("Buffer length {len} is not aligned to {align} bytes")]
    AlignmentViolation { len: usize, align: usize },

    #[error("Discontinuous log: expected log_id {expected}, got {actual}")]
    DiscontinuousLog { expected: u64, actual: u64 },

    #[error("Corrupt log entry: {0}")]
    CorruptEntry(String),

    #[error("Log file missing: file_id={0}")]
    LogMissing(u64),

    #[error("Entry not found")]
    EntryNotFound,

    // -------------------------------------------------------------------------
    // Serving Errors
    // -------------------------------------------------------------------------
    #[error("Requested log range is not served: {0}")]
    DataNotServed(String),

    // -------------------------------------------------------------------------
    // Control Flow (consumed by the replay loop)
    // -------------------------------------------------------------------------
    #[error("Need retry")]
    NeedRetry,

    #[error("Need wait")]
    NeedWait,

    #[error("Canceled")]
    Canceled,

    #[error("Already done")]
    AlreadyDone,

    // -------------------------------------------------------------------------
    // Collaborator Errors
    // -------------------------------------------------------------------------
    #[error("Apply failed at log_id {log_id}: {reason}")]
    Apply { log_id: u64, reason: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Fatal
    // -------------------------------------------------------------------------
    #[error("Fatal log fault: {0}")]
    Fatal(#[source] Box<LogError>),
}

impl LogError {
    /// Signals the replay loop consumes instead of surfacing
    pub fn is_control_flow(&self) -> bool {
        matches!(self, LogError::NeedRetry | LogError::NeedWait | LogError::Canceled)
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, LogError::Fatal(_))
    }
}

impl From<bincode::Error> for LogError {
    fn from(e: bincode::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}
