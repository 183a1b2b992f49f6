//! Replay Module
//!
//! Moves log batches into the storage engine.
//!
//! ## Responsibilities
//! - Apply batches asynchronously, in log_id order, gap-free
//! - Track replayed/committed/flushed watermarks that callers can wait on
//! - Store batches received from a master to the local log
//! - Find the next batch to replay: local cache first, then the master

use std::sync::Arc;

use bytes::Bytes;

use crate::error::{LogError, Result};
use crate::log::LogCursor;

mod progress;
mod source;
mod worker;

pub use progress::{ReplayProgress, Watermark};
pub use source::ReplayLogSource;
pub use worker::ReplayWorker;

/// What the worker does with a submitted batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMode {
    /// The batch is already in the local log; apply only
    Replay,

    /// The batch came from a master; apply and store it locally
    ApplyAndWrite,
}

/// Destination for batches replayed in `ApplyAndWrite` mode
pub trait BatchStore: Send + Sync {
    fn store_batch(&self, data: Bytes) -> Result<LogCursor>;
}

/// Called once when the worker hits an unrecoverable fault
pub type FaultHandler = Arc<dyn Fn(&LogError) + Send + Sync>;
