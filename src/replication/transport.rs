//! Network seams
//!
//! The log manager never opens a socket itself. Masters push through a
//! `ReplicaTransport`; slaves pull through a `MasterClient`.

use std::net::SocketAddr;

use crate::error::{LogError, Result};
use crate::log::{LogChunk, LogCursor};

/// Outcome of one push
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AckSet {
    pub acked: Vec<SocketAddr>,
    pub failed: Vec<SocketAddr>,
}

/// Sends written batches to replicas
pub trait ReplicaTransport: Send + Sync {
    fn push_to_replicas(&self, replicas: &[SocketAddr], chunk: &LogChunk) -> Result<AckSet>;
}

/// Transport for a node without a network layer; every push is acked
#[derive(Debug, Default, Clone, Copy)]
pub struct NullTransport;

impl ReplicaTransport for NullTransport {
    fn push_to_replicas(&self, replicas: &[SocketAddr], _chunk: &LogChunk) -> Result<AckSet> {
        Ok(AckSet {
            acked: replicas.to_vec(),
            failed: Vec::new(),
        })
    }
}

/// A slave's connection to its master
pub trait MasterClient: Send + Sync {
    /// Fill in where replay should start
    ///
    /// `NeedRetry` while the master cannot tell yet.
    fn fill_start_cursor(&self, cursor: &mut LogCursor) -> Result<()>;

    /// Whole batches from `cursor.log_id`; an empty chunk when none
    fn pull_from_master(&self, cursor: &LogCursor, max_len: usize) -> Result<LogChunk>;

    /// Whether the master streams log continuously
    fn is_using_lsync(&self) -> bool {
        false
    }
}

/// Client for a node with no master to pull from
#[derive(Debug, Default, Clone, Copy)]
pub struct NoUpstream;

impl MasterClient for NoUpstream {
    fn fill_start_cursor(&self, _cursor: &mut LogCursor) -> Result<()> {
        Err(LogError::NeedRetry)
    }

    fn pull_from_master(&self, cursor: &LogCursor, _max_len: usize) -> Result<LogChunk> {
        Ok(LogChunk::new(cursor.log_id, cursor.log_id, Vec::new()))
    }
}
