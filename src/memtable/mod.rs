//! MemTable Module
//!
//! In-memory row store fed by the commit log.
//!
//! ## Responsibilities
//! - Decode DATA payloads into mutations and apply them
//! - Serve point reads to tests and the CLI
//! - Stand in for the storage engine wherever a real one is not wired
//!
//! ## Data Structure Choice
//! Using BTreeMap wrapped in RwLock:
//! - Ordered keys for deterministic dumps
//! - Deletes kept as tombstones so replays stay idempotent

use serde::{Deserialize, Serialize};

use crate::error::Result;

mod table;

pub use table::MemTable;

/// Entry stored in the MemTable
#[derive(Debug, Clone, PartialEq)]
pub enum MemTableEntry {
    /// A live value
    Value(Vec<u8>),

    /// A tombstone (deleted key)
    Tombstone,
}

/// Payload of a DATA entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mutation {
    Put { key: Vec<u8>, value: Vec<u8> },
    Delete { key: Vec<u8> },
}

impl Mutation {
    pub fn put(key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> Self {
        Mutation::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<Vec<u8>>) -> Self {
        Mutation::Delete { key: key.into() }
    }

    pub fn key(&self) -> &[u8] {
        match self {
            Mutation::Put { key, .. } | Mutation::Delete { key } => key,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}
