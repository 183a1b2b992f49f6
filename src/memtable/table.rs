//! MemTable implementation
//!
//! BTreeMap-based memtable with RwLock for concurrency.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::trace;

use crate::engine::{ApplyError, StorageEngine};
use crate::log::{LogCommand, LogEntry};

use super::{MemTableEntry, Mutation};

/// In-memory table built from the commit log
pub struct MemTable {
    data: RwLock<BTreeMap<Vec<u8>, MemTableEntry>>,

    /// Approximate size in bytes
    size: AtomicUsize,

    /// Exclusive end of the applied log
    applied_log_id: AtomicU64,

    persisted_file_id: Mutex<Option<u64>>,
    checkpoint_file_id: Mutex<Option<u64>>,
}

impl MemTable {
    /// Create a new empty MemTable
    pub fn new() -> Self {
        Self {
            data: RwLock::new(BTreeMap::new()),
            size: AtomicUsize::new(0),
            applied_log_id: AtomicU64::new(0),
            persisted_file_id: Mutex::new(None),
            checkpoint_file_id: Mutex::new(None),
        }
    }

    /// Get a value by key (read lock)
    pub fn get(&self, key: &[u8]) -> Option<MemTableEntry> {
        self.data.read().get(key).cloned()
    }

    /// Live value of `key`, if any
    pub fn get_value(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.get(key)? {
            MemTableEntry::Value(v) => Some(v),
            MemTableEntry::Tombstone => None,
        }
    }

    /// Apply one mutation (write lock)
    pub fn apply_mutation(&self, mutation: Mutation) {
        let mut data = self.data.write();
        let (key, entry) = match mutation {
            Mutation::Put { key, value } => (key, MemTableEntry::Value(value)),
            Mutation::Delete { key } => (key, MemTableEntry::Tombstone),
        };
        let key_len = key.len();
        let value_len = entry_len(&entry);
        match data.insert(key, entry) {
            Some(old) => {
                self.size.fetch_add(value_len, Ordering::Relaxed);
                self.size.fetch_sub(entry_len(&old), Ordering::Relaxed);
            }
            None => {
                self.size.fetch_add(key_len + value_len, Ordering::Relaxed);
            }
        }
    }

    /// Get approximate size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    /// Number of keys, tombstones included
    pub fn entry_count(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Exclusive end of the applied log
    pub fn applied_log_id(&self) -> u64 {
        self.applied_log_id.load(Ordering::Acquire)
    }

    /// Snapshot of every live key/value, in key order
    pub fn live_entries(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        self.data
            .read()
            .iter()
            .filter_map(|(k, e)| match e {
                MemTableEntry::Value(v) => Some((k.clone(), v.clone())),
                MemTableEntry::Tombstone => None,
            })
            .collect()
    }

    /// Record that log files up to `file_id` are durable elsewhere
    pub fn set_max_persisted_log_file_id(&self, file_id: u64) {
        *self.persisted_file_id.lock() = Some(file_id);
    }

    pub fn set_last_major_checkpoint_log_file_id(&self, file_id: u64) {
        *self.checkpoint_file_id.lock() = Some(file_id);
    }
}

impl Default for MemTable {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageEngine for MemTable {
    fn get_max_persisted_log_file_id(&self) -> Option<u64> {
        *self.persisted_file_id.lock()
    }

    fn get_last_major_checkpoint_log_file_id(&self) -> Option<u64> {
        *self.checkpoint_file_id.lock()
    }

    fn apply(&self, entry: &LogEntry) -> Result<(), ApplyError> {
        // Re-delivered entries are skipped
        if entry.sequence < self.applied_log_id() {
            return Ok(());
        }
        if entry.command == LogCommand::Data {
            let mutation = Mutation::decode(&entry.payload)
                .map_err(|e| ApplyError::new(format!("log_id {}: {}", entry.sequence, e)))?;
            trace!(log_id = entry.sequence, key_len = mutation.key().len(), "applying mutation");
            self.apply_mutation(mutation);
        }
        self.applied_log_id
            .fetch_max(entry.sequence + 1, Ordering::AcqRel);
        Ok(())
    }
}

fn entry_len(entry: &MemTableEntry) -> usize {
    match entry {
        MemTableEntry::Value(v) => v.len(),
        MemTableEntry::Tombstone => 0,
    }
}
