//! Replica registry
//!
//! The set of slaves a master pushes to, keyed by address.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::log::LogChunk;

use super::{AckSet, NullTransport, ReplicaTransport};

/// A connected replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaInfo {
    pub addr: SocketAddr,

    /// Exclusive end of what the replica has acknowledged
    pub acked_log_id: u64,

    /// Pushes start once the log reaches this log_id
    pub send_log_point: u64,

    pub last_ack: Option<Instant>,
}

/// Connected replicas and their positions
pub struct ReplicaRegistry {
    replicas: RwLock<BTreeMap<SocketAddr, ReplicaInfo>>,
    transport: Arc<dyn ReplicaTransport>,
}

impl ReplicaRegistry {
    pub fn new(transport: Arc<dyn ReplicaTransport>) -> Self {
        Self {
            replicas: RwLock::new(BTreeMap::new()),
            transport,
        }
    }

    /// Registry with no network; pushes always succeed
    pub fn standalone() -> Self {
        Self::new(Arc::new(NullTransport))
    }

    /// Register `addr`, or move its send point if already known
    ///
    /// Returns true for a new replica.
    pub fn add(&self, addr: SocketAddr, send_log_point: u64) -> bool {
        let mut replicas = self.replicas.write();
        match replicas.get_mut(&addr) {
            Some(info) => {
                info.send_log_point = send_log_point;
                debug!(%addr, send_log_point, "replica re-registered");
                false
            }
            None => {
                replicas.insert(
                    addr,
                    ReplicaInfo {
                        addr,
                        acked_log_id: 0,
                        send_log_point,
                        last_ack: None,
                    },
                );
                info!(%addr, send_log_point, "replica added");
                true
            }
        }
    }

    pub fn remove(&self, addr: &SocketAddr) -> Option<ReplicaInfo> {
        let removed = self.replicas.write().remove(addr);
        if removed.is_some() {
            info!(%addr, "replica removed");
        }
        removed
    }

    pub fn set_send_log_point(&self, addr: &SocketAddr, log_id: u64) -> Result<()> {
        let mut replicas = self.replicas.write();
        let info = replicas.get_mut(addr).ok_or(LogError::EntryNotFound)?;
        info.send_log_point = log_id;
        Ok(())
    }

    pub fn get(&self, addr: &SocketAddr) -> Option<ReplicaInfo> {
        self.replicas.read().get(addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.replicas.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.read().is_empty()
    }

    pub fn replicas(&self) -> Vec<ReplicaInfo> {
        self.replicas.read().values().cloned().collect()
    }

    pub fn acked_log_id(&self, addr: &SocketAddr) -> Option<u64> {
        self.replicas.read().get(addr).map(|r| r.acked_log_id)
    }

    /// Lowest acknowledged position over all replicas
    pub fn min_acked_log_id(&self) -> Option<u64> {
        self.replicas.read().values().map(|r| r.acked_log_id).min()
    }

    /// Push `chunk` to every replica whose send point it has reached
    ///
    /// Replicas that fail to acknowledge are dropped from the registry.
    pub fn push_log(&self, chunk: &LogChunk) -> Result<AckSet> {
        let targets: Vec<SocketAddr> = self
            .replicas
            .read()
            .values()
            .filter(|r| r.send_log_point <= chunk.start_id)
            .map(|r| r.addr)
            .collect();
        if targets.is_empty() {
            return Ok(AckSet::default());
        }

        let acks = self.transport.push_to_replicas(&targets, chunk)?;

        let mut replicas = self.replicas.write();
        let now = Instant::now();
        for addr in &acks.acked {
            if let Some(info) = replicas.get_mut(addr) {
                info.acked_log_id = info.acked_log_id.max(chunk.end_id);
                info.last_ack = Some(now);
            }
        }
        for addr in &acks.failed {
            if replicas.remove(addr).is_some() {
                warn!(%addr, start_id = chunk.start_id, "replica failed to ack, removed");
            }
        }
        Ok(acks)
    }
}
