//! Tests for the replica registry
//!
//! These tests verify:
//! - Adding, re-adding and removing replicas
//! - Pushes only reach replicas whose send point the log has reached
//! - Acks raise the replica's position; failures drop the replica

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;

use commitlog::log::LogChunk;
use commitlog::replication::{AckSet, ReplicaRegistry, ReplicaTransport};
use commitlog::{LogError, Result};
use parking_lot::Mutex;

// =============================================================================
// Helper Functions
// =============================================================================

fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// Acks everyone except the addresses in `failing`
#[derive(Default)]
struct ScriptedTransport {
    failing: Mutex<HashSet<SocketAddr>>,
    pushes: Mutex<Vec<(Vec<SocketAddr>, u64, u64)>>,
}

impl ReplicaTransport for ScriptedTransport {
    fn push_to_replicas(&self, replicas: &[SocketAddr], chunk: &LogChunk) -> Result<AckSet> {
        self.pushes
            .lock()
            .push((replicas.to_vec(), chunk.start_id, chunk.end_id));
        let failing = self.failing.lock();
        let (failed, acked): (Vec<SocketAddr>, Vec<SocketAddr>) =
            replicas.iter().copied().partition(|a| failing.contains(a));
        Ok(AckSet { acked, failed })
    }
}

fn chunk(start_id: u64, end_id: u64) -> LogChunk {
    LogChunk::new(start_id, end_id, vec![0u8; 512])
}

// =============================================================================
// Membership Tests
// =============================================================================

#[test]
fn test_add_and_remove() {
    let registry = ReplicaRegistry::standalone();
    assert!(registry.is_empty());

    assert!(registry.add(addr(1), 10));
    assert!(registry.add(addr(2), 20));
    assert!(!registry.add(addr(1), 15));

    assert_eq!(registry.len(), 2);
    assert_eq!(registry.get(&addr(1)).unwrap().send_log_point, 15);

    assert!(registry.remove(&addr(1)).is_some());
    assert!(registry.remove(&addr(1)).is_none());
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_set_send_log_point_unknown() {
    let registry = ReplicaRegistry::standalone();
    assert!(matches!(
        registry.set_send_log_point(&addr(9), 1),
        Err(LogError::EntryNotFound)
    ));

    registry.add(addr(9), 1);
    registry.set_send_log_point(&addr(9), 40).unwrap();
    assert_eq!(registry.get(&addr(9)).unwrap().send_log_point, 40);
}

// =============================================================================
// Push Tests
// =============================================================================

#[test]
fn test_push_respects_send_point() {
    let transport = Arc::new(ScriptedTransport::default());
    let registry = ReplicaRegistry::new(transport.clone());
    registry.add(addr(1), 0);
    registry.add(addr(2), 50);

    let acks = registry.push_log(&chunk(10, 20)).unwrap();
    assert_eq!(acks.acked, vec![addr(1)]);

    registry.push_log(&chunk(50, 60)).unwrap();

    let pushes = transport.pushes.lock();
    assert_eq!(pushes.len(), 2);
    assert_eq!(pushes[0].0, vec![addr(1)]);
    assert_eq!(pushes[1].0, vec![addr(1), addr(2)]);
}

#[test]
fn test_push_with_no_target_skips_transport() {
    let transport = Arc::new(ScriptedTransport::default());
    let registry = ReplicaRegistry::new(transport.clone());
    registry.add(addr(1), 100);

    let acks = registry.push_log(&chunk(10, 20)).unwrap();
    assert_eq!(acks, AckSet::default());
    assert!(transport.pushes.lock().is_empty());
}

#[test]
fn test_acks_raise_positions() {
    let registry = ReplicaRegistry::new(Arc::new(ScriptedTransport::default()));
    registry.add(addr(1), 0);
    registry.add(addr(2), 15);

    registry.push_log(&chunk(10, 15)).unwrap();
    registry.push_log(&chunk(15, 30)).unwrap();

    assert_eq!(registry.acked_log_id(&addr(1)), Some(30));
    assert_eq!(registry.acked_log_id(&addr(2)), Some(30));
    assert!(registry.get(&addr(1)).unwrap().last_ack.is_some());
    assert_eq!(registry.min_acked_log_id(), Some(30));
}

#[test]
fn test_failed_replica_is_removed() {
    let transport = Arc::new(ScriptedTransport::default());
    transport.failing.lock().insert(addr(2));
    let registry = ReplicaRegistry::new(transport.clone());
    registry.add(addr(1), 0);
    registry.add(addr(2), 0);

    let acks = registry.push_log(&chunk(1, 5)).unwrap();
    assert_eq!(acks.failed, vec![addr(2)]);
    assert_eq!(registry.len(), 1);
    assert!(registry.get(&addr(2)).is_none());
    assert_eq!(registry.min_acked_log_id(), Some(5));
}

#[test]
fn test_standalone_acks_everyone() {
    let registry = ReplicaRegistry::standalone();
    registry.add(addr(1), 0);

    let acks = registry.push_log(&chunk(1, 3)).unwrap();
    assert_eq!(acks.acked, vec![addr(1)]);
    assert_eq!(registry.replicas()[0].acked_log_id, 3);
}
