//! Replication Module
//!
//! The master's view of its replicas and the seams to the network layer.
//!
//! ## Responsibilities
//! - Track connected replicas and their acknowledged positions
//! - Push every written batch to the replicas through a transport
//! - Let a slave pull log from its master when the cache has nothing

mod registry;
mod transport;

pub use registry::{ReplicaInfo, ReplicaRegistry};
pub use transport::{AckSet, MasterClient, NoUpstream, NullTransport, ReplicaTransport};
