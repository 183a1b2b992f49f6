//! Role state machine
//!
//! A node is designated master or slave at two levels: within its cluster
//! and within the local replica group. Independently it moves through the
//! lifecycle states below.
//!
//! ```text
//!   Init   → any
//!   Slave  → Master | Active | Fatal | Stop
//!   Master → Slave  | Active | Fatal | Stop
//!   Active → Slave  | Master | Fatal | Stop
//!   Fatal  → Stop
//! ```

use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use crate::error::{LogError, Result};

/// Designation within the cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClusterRole {
    Master,
    Slave,
}

/// Designation within the local replica group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalRole {
    Master,
    Slave,
}

/// Cluster × local designation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeRole {
    pub cluster: ClusterRole,
    pub local: LocalRole,
}

impl NodeRole {
    pub fn new(cluster: ClusterRole, local: LocalRole) -> Self {
        Self { cluster, local }
    }

    /// The one node that accepts writes
    pub fn is_master_master(&self) -> bool {
        self.cluster == ClusterRole::Master && self.local == LocalRole::Master
    }

    /// Head of a slave cluster; forwards what it stores to its own replicas
    pub fn is_slave_master(&self) -> bool {
        self.cluster == ClusterRole::Slave && self.local == LocalRole::Master
    }

    pub fn is_local_master(&self) -> bool {
        self.local == LocalRole::Master
    }
}

impl Default for NodeRole {
    fn default() -> Self {
        Self::new(ClusterRole::Slave, LocalRole::Slave)
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleState {
    Init,
    Slave,
    Master,

    /// Replay has caught up with the master
    Active,

    /// Unrecoverable divergence; only `Stop` follows
    Fatal,
    Stop,
}

impl RoleState {
    /// Whether `self → to` is allowed
    pub fn can_transition_to(self, to: RoleState) -> bool {
        use RoleState::*;
        if self == to {
            return true;
        }
        match self {
            Init => true,
            Slave => matches!(to, Master | Active | Fatal | Stop),
            Master => matches!(to, Slave | Active | Fatal | Stop),
            Active => matches!(to, Slave | Master | Fatal | Stop),
            Fatal => to == Stop,
            Stop => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, RoleState::Fatal | RoleState::Stop)
    }
}

impl fmt::Display for RoleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoleState::Init => "INIT",
            RoleState::Slave => "SLAVE",
            RoleState::Master => "MASTER",
            RoleState::Active => "ACTIVE",
            RoleState::Fatal => "FATAL",
            RoleState::Stop => "STOP",
        };
        f.write_str(name)
    }
}

/// Snapshot of role and state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeStatus {
    pub role: NodeRole,
    pub state: RoleState,
}

/// Invoked once when the node goes FATAL; the server binary exits on it
pub type ShutdownHook = Arc<dyn Fn(&str) + Send + Sync>;

/// Validated role and state, shared with the surrounding server
pub struct RoleStateMachine {
    status: RwLock<NodeStatus>,
    shutdown_hook: Mutex<Option<ShutdownHook>>,
    fatal_reason: Mutex<Option<String>>,
}

impl RoleStateMachine {
    pub fn new(role: NodeRole) -> Self {
        Self {
            status: RwLock::new(NodeStatus {
                role,
                state: RoleState::Init,
            }),
            shutdown_hook: Mutex::new(None),
            fatal_reason: Mutex::new(None),
        }
    }

    pub fn with_shutdown_hook(self, hook: ShutdownHook) -> Self {
        *self.shutdown_hook.lock() = Some(hook);
        self
    }

    pub fn set_shutdown_hook(&self, hook: ShutdownHook) {
        *self.shutdown_hook.lock() = Some(hook);
    }

    pub fn status(&self) -> NodeStatus {
        *self.status.read()
    }

    pub fn state(&self) -> RoleState {
        self.status.read().state
    }

    pub fn role(&self) -> NodeRole {
        self.status.read().role
    }

    pub fn is_master_master(&self) -> bool {
        self.role().is_master_master()
    }

    pub fn is_slave_master(&self) -> bool {
        self.role().is_slave_master()
    }

    /// Move to `to`, or fail with `InvalidTransition`
    pub fn transition(&self, to: RoleState) -> Result<()> {
        let mut status = self.status.write();
        let from = status.state;
        if !from.can_transition_to(to) {
            return Err(LogError::InvalidTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if from != to {
            status.state = to;
            info!(%from, %to, "role state changed");
        }
        Ok(())
    }

    /// Change the designation; terminal states refuse
    pub fn set_role(&self, role: NodeRole) -> Result<()> {
        let mut status = self.status.write();
        if status.state.is_terminal() {
            return Err(LogError::InvalidTransition {
                from: status.state.to_string(),
                to: format!("{:?}", role),
            });
        }
        if status.role != role {
            info!(from = ?status.role, to = ?role, "node role changed");
            status.role = role;
        }
        Ok(())
    }

    /// Go FATAL and fire the shutdown hook
    ///
    /// Only the first call has any effect. Returns false if the node was
    /// already FATAL or stopped.
    pub fn enter_fatal(&self, reason: &str) -> bool {
        {
            let mut status = self.status.write();
            if status.state.is_terminal() {
                return false;
            }
            status.state = RoleState::Fatal;
        }
        error!(reason, "log manager entering FATAL state");
        *self.fatal_reason.lock() = Some(reason.to_string());

        let hook = self.shutdown_hook.lock().clone();
        if let Some(hook) = hook {
            hook(reason);
        }
        true
    }

    pub fn stop(&self) {
        let mut status = self.status.write();
        if status.state != RoleState::Stop {
            info!(from = %status.state, "role state stopping");
            status.state = RoleState::Stop;
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.state() == RoleState::Stop
    }

    pub fn is_fatal(&self) -> bool {
        self.state() == RoleState::Fatal
    }

    pub fn fatal_reason(&self) -> Option<String> {
        self.fatal_reason.lock().clone()
    }
}
