//! # commitlog
//!
//! The commit log of a replicated update server:
//! - Append-only, numbered log files with checksummed, aligned batches
//! - Push of every written batch to replicas
//! - Recent log cache serving slaves without disk I/O
//! - Asynchronous replay into the storage engine with waitable watermarks
//! - Master/slave role state machine with fatal handling of divergence
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        LogManager                            │
//! │       (write_log / slave_receive_log / replay_log / fetch)   │
//! └──────┬──────────────────────┬───────────────────────┬───────┘
//!        │                      │                       │
//!        ▼                      ▼                       ▼
//!  ┌───────────┐         ┌─────────────┐         ┌─────────────┐
//!  │ LogWriter │────────►│ RecentLog   │────────►│ ReplayWorker│
//!  │ (append)  │  hook   │ Cache (ring)│ source  │ (threads)   │
//!  └─────┬─────┘         └─────────────┘         └──────┬──────┘
//!        │                                              │
//!        ▼                                              ▼
//!  ┌───────────┐                                 ┌─────────────┐
//!  │ Log files │                                 │StorageEngine│
//!  │ + replicas│                                 │  (apply)    │
//!  └───────────┘                                 └─────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod log;
pub mod cache;
pub mod replay;
pub mod replication;
pub mod role;
pub mod engine;
pub mod memtable;
pub mod manager;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LogError, Result};
pub use config::{Config, LogSyncStrategy};
pub use manager::{LogManager, WaitSync};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of commitlog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
