//! Cache Module
//!
//! Serves recent log ranges from memory, falling back to disk.
//!
//! ## Responsibilities
//! - Hold the most recent batches in a bounded ring indexed by log_id
//! - Serve slave fetches and the replay source without disk I/O
//! - Fall back to positioned disk reads once a range is evicted

mod cached_reader;
mod recent;

pub use cached_reader::CachedLogReader;
pub use recent::RecentLogCache;
