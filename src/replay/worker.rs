//! Replay Worker
//!
//! Applies submitted batches to the storage engine on a background thread
//! and, for batches that came from a master, stores them to the local log
//! on a second thread.
//!
//! ```text
//!  submit_batch ──┬──► apply channel ──► apply thread ──► StorageEngine::apply
//!                 │                         (replayed, committed)
//!                 └──► flush channel ──► flush thread ──► BatchStore
//!                                           (flushed)
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::engine::StorageEngine;
use crate::error::{LogError, Result};
use crate::log::{parse_log_buffer, EntryIter, LogCursor};

use super::{BatchStore, FaultHandler, ReplayMode, ReplayProgress};

/// A batch handed to the worker threads
#[derive(Clone)]
struct ReplayTask {
    data: Bytes,
    end: LogCursor,
    mode: ReplayMode,
}

struct Channels {
    apply: Sender<ReplayTask>,
    flush: Sender<ReplayTask>,
}

/// Shared between the worker handle and its threads
struct Shared {
    progress: Arc<ReplayProgress>,
    engine: Arc<dyn StorageEngine>,
    batch_store: Arc<dyn BatchStore>,
    on_fault: FaultHandler,
    faulted: AtomicBool,
    fault: Mutex<Option<(u64, String)>>,
}

impl Shared {
    /// Record the first fault, stop the pipeline and wake every waiter
    fn raise(&self, log_id: u64, reason: String) {
        if self.faulted.swap(true, Ordering::AcqRel) {
            return;
        }
        error!(log_id, reason = %reason, "replay fault");
        *self.fault.lock() = Some((log_id, reason.clone()));
        (self.on_fault)(&LogError::Apply { log_id, reason });
        self.progress.close();
    }

    fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }
}

/// Asynchronous apply pipeline
pub struct ReplayWorker {
    shared: Arc<Shared>,
    queue_depth: usize,
    channels: Mutex<Option<Channels>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ReplayWorker {
    pub fn new(
        progress: Arc<ReplayProgress>,
        engine: Arc<dyn StorageEngine>,
        batch_store: Arc<dyn BatchStore>,
        queue_depth: usize,
        on_fault: FaultHandler,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                progress,
                engine,
                batch_store,
                on_fault,
                faulted: AtomicBool::new(false),
                fault: Mutex::new(None),
            }),
            queue_depth,
            channels: Mutex::new(None),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawn the apply and flush threads
    pub fn start(&self) -> Result<()> {
        let mut channels = self.channels.lock();
        if channels.is_some() {
            return Err(LogError::AlreadyInitialized);
        }

        let (apply_tx, apply_rx) = bounded(self.queue_depth);
        let (flush_tx, flush_rx) = bounded(self.queue_depth);

        let apply_shared = self.shared.clone();
        let apply = thread::Builder::new()
            .name("replay-apply".to_string())
            .spawn(move || apply_thread(apply_shared, apply_rx))?;

        let flush_shared = self.shared.clone();
        let flush = thread::Builder::new()
            .name("replay-flush".to_string())
            .spawn(move || flush_thread(flush_shared, flush_rx))?;

        *channels = Some(Channels {
            apply: apply_tx,
            flush: flush_tx,
        });
        self.handles.lock().extend([apply, flush]);

        info!(queue_depth = self.queue_depth, "replay worker started");
        Ok(())
    }

    /// Position the next-submit cursor and all watermarks at `cursor`
    pub fn start_log(&self, cursor: LogCursor) -> Result<()> {
        if !cursor.is_valid() {
            return Err(LogError::InvalidArgument(format!("start_log({})", cursor)));
        }
        self.shared.progress.start_log(cursor);
        debug!(%cursor, "replay worker positioned");
        Ok(())
    }

    /// Validate `data` against the next-submit cursor and queue it
    ///
    /// Returns the log_id after the batch. Blocks while the queues are full.
    pub fn submit_batch(&self, data: Bytes, mode: ReplayMode) -> Result<u64> {
        if let Some((log_id, reason)) = self.fault() {
            return Err(LogError::Apply { log_id, reason });
        }

        let guard = self.channels.lock();
        let channels = guard.as_ref().ok_or(LogError::NotInitialized)?;

        let mut cursor = self.shared.progress.cursor_mut();
        if !cursor.is_valid() {
            return Err(LogError::NotInitialized);
        }
        let end = parse_log_buffer(&data, &cursor)?;

        let task = ReplayTask { data, end, mode };
        channels
            .apply
            .send(task.clone())
            .map_err(|_| LogError::Canceled)?;
        channels.flush.send(task).map_err(|_| LogError::Canceled)?;

        trace!(start_id = cursor.log_id, end_id = end.log_id, ?mode, "batch submitted");
        *cursor = end;
        Ok(end.log_id)
    }

    pub fn get_replayed_log_id(&self) -> u64 {
        self.shared.progress.replayed.get()
    }

    pub fn get_committed_log_id(&self) -> u64 {
        self.shared.progress.committed.get()
    }

    pub fn get_flushed_log_id(&self) -> u64 {
        self.shared.progress.flushed.get()
    }

    pub fn wait_replayed_log_id(&self, target: u64, timeout: Duration) -> u64 {
        self.shared.progress.replayed.wait_until(target, timeout)
    }

    pub fn wait_next_commit_log_id(&self, target: u64, timeout: Duration) -> u64 {
        self.shared.progress.committed.wait_until(target, timeout)
    }

    pub fn wait_next_flush_log_id(&self, target: u64, timeout: Duration) -> u64 {
        self.shared.progress.flushed.wait_until(target, timeout)
    }

    /// Master path: batches are applied inline by the writer
    pub fn update_replay_cursor(&self, cursor: LogCursor) {
        self.shared.progress.update_replay_cursor(cursor);
    }

    pub fn get_replay_cursor(&self) -> LogCursor {
        self.shared.progress.cursor()
    }

    pub fn get_next_submit_log_id(&self) -> u64 {
        self.shared.progress.cursor().log_id
    }

    /// Whether every submitted batch is both applied and flushed
    pub fn is_all_task_finished(&self) -> bool {
        let next = self.get_next_submit_log_id();
        self.get_committed_log_id() >= next && self.get_flushed_log_id() >= next
    }

    /// The first fault, as `(log_id, reason)`
    pub fn fault(&self) -> Option<(u64, String)> {
        self.shared.fault.lock().clone()
    }

    /// Close the queues and join the threads
    ///
    /// Batches already queued are still processed.
    pub fn shutdown(&self) {
        let channels = self.channels.lock().take();
        if channels.is_none() {
            return;
        }
        drop(channels);
        for handle in self.handles.lock().drain(..) {
            if handle.join().is_err() {
                error!("replay worker thread panicked");
            }
        }
        self.shared.progress.close();
        info!("replay worker stopped");
    }
}

impl Drop for ReplayWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// =============================================================================
// Worker Threads
// =============================================================================

fn apply_thread(shared: Arc<Shared>, rx: Receiver<ReplayTask>) {
    for task in rx {
        if shared.is_faulted() {
            continue;
        }
        for item in EntryIter::new(&task.data) {
            let entry = match item {
                Ok((entry, _)) => entry,
                Err(e) => {
                    let at = shared.progress.replayed.get();
                    shared.raise(at, e.to_string());
                    break;
                }
            };
            if let Err(e) = shared.engine.apply(&entry) {
                shared.raise(entry.sequence, e.to_string());
                break;
            }
            shared.progress.replayed.advance(entry.sequence + 1);
        }
        if !shared.is_faulted() {
            shared.progress.committed.advance(task.end.log_id);
        }
    }
    debug!("apply thread exiting");
}

fn flush_thread(shared: Arc<Shared>, rx: Receiver<ReplayTask>) {
    for task in rx {
        if shared.is_faulted() {
            continue;
        }
        if task.mode == ReplayMode::ApplyAndWrite {
            if let Err(e) = shared.batch_store.store_batch(task.data.clone()) {
                shared.raise(task.end.log_id, format!("store failed: {}", e));
                continue;
            }
        }
        shared.progress.flushed.advance(task.end.log_id);
    }
    debug!("flush thread exiting");
}
