//! Tests for the replay worker
//!
//! These tests verify:
//! - Batches are applied in log_id order, every entry exactly once
//! - Submit validates continuity before queueing
//! - ApplyAndWrite batches reach the batch store
//! - An apply failure stops the pipeline and fires the fault handler once
//! - Watermark waits, wakeups and close

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bytes::Bytes;
use commitlog::engine::{ApplyError, StorageEngine};
use commitlog::log::{parse_log_buffer, LogBatch, LogCommand, LogCursor, LogEntry};
use commitlog::replay::{BatchStore, FaultHandler, ReplayMode, ReplayProgress, ReplayWorker, Watermark};
use commitlog::{LogError, Result};
use parking_lot::Mutex;

// =============================================================================
// Helper Functions
// =============================================================================

const WAIT: Duration = Duration::from_secs(5);

/// Records every applied sequence; optionally fails at one
#[derive(Default)]
struct RecordingEngine {
    applied: Mutex<Vec<(u64, LogCommand)>>,
    fail_at: Option<u64>,
}

impl StorageEngine for RecordingEngine {
    fn get_max_persisted_log_file_id(&self) -> Option<u64> {
        None
    }

    fn get_last_major_checkpoint_log_file_id(&self) -> Option<u64> {
        None
    }

    fn apply(&self, entry: &LogEntry) -> std::result::Result<(), ApplyError> {
        if self.fail_at == Some(entry.sequence) {
            return Err(ApplyError::new("engine rejected entry"));
        }
        self.applied.lock().push((entry.sequence, entry.command));
        Ok(())
    }
}

/// Stores batches in memory, validating continuity like a log writer would
struct RecordingStore {
    cursor: Mutex<LogCursor>,
    batches: Mutex<Vec<Bytes>>,
}

impl RecordingStore {
    fn new(start: LogCursor) -> Self {
        Self {
            cursor: Mutex::new(start),
            batches: Mutex::new(Vec::new()),
        }
    }
}

impl BatchStore for RecordingStore {
    fn store_batch(&self, data: Bytes) -> Result<LogCursor> {
        let mut cursor = self.cursor.lock();
        let end = parse_log_buffer(&data, &cursor)?;
        *cursor = end;
        self.batches.lock().push(data);
        Ok(end)
    }
}

struct Fixture {
    worker: ReplayWorker,
    engine: Arc<RecordingEngine>,
    store: Arc<RecordingStore>,
    faults: Arc<AtomicUsize>,
}

fn fixture(fail_at: Option<u64>) -> Fixture {
    let engine = Arc::new(RecordingEngine {
        applied: Mutex::new(Vec::new()),
        fail_at,
    });
    let store = Arc::new(RecordingStore::new(LogCursor::new(1, 1, 0)));
    let faults = Arc::new(AtomicUsize::new(0));
    let counter = faults.clone();
    let on_fault: FaultHandler = Arc::new(move |_e: &LogError| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let worker = ReplayWorker::new(
        Arc::new(ReplayProgress::new()),
        engine.clone(),
        store.clone(),
        4,
        on_fault,
    );
    worker.start().unwrap();
    worker.start_log(LogCursor::new(1, 1, 0)).unwrap();

    Fixture {
        worker,
        engine,
        store,
        faults,
    }
}

/// One aligned batch with `count` DATA entries
fn batch(start_id: u64, count: usize) -> (Bytes, u64) {
    let mut batch = LogBatch::new(start_id);
    for i in 0..count {
        batch.push_data(format!("v{}", i).as_bytes());
    }
    let (buf, end_id) = batch.finish();
    (Bytes::from(buf), end_id)
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_start_twice_fails() {
    let f = fixture(None);
    assert!(matches!(f.worker.start(), Err(LogError::AlreadyInitialized)));
}

#[test]
fn test_submit_before_start_fails() {
    let worker = ReplayWorker::new(
        Arc::new(ReplayProgress::new()),
        Arc::new(RecordingEngine::default()),
        Arc::new(RecordingStore::new(LogCursor::new(1, 1, 0))),
        4,
        Arc::new(|_e: &LogError| {}),
    );
    let (data, _) = batch(1, 1);
    assert!(matches!(
        worker.submit_batch(data.clone(), ReplayMode::Replay),
        Err(LogError::NotInitialized)
    ));

    // Started but never positioned
    worker.start().unwrap();
    assert!(matches!(
        worker.submit_batch(data, ReplayMode::Replay),
        Err(LogError::NotInitialized)
    ));
}

#[test]
fn test_start_log_rejects_invalid_cursor() {
    let f = fixture(None);
    assert!(matches!(
        f.worker.start_log(LogCursor::default()),
        Err(LogError::InvalidArgument(_))
    ));
}

#[test]
fn test_start_log_positions_watermarks() {
    let f = fixture(None);
    f.worker.start_log(LogCursor::new(3, 40, 1024)).unwrap();

    assert_eq!(f.worker.get_next_submit_log_id(), 40);
    assert_eq!(f.worker.get_replayed_log_id(), 40);
    assert_eq!(f.worker.get_committed_log_id(), 40);
    assert_eq!(f.worker.get_flushed_log_id(), 40);
    assert!(f.worker.is_all_task_finished());
}

// =============================================================================
// Apply Tests
// =============================================================================

#[test]
fn test_batches_applied_in_order() {
    let f = fixture(None);

    let mut next = 1;
    for n in 1..=5 {
        let (data, end_id) = batch(next, n);
        assert_eq!(f.worker.submit_batch(data, ReplayMode::Replay).unwrap(), end_id);
        next = end_id;
    }

    assert_eq!(f.worker.wait_replayed_log_id(next, WAIT), next);
    assert_eq!(f.worker.wait_next_commit_log_id(next, WAIT), next);
    assert_eq!(f.worker.wait_next_flush_log_id(next, WAIT), next);

    let applied = f.engine.applied.lock();
    let sequences: Vec<u64> = applied.iter().map(|(s, _)| *s).collect();
    assert_eq!(sequences, (1..next).collect::<Vec<_>>());
    assert!(applied.iter().any(|(_, c)| *c == LogCommand::Nop));
    assert!(f.worker.is_all_task_finished());
}

#[test]
fn test_submit_rejects_discontinuous_batch() {
    let f = fixture(None);
    let (data, end_id) = batch(1, 1);
    f.worker.submit_batch(data, ReplayMode::Replay).unwrap();

    let (gap, _) = batch(end_id + 1, 1);
    let result = f.worker.submit_batch(gap, ReplayMode::Replay);
    assert!(matches!(
        result,
        Err(LogError::DiscontinuousLog { expected, .. }) if expected == end_id
    ));
    assert_eq!(f.worker.get_next_submit_log_id(), end_id);
}

#[test]
fn test_replay_mode_skips_store() {
    let f = fixture(None);
    let (data, end_id) = batch(1, 2);
    f.worker.submit_batch(data, ReplayMode::Replay).unwrap();

    assert_eq!(f.worker.wait_next_flush_log_id(end_id, WAIT), end_id);
    assert!(f.store.batches.lock().is_empty());
}

#[test]
fn test_apply_and_write_reaches_store() {
    let f = fixture(None);
    let (first, mid) = batch(1, 2);
    let (second, end_id) = batch(mid, 3);
    f.worker
        .submit_batch(first.clone(), ReplayMode::ApplyAndWrite)
        .unwrap();
    f.worker
        .submit_batch(second.clone(), ReplayMode::ApplyAndWrite)
        .unwrap();

    assert_eq!(f.worker.wait_next_flush_log_id(end_id, WAIT), end_id);
    assert_eq!(*f.store.batches.lock(), vec![first, second]);
    assert_eq!(f.store.cursor.lock().log_id, end_id);
}

#[test]
fn test_store_failure_is_a_fault() {
    let f = fixture(None);
    // Store expects log_id 1; the worker is repositioned past it
    f.worker.start_log(LogCursor::new(1, 10, 0)).unwrap();
    let (data, end_id) = batch(10, 1);
    f.worker
        .submit_batch(data, ReplayMode::ApplyAndWrite)
        .unwrap();

    f.worker.wait_next_flush_log_id(end_id, WAIT);
    let deadline = Instant::now() + WAIT;
    while f.worker.fault().is_none() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(f.worker.fault().is_some());
    assert_eq!(f.faults.load(Ordering::SeqCst), 1);
    assert!(f.worker.get_flushed_log_id() < end_id);
}

// =============================================================================
// Fault Tests
// =============================================================================

#[test]
fn test_apply_failure_stops_pipeline() {
    let f = fixture(Some(4));

    let (first, mid) = batch(1, 2); // [1, 4)
    let (second, after) = batch(mid, 2); // [4, 7)
    f.worker.submit_batch(first, ReplayMode::Replay).unwrap();
    f.worker.submit_batch(second, ReplayMode::Replay).unwrap();

    // The fault closes the watermarks, so this returns early
    let reached = f.worker.wait_replayed_log_id(after, WAIT);
    assert_eq!(reached, 4);

    let (log_id, reason) = f.worker.fault().unwrap();
    assert_eq!(log_id, 4);
    assert!(reason.contains("engine rejected entry"));
    assert_eq!(f.faults.load(Ordering::SeqCst), 1);

    // Nothing at or after the failing entry was applied
    let applied = f.engine.applied.lock().clone();
    assert!(applied.iter().all(|(s, _)| *s < 4));
    assert_eq!(f.worker.get_committed_log_id(), 4);

    let (third, _) = batch(after, 1);
    assert!(matches!(
        f.worker.submit_batch(third, ReplayMode::Replay),
        Err(LogError::Apply { log_id: 4, .. })
    ));
    assert_eq!(f.faults.load(Ordering::SeqCst), 1);
}

#[test]
fn test_shutdown_drains_queue() {
    let f = fixture(None);
    let mut next = 1;
    for _ in 0..10 {
        let (data, end_id) = batch(next, 1);
        f.worker.submit_batch(data, ReplayMode::Replay).unwrap();
        next = end_id;
    }
    f.worker.shutdown();

    assert_eq!(f.worker.get_replayed_log_id(), next);
    assert_eq!(f.engine.applied.lock().len() as u64, next - 1);

    let (data, _) = batch(next, 1);
    assert!(matches!(
        f.worker.submit_batch(data, ReplayMode::Replay),
        Err(LogError::NotInitialized)
    ));
}

#[test]
fn test_update_replay_cursor_moves_everything() {
    let f = fixture(None);
    f.worker.update_replay_cursor(LogCursor::new(2, 77, 4096));

    assert_eq!(f.worker.get_replay_cursor(), LogCursor::new(2, 77, 4096));
    assert_eq!(f.worker.get_replayed_log_id(), 77);
    assert_eq!(f.worker.get_flushed_log_id(), 77);

    // Older positions never move it back
    f.worker.update_replay_cursor(LogCursor::new(2, 50, 0));
    assert_eq!(f.worker.get_replay_cursor().log_id, 77);
    assert_eq!(f.worker.get_replayed_log_id(), 77);
}

// =============================================================================
// Watermark Tests
// =============================================================================

#[test]
fn test_watermark_is_monotonic() {
    let mark = Watermark::new(5);
    assert_eq!(mark.advance(10), 10);
    assert_eq!(mark.advance(7), 10);
    assert_eq!(mark.get(), 10);
}

#[test]
fn test_watermark_wait_times_out() {
    let mark = Watermark::new(1);
    let started = Instant::now();
    assert_eq!(mark.wait_until(2, Duration::from_millis(50)), 1);
    assert!(started.elapsed() >= Duration::from_millis(50));
}

#[test]
fn test_watermark_wakes_waiter() {
    let mark = Arc::new(Watermark::new(0));
    let waiter = {
        let mark = mark.clone();
        thread::spawn(move || mark.wait_until(3, WAIT))
    };

    thread::sleep(Duration::from_millis(20));
    mark.advance(1);
    mark.advance(3);
    assert_eq!(waiter.join().unwrap(), 3);
}

#[test]
fn test_watermark_close_releases_waiters() {
    let mark = Arc::new(Watermark::new(0));
    let waiter = {
        let mark = mark.clone();
        thread::spawn(move || mark.wait_until(100, WAIT))
    };

    thread::sleep(Duration::from_millis(20));
    mark.close();
    assert_eq!(waiter.join().unwrap(), 0);
    assert!(mark.is_closed());
    assert_eq!(mark.wait_until(100, WAIT), 0);
}
