//! Log Manager
//!
//! Ties the writer, the recent log cache, the replay worker and the role
//! state machine together behind the operations the update server calls.
//!
//! ## Data Flow
//! ```text
//!  master:  write_log ──► LogWriter ──► disk ──► replicas
//!                              │
//!                              └─► MasterWriteHook ──► cache, replay cursor,
//!                                                      master_log_id
//!
//!  slave:   slave_receive_log ──► cache ──► replay_log ──► ReplayWorker
//!                                                  ├─► StorageEngine::apply
//!                                                  └─► LogWriter (store)
//! ```
//!
//! ## Concurrency Model
//! - One writer mutex orders every write, push and hook call
//! - The cache has a single producer: the hook on a master, the receive
//!   path on a slave
//! - `replay_log` is driven by one thread; `STOP` is checked every pass

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::cache::{CachedLogReader, RecentLogCache};
use crate::config::Config;
use crate::engine::StorageEngine;
use crate::error::{LogError, Result};
use crate::log::{
    get_local_max_log_cursor, parse_log_buffer, replay_local_files, scan_log_range, LogChunk,
    LogCursor, LogDirScanner, LogWriter, PositionedLogReader, ReplayPointFile, WriteHook,
    DIRECT_IO_ALIGN,
};
use crate::replay::{
    BatchStore, FaultHandler, ReplayLogSource, ReplayMode, ReplayProgress, ReplayWorker, Watermark,
};
use crate::replication::{MasterClient, ReplicaRegistry};
use crate::role::{RoleState, RoleStateMachine};

const LOCAL_REPLAY_IDLE: u8 = 0;
const LOCAL_REPLAY_RUNNING: u8 = 1;
const LOCAL_REPLAY_FINISHED: u8 = 2;
const LOCAL_REPLAY_FAILED: u8 = 3;

/// What `slave_receive_log` waits for after caching a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitSync {
    None,

    /// Applied by the replay worker
    Commit,

    /// Stored to the local log
    Flush,
}

/// Components built by `init`
struct Components {
    cache: Arc<RecentLogCache>,
    disk_reader: Arc<PositionedLogReader>,
    cached_reader: CachedLogReader,
    replay_point: ReplayPointFile,
    writer: Arc<LogWriter>,
    store: Arc<LocalLogStore>,
    worker: ReplayWorker,
    source: ReplayLogSource,
}

/// The commit log of one update server
pub struct LogManager {
    config: Config,
    engine: Arc<dyn StorageEngine>,
    replicas: Arc<ReplicaRegistry>,
    role: Arc<RoleStateMachine>,
    master: Arc<dyn MasterClient>,

    /// Highest log_id known to exist upstream (exclusive)
    master_log_id: Arc<Watermark>,
    progress: Arc<ReplayProgress>,

    components: OnceLock<Components>,

    /// Where writing and replay were started; log_id 0 until started
    start_cursor: Mutex<LogCursor>,

    /// Position after the last batch received from the master
    receive_cursor: Mutex<LogCursor>,

    local_replay: AtomicU8,
    local_max_log_id_when_start: Mutex<Option<u64>>,
    last_receive_time: Mutex<Option<Instant>>,
    stop: AtomicBool,
}

impl LogManager {
    pub fn new(
        config: Config,
        engine: Arc<dyn StorageEngine>,
        replicas: Arc<ReplicaRegistry>,
        role: Arc<RoleStateMachine>,
        master: Arc<dyn MasterClient>,
    ) -> Self {
        Self {
            config,
            engine,
            replicas,
            role,
            master,
            master_log_id: Arc::new(Watermark::new(0)),
            progress: Arc::new(ReplayProgress::new()),
            components: OnceLock::new(),
            start_cursor: Mutex::new(LogCursor::default()),
            receive_cursor: Mutex::new(LogCursor::default()),
            local_replay: AtomicU8::new(LOCAL_REPLAY_IDLE),
            local_max_log_id_when_start: Mutex::new(None),
            last_receive_time: Mutex::new(None),
            stop: AtomicBool::new(false),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Build every component and start the replay worker threads
    pub fn init(&self) -> Result<()> {
        if self.components.get().is_some() {
            return Err(LogError::AlreadyInitialized);
        }

        // Step 1: Validate and create the log directory
        self.config.validate()?;
        std::fs::create_dir_all(&self.config.log_dir)?;
        let dir = self.config.log_dir.as_path();

        // Step 2: Readers over memory and disk
        let cache = Arc::new(RecentLogCache::new(self.config.log_cache_capacity));
        let disk_reader = Arc::new(PositionedLogReader::new(dir));
        let cached_reader = CachedLogReader::new(cache.clone(), disk_reader.clone());
        let replay_point = ReplayPointFile::open(dir);

        // Step 3: Writer, reporting master writes back through the hook
        let hook: Arc<dyn WriteHook> = Arc::new(MasterWriteHook {
            cache: cache.clone(),
            progress: self.progress.clone(),
            master_log_id: self.master_log_id.clone(),
        });
        let writer = Arc::new(LogWriter::new(
            dir,
            self.config.log_file_max_size,
            self.config.sync_strategy,
            self.replicas.clone(),
            Some(hook),
        ));

        // Step 4: Replay worker storing into the same writer
        let store = Arc::new(LocalLogStore {
            writer: writer.clone(),
            role: self.role.clone(),
        });
        let role = self.role.clone();
        let on_fault: FaultHandler = Arc::new(move |e: &LogError| {
            role.enter_fatal(&e.to_string());
        });
        let worker = ReplayWorker::new(
            self.progress.clone(),
            self.engine.clone(),
            store.clone(),
            self.config.replay_queue_depth,
            on_fault,
        );
        let source = ReplayLogSource::new(cache.clone(), self.master.clone());

        let components = Components {
            cache,
            disk_reader,
            cached_reader,
            replay_point,
            writer,
            store,
            worker,
            source,
        };
        if self.components.set(components).is_err() {
            return Err(LogError::AlreadyInitialized);
        }

        // Step 5: Start the worker threads
        self.components()?.worker.start()?;

        info!(log_dir = %self.config.log_dir.display(), "log manager initialized");
        Ok(())
    }

    pub fn is_inited(&self) -> bool {
        self.components.get().is_some()
    }

    /// Stop replay, drain the worker and sync the log
    pub fn stop(&self) {
        if self.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        self.role.stop();
        self.master_log_id.close();
        if let Some(c) = self.components.get() {
            c.worker.shutdown();
            if let Err(e) = c.writer.sync() {
                warn!(error = %e, "failed to sync log on stop");
            }
        }
        info!("log manager stopped");
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn role(&self) -> &Arc<RoleStateMachine> {
        &self.role
    }

    pub fn replicas(&self) -> &Arc<ReplicaRegistry> {
        &self.replicas
    }

    // =========================================================================
    // Local Replay
    // =========================================================================

    /// Replay the local log files into the storage engine
    ///
    /// Runs at most once. Starts from the newest file the engine has made
    /// durable, else the replay point, else the oldest file on disk. On
    /// success writer and worker continue from where replay ended. Any
    /// failure moves the node to FATAL.
    pub fn replay_local_log(&self) -> Result<()> {
        let c = self.components()?;
        if self
            .local_replay
            .compare_exchange(
                LOCAL_REPLAY_IDLE,
                LOCAL_REPLAY_RUNNING,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            warn!("local log replay already started");
            return Ok(());
        }

        let result = self.replay_local_log_inner(c);
        match &result {
            Ok(()) => self.local_replay.store(LOCAL_REPLAY_FINISHED, Ordering::Release),
            Err(e) => {
                self.local_replay.store(LOCAL_REPLAY_FAILED, Ordering::Release);
                error!(error = %e, "local log replay failed");
                self.role.enter_fatal(&format!("local log replay failed: {}", e));
            }
        }
        result
    }

    fn replay_local_log_inner(&self, c: &Components) -> Result<()> {
        // Step 1: Anything replayed already?
        if c.worker.get_replayed_log_id() > 0 {
            warn!(
                replayed = c.worker.get_replayed_log_id(),
                "local log is already replayed"
            );
            return Ok(());
        }

        // Step 2: Pick the start file
        let start_file_id = match self.engine.get_max_persisted_log_file_id() {
            Some(id) => Some(id),
            None => match c.replay_point.read()? {
                Some(id) => Some(id),
                None => LogDirScanner::scan(&self.config.log_dir)?.min_file_id(),
            },
        };
        info!(start_file_id = ?start_file_id, "local replay start point");

        // Step 3: Replay, never past what the local log holds
        self.master_log_id.advance(self.get_max_log_seq_in_file()?);
        let mut end = LogCursor::default();
        if let Some(file_id) = start_file_id.filter(|id| *id > 0) {
            self.start_cursor.lock().file_id = file_id;
            end = replay_local_files(
                &c.disk_reader,
                &c.worker,
                LogCursor::at_file(file_id),
                self.config.replay_buffer_size,
                &self.stop,
            )?;
        }

        // Step 4: Nothing replayed; recover the end from what is on disk
        if !end.is_established() {
            if let Some(found) = get_local_max_log_cursor(&c.disk_reader)? {
                end = found;
            }
        }

        // Step 5: Continue writing and replaying from the end
        if end.is_established() {
            *self.local_max_log_id_when_start.lock() = Some(end.log_id);
            let mut start = self.start_cursor.lock();
            self.start_log_locked(c, &mut start, end)?;
            info!(%end, "log started after local replay");
        } else {
            warn!("no local log to replay");
        }
        Ok(())
    }

    /// Run `replay_local_log` on its own thread
    pub fn spawn_local_replay(self: &Arc<Self>) -> Result<JoinHandle<Result<()>>> {
        self.components()?;
        let this = self.clone();
        let handle = thread::Builder::new()
            .name("local-replay".to_string())
            .spawn(move || this.replay_local_log())?;
        Ok(handle)
    }

    pub fn is_log_replay_finished(&self) -> bool {
        self.local_replay.load(Ordering::Acquire) == LOCAL_REPLAY_FINISHED
    }

    // =========================================================================
    // Master Write Path
    // =========================================================================

    /// Start writing on promotion to master
    ///
    /// A no-op when local replay already started the log.
    pub fn start_log_for_master_write(&self) -> Result<()> {
        let c = self.components()?;
        let mut start = self.start_cursor.lock();
        if start.is_established() {
            info!(start = %*start, "log already started for master write");
            return Ok(());
        }
        if !self.config.allow_missing_log_file && start.file_id > 0 {
            error!(file_id = start.file_id, "log file missing");
            return Err(LogError::LogMissing(start.file_id));
        }

        let cursor = LogCursor::new(start.file_id.max(1), 1, 0);
        self.start_log_locked(c, &mut start, cursor)?;
        info!(%cursor, "log started for master write");
        Ok(())
    }

    /// Write `payloads` as one batch; local master only
    pub fn write_log<P: AsRef<[u8]>>(&self, payloads: &[P]) -> Result<(LogCursor, LogCursor)> {
        let c = self.components()?;
        if self.role.state().is_terminal() {
            return Err(LogError::Canceled);
        }
        if !self.role.role().is_local_master() {
            return Err(LogError::InvalidArgument(
                "write_log on a node that is not a local master".to_string(),
            ));
        }
        c.writer.append_entries(payloads)
    }

    /// Store a framed buffer from the master to the local log
    ///
    /// A slave-cluster local master also pushes it to its own replicas.
    pub fn write_as_slave(&self, data: Bytes) -> Result<LogCursor> {
        self.components()?.store.store_batch(data)
    }

    /// Rotate to the next log file
    pub fn switch_log_file(&self) -> Result<u64> {
        self.components()?.writer.switch_log_file()
    }

    // =========================================================================
    // Slave Receive / Fetch
    // =========================================================================

    /// Accept a batch pushed by the master
    ///
    /// The batch is cached for the replay loop and raises `master_log_id`.
    /// With a wait type, waits up to `wait` for the worker to commit or
    /// flush it; a timeout only logs a warning.
    pub fn slave_receive_log(&self, data: Bytes, wait: Duration, wait_sync: WaitSync) -> Result<()> {
        let c = self.components()?;
        if data.is_empty() {
            return Err(LogError::InvalidArgument("empty log buffer".to_string()));
        }

        // Step 1: Well-formed and, where the position is known, continuous
        let (start_id, end_id) = scan_log_range(&data)?;
        let mut receive = self.receive_cursor.lock();
        let base = if receive.is_valid() && receive.log_id == start_id {
            Some(*receive)
        } else {
            let replay = c.worker.get_replay_cursor();
            (replay.is_valid() && replay.log_id == start_id).then_some(replay)
        };
        let received_end = match base {
            Some(base) => Some(parse_log_buffer(&data, &base)?),
            None => None,
        };

        // Step 2: Cache it
        c.cache.append(start_id, end_id, data)?;
        *receive = received_end.unwrap_or_default();
        drop(receive);

        self.set_master_log_id(end_id);
        *self.last_receive_time.lock() = Some(Instant::now());
        debug!(start_id, end_id, "received log from master");

        // Step 3: Optionally wait for the worker
        if wait.is_zero() || wait_sync == WaitSync::None {
            return Ok(());
        }
        if self.role.state() != RoleState::Active {
            warn!(start_id, end_id, state = %self.role.state(), "wait for slave sync skipped: state not ACTIVE");
            return Ok(());
        }
        let reached = match wait_sync {
            WaitSync::Commit => c.worker.wait_next_commit_log_id(end_id, wait),
            WaitSync::Flush => c.worker.wait_next_flush_log_id(end_id, wait),
            WaitSync::None => end_id,
        };
        if reached < end_id {
            warn!(end_id, reached, ?wait_sync, ?wait, "wait for slave sync timed out");
        }
        Ok(())
    }

    /// Whole batches from `start_id` for a downstream slave
    ///
    /// Only already replayed log is served, from the cache when possible.
    pub fn get_log_for_slave_fetch(&self, start_id: u64) -> Result<LogChunk> {
        let c = self.components()?;
        let replayed = c.worker.get_replayed_log_id();
        if start_id == 0 || start_id >= replayed {
            debug!(start_id, replayed, "fetch not served");
            return Err(LogError::DataNotServed(format!(
                "start_id {} with replayed log_id {}",
                start_id, replayed
            )));
        }

        let chunk = c
            .cached_reader
            .get_log(start_id, self.config.fetch_buffer_size)?;
        if chunk.len() % DIRECT_IO_ALIGN != 0 {
            error!(start_id, len = chunk.len(), "fetched log is not aligned");
            return Err(LogError::AlignmentViolation {
                len: chunk.len(),
                align: DIRECT_IO_ALIGN,
            });
        }
        debug!(start_id, end_id = chunk.end_id, len = chunk.len(), "serving fetch");
        Ok(chunk)
    }

    pub fn fetch_log(&self, start_id: u64) -> Result<LogChunk> {
        self.get_log_for_slave_fetch(start_id)
    }

    // =========================================================================
    // Continuous Replay
    // =========================================================================

    /// One pass of the slave replay loop
    ///
    /// `NeedRetry`, `NeedWait` and `Canceled` tell the caller how to
    /// continue. Any other error moves the node to FATAL and is returned
    /// as `LogError::Fatal`.
    pub fn replay_log(&self) -> Result<()> {
        match self.replay_log_once() {
            Ok(()) => Ok(()),
            Err(e) if e.is_control_flow() => Err(e),
            Err(e) if self.stop.load(Ordering::Acquire) => {
                debug!(error = %e, "replay interrupted by stop");
                Err(LogError::Canceled)
            }
            Err(e) => {
                error!(error = %e, "replay failed, entering FATAL");
                self.role.enter_fatal(&format!("replay failed: {}", e));
                Err(LogError::Fatal(Box::new(e)))
            }
        }
    }

    fn replay_log_once(&self) -> Result<()> {
        let c = self.components()?;

        // Step 1: Can we replay at all?
        match self.role.state() {
            RoleState::Stop => return Err(LogError::Canceled),
            RoleState::Fatal => return Err(LogError::NeedRetry),
            _ => {}
        }
        if !self.is_log_replay_finished() {
            return Err(LogError::NeedRetry);
        }

        // Step 2: Establish the start position
        match self.start_log_for_replay(c) {
            Ok(()) => {}
            Err(LogError::NeedRetry) => return Err(LogError::NeedWait),
            Err(e) => return Err(e),
        }

        // Step 3: Anything new?
        if !c.source.is_using_lsync()
            && self.master_log_id.get() <= c.worker.get_next_submit_log_id()
        {
            return Err(LogError::NeedRetry);
        }

        // Step 4: Fetch the next chunk
        let cursor = c.worker.get_replay_cursor();
        let chunk = match c.source.get_log(&cursor, self.config.replay_buffer_size) {
            Ok(chunk) => chunk,
            Err(LogError::DataNotServed(_)) => return Err(LogError::NeedWait),
            Err(e) => return Err(e),
        };
        if chunk.end_id > self.master_log_id.get() {
            self.set_master_log_id(chunk.end_id);
        }

        // Step 5: Submit
        let end_id = chunk.end_id;
        let fetched = !chunk.is_empty();
        if fetched {
            self.replay_and_write_log(c.worker.get_replayed_log_id(), end_id, chunk.data)?;
        }

        // Step 6: Caught up?
        self.activate_if_caught_up(c)?;
        if fetched {
            Ok(())
        } else {
            Err(LogError::NeedRetry)
        }
    }

    /// Apply `data` and store it to the local log
    ///
    /// `start_id` and `end_id` are informational; the buffer is validated
    /// against the worker's own cursor.
    pub fn replay_and_write_log(&self, start_id: u64, end_id: u64, data: Bytes) -> Result<()> {
        let c = self.components()?;
        if data.is_empty() {
            return Ok(());
        }
        if data.len() % DIRECT_IO_ALIGN != 0 {
            error!(start_id, end_id, len = data.len(), "replay buffer is not aligned");
            return Err(LogError::AlignmentViolation {
                len: data.len(),
                align: DIRECT_IO_ALIGN,
            });
        }
        c.worker.submit_batch(data, ReplayMode::ApplyAndWrite)?;
        Ok(())
    }

    /// Drive `replay_log` until stopped or fatal
    pub fn run_replay_loop(&self) -> Result<()> {
        let retry_wait = Duration::from_millis(self.config.replay_retry_wait_ms);
        let new_log_wait = Duration::from_millis(self.config.replay_wait_timeout_ms);
        info!("replay loop started");

        loop {
            if self.stop.load(Ordering::Acquire) {
                break;
            }
            match self.replay_log() {
                Ok(()) => {}
                Err(LogError::Canceled) => break,
                Err(LogError::NeedRetry) => {
                    if let Some(e) = self.fatal_error() {
                        return Err(e);
                    }
                    thread::sleep(retry_wait);
                }
                Err(LogError::NeedWait) => {
                    if self.wait_new_log_to_replay(new_log_wait).is_none() {
                        thread::sleep(retry_wait);
                    }
                }
                Err(e) => return Err(e),
            }
        }

        info!("replay loop exited");
        Ok(())
    }

    fn fatal_error(&self) -> Option<LogError> {
        if !self.role.is_fatal() {
            return None;
        }
        let cause = match self.components.get().and_then(|c| c.worker.fault()) {
            Some((log_id, reason)) => LogError::Apply { log_id, reason },
            None => LogError::CorruptEntry(self.role.fatal_reason().unwrap_or_default()),
        };
        Some(LogError::Fatal(Box::new(cause)))
    }

    fn start_log_for_replay(&self, c: &Components) -> Result<()> {
        let mut start = self.start_cursor.lock();
        if start.is_established() {
            return Ok(());
        }

        let mut cursor = *start;
        self.fill_start_cursor(c, &mut cursor)?;
        if !cursor.is_established() {
            return Err(LogError::NeedRetry);
        }
        if !cursor.is_valid() {
            return Err(LogError::InvalidArgument(format!(
                "master gave start cursor {}",
                cursor
            )));
        }

        self.start_log_locked(c, &mut start, cursor)?;
        info!(%cursor, "log started for replay");
        Ok(())
    }

    fn fill_start_cursor(&self, c: &Components, cursor: &mut LogCursor) -> Result<()> {
        c.source.fill_start_cursor(cursor)
    }

    /// Position writer and worker together
    fn start_log_locked(&self, c: &Components, start: &mut LogCursor, cursor: LogCursor) -> Result<()> {
        if !c.writer.is_started() {
            c.writer.start_log(cursor)?;
        }
        self.master_log_id.advance(cursor.log_id);
        c.worker.start_log(cursor)?;
        *self.receive_cursor.lock() = cursor;
        *start = cursor;
        Ok(())
    }

    // =========================================================================
    // Positions and Watermarks
    // =========================================================================

    /// Raise `master_log_id`; lower values are logged and ignored
    pub fn set_master_log_id(&self, log_id: u64) {
        let current = self.master_log_id.get();
        if log_id < current {
            warn!(log_id, current, "master_log_id moving backwards ignored");
        }
        self.master_log_id.advance(log_id);
    }

    pub fn get_master_log_id(&self) -> u64 {
        self.master_log_id.get()
    }

    pub fn get_replayed_log_id(&self) -> Result<u64> {
        Ok(self.components()?.worker.get_replayed_log_id())
    }

    pub fn get_replay_cursor(&self) -> Result<LogCursor> {
        Ok(self.components()?.worker.get_replay_cursor())
    }

    /// Position after the last written entry
    pub fn get_write_cursor(&self) -> Result<LogCursor> {
        Ok(self.components()?.writer.cursor())
    }

    pub fn last_receive_log_time(&self) -> Option<Instant> {
        *self.last_receive_time.lock()
    }

    /// Default start point for a new slave
    ///
    /// An empty cursor starts at the file of the last major checkpoint, or
    /// at the oldest file still on disk; the log_id is then filled from
    /// that file when it has one.
    pub fn fill_log_cursor(&self, cursor: &mut LogCursor) -> Result<()> {
        let c = self.components()?;
        if cursor.log_id == 0 && cursor.file_id == 0 {
            let file_id = match self.engine.get_last_major_checkpoint_log_file_id() {
                Some(file_id) if file_id > 0 => file_id,
                _ => LogDirScanner::scan(c.disk_reader.dir())?
                    .min_file_id()
                    .unwrap_or(0),
            };
            cursor.file_id = file_id.max(1);
        }
        if cursor.log_id == 0 && cursor.file_id > 0 {
            match c.disk_reader.get_first_log_id(cursor.file_id) {
                Ok(log_id) => cursor.log_id = log_id,
                Err(LogError::EntryNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        debug!(%cursor, "filled log cursor for slave");
        Ok(())
    }

    pub fn write_replay_point(&self, file_id: u64) -> Result<()> {
        self.components()?.replay_point.write(file_id)
    }

    /// End of the local log: the replayed position once local replay is
    /// done, otherwise what is on disk
    pub fn get_max_log_seq_in_file(&self) -> Result<u64> {
        let c = self.components()?;
        if self.is_log_replay_finished() {
            return Ok(c.worker.get_replayed_log_id());
        }
        let mut cached = self.local_max_log_id_when_start.lock();
        if let Some(log_id) = *cached {
            return Ok(log_id);
        }
        let log_id = get_local_max_log_cursor(&c.disk_reader)?
            .map(|cursor| cursor.log_id)
            .unwrap_or(0);
        if log_id == 0 {
            info!("local log dir has no log or log is not continuous");
        }
        *cached = Some(log_id);
        Ok(log_id)
    }

    /// End of what the cache can serve past the replayed position
    pub fn get_max_log_seq_in_buffer(&self) -> Result<u64> {
        let c = self.components()?;
        let replayed = c.worker.get_replayed_log_id();
        if self.is_log_replay_finished() && replayed > c.cache.start_id() {
            return Ok(replayed.max(c.cache.end_id()));
        }
        Ok(replayed)
    }

    pub fn get_max_log_seq_replayable(&self) -> Result<u64> {
        Ok(self
            .get_max_log_seq_in_file()?
            .max(self.get_max_log_seq_in_buffer()?))
    }

    pub fn is_sync_with_master(&self) -> bool {
        let master = self.master_log_id.get();
        let replayed = self.replayed_or_zero();
        master == 0 || replayed >= master
    }

    /// Whether the replayed position lies outside the cache and the
    /// worker is idle
    pub fn has_nothing_in_buf_to_replay(&self) -> bool {
        let Some(c) = self.components.get() else {
            return true;
        };
        let replayed = c.worker.get_replayed_log_id();
        !c.cache.contains(replayed) && c.worker.is_all_task_finished()
    }

    pub fn has_log_to_replay(&self) -> bool {
        let lsync = self
            .components
            .get()
            .is_some_and(|c| c.source.is_using_lsync());
        lsync || self.master_log_id.get() > self.replayed_or_zero()
    }

    /// Wait for `master_log_id` to pass the replayed position
    ///
    /// `None` when the master streams continuously and there is nothing to
    /// wait on.
    pub fn wait_new_log_to_replay(&self, timeout: Duration) -> Option<u64> {
        let c = self.components.get()?;
        if c.source.is_using_lsync() {
            return None;
        }
        let target = c.worker.get_replayed_log_id() + 1;
        Some(self.master_log_id.wait_until(target, timeout))
    }

    /// Move to ACTIVE once everything up to `master_log_id` is submitted
    ///
    /// Refused while the master position is unknown or still ahead.
    pub fn set_state_as_active(&self) -> Result<()> {
        let c = self.components()?;
        if self.activate_if_caught_up(c)? {
            return Ok(());
        }
        let state = self.role.state();
        warn!(
            master_log_id = self.master_log_id.get(),
            submitted = c.worker.get_next_submit_log_id(),
            %state,
            "not caught up with master"
        );
        Err(LogError::InvalidTransition {
            from: state.to_string(),
            to: RoleState::Active.to_string(),
        })
    }

    /// False while the master position is unknown or still ahead
    fn activate_if_caught_up(&self, c: &Components) -> Result<bool> {
        if self.role.state() == RoleState::Active {
            return Ok(true);
        }
        let master_log_id = self.master_log_id.get();
        let submitted = c.worker.get_next_submit_log_id();
        if master_log_id == 0 || submitted < master_log_id {
            return Ok(false);
        }

        info!(
            master_log_id,
            replay_cursor = %self.progress.cursor(),
            "setting state ACTIVE"
        );
        self.role.transition(RoleState::Active)?;
        Ok(true)
    }

    // =========================================================================
    // Replicas
    // =========================================================================

    /// Register a downstream replica
    ///
    /// With `switch_log` a master-master rotates the log first so the
    /// replica starts at a fresh file. Any other node only relays its
    /// upstream's log_ids, so it never rotates on its own and the flag is
    /// ignored. Returns the current file_id.
    pub fn add_replica(&self, addr: SocketAddr, switch_log: bool) -> Result<u64> {
        let c = self.components()?;
        info!(%addr, switch_log, "adding replica");
        let file_id = if switch_log && self.role.is_master_master() {
            c.writer.switch_log_file()?
        } else {
            if switch_log {
                debug!(%addr, role = ?self.role.role(), "not a master-master, log switch skipped");
            }
            c.writer.current_file_id()
        };
        self.replicas.add(addr, c.writer.cursor().log_id);
        Ok(file_id)
    }

    // =========================================================================
    // Internal Helpers
    // =========================================================================

    fn components(&self) -> Result<&Components> {
        self.components.get().ok_or(LogError::NotInitialized)
    }

    fn replayed_or_zero(&self) -> u64 {
        self.components
            .get()
            .map(|c| c.worker.get_replayed_log_id())
            .unwrap_or(0)
    }
}

// =============================================================================
// Writer Callbacks
// =============================================================================

/// Keeps cache, replay cursor and master_log_id in step with master writes
struct MasterWriteHook {
    cache: Arc<RecentLogCache>,
    progress: Arc<ReplayProgress>,
    master_log_id: Arc<Watermark>,
}

impl WriteHook for MasterWriteHook {
    fn on_log_written(
        &self,
        is_master: bool,
        start: &LogCursor,
        end: &LogCursor,
        data: &Bytes,
    ) -> Result<()> {
        if !is_master {
            return Ok(());
        }

        if let Err(e) = self.cache.append(start.log_id, end.log_id, data.clone()) {
            // Left over from a previous role
            warn!(start_id = start.log_id, error = %e, "resetting log cache");
            self.cache.reset();
            self.cache.append(start.log_id, end.log_id, data.clone())?;
        }
        self.master_log_id.advance(end.log_id);
        self.progress.update_replay_cursor(*end);
        Ok(())
    }
}

/// Stores replayed batches through the writer
struct LocalLogStore {
    writer: Arc<LogWriter>,
    role: Arc<RoleStateMachine>,
}

impl BatchStore for LocalLogStore {
    fn store_batch(&self, data: Bytes) -> Result<LogCursor> {
        self.writer.append(data, self.role.is_slave_master())
    }
}
