//! clogtool
//!
//! Inspect and exercise a commit log directory.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use commitlog::log::{
    get_local_max_log_cursor, LogCommand, LogCursor, LogDirScanner, PositionedLogReader,
};
use commitlog::memtable::{MemTable, Mutation};
use commitlog::replication::{NoUpstream, ReplicaRegistry};
use commitlog::role::{ClusterRole, LocalRole, NodeRole, RoleState, RoleStateMachine};
use commitlog::{Config, LogManager, LogSyncStrategy};
use tracing_subscriber::{fmt, EnvFilter};

/// Commit log tool
#[derive(Parser, Debug)]
#[command(name = "clogtool")]
#[command(about = "Inspect and exercise a commit log directory")]
#[command(version)]
struct Args {
    /// Log directory
    #[arg(short, long, default_value = "./clog_data")]
    log_dir: PathBuf,

    /// Max log file size in MB before rotation
    #[arg(short = 'm', long, default_value = "64")]
    max_file_mb: u64,

    /// fsync after this many batches (1 = every batch)
    #[arg(long, default_value = "1")]
    sync_every: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List log files and the recovered end position
    Scan,

    /// Print every entry of one log file
    Dump {
        /// The file_id to dump
        file_id: u64,
    },

    /// Append generated Put mutations as master
    Write {
        /// Number of mutations
        #[arg(short, long, default_value = "1000")]
        count: usize,

        /// Mutations per batch
        #[arg(short, long, default_value = "16")]
        batch: usize,

        /// Value size in bytes
        #[arg(long, default_value = "100")]
        value_size: usize,
    },

    /// Replay the directory into an in-memory table
    Replay,
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,commitlog=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("clogtool v{}", commitlog::VERSION);
    tracing::info!("Log directory: {}", args.log_dir.display());

    let sync_strategy = if args.sync_every <= 1 {
        LogSyncStrategy::EveryWrite
    } else {
        LogSyncStrategy::EveryNBatches {
            count: args.sync_every,
        }
    };
    let config = Config::builder()
        .log_dir(&args.log_dir)
        .log_file_max_size(args.max_file_mb * 1024 * 1024)
        .sync_strategy(sync_strategy)
        .build();

    let result = match args.command {
        Commands::Scan => scan(&config),
        Commands::Dump { file_id } => dump(&config, file_id),
        Commands::Write {
            count,
            batch,
            value_size,
        } => write(config, count, batch, value_size),
        Commands::Replay => replay(config),
    };

    if let Err(e) = result {
        tracing::error!("{}", e);
        process::exit(1);
    }
}

fn scan(config: &Config) -> commitlog::Result<()> {
    let scanner = LogDirScanner::scan(&config.log_dir)?;
    if scanner.is_empty() {
        println!("no log files");
        return Ok(());
    }

    let reader = PositionedLogReader::new(&config.log_dir);
    for file_id in scanner.file_ids() {
        match reader.get_first_log_id(*file_id) {
            Ok(first) => println!("{:08}.log  first_log_id={}", file_id, first),
            Err(e) => println!("{:08}.log  ({})", file_id, e),
        }
    }
    println!(
        "files: {}..={} continuous={}",
        scanner.file_ids()[0],
        scanner.max_file_id().unwrap_or(0),
        scanner.is_continuous()
    );
    match get_local_max_log_cursor(&reader)? {
        Some(cursor) => println!("end: {}", cursor),
        None => println!("end: no entries"),
    }
    Ok(())
}

fn dump(config: &Config, file_id: u64) -> commitlog::Result<()> {
    let reader = PositionedLogReader::new(&config.log_dir);
    let mut cursor = LogCursor::at_file(file_id);
    loop {
        let chunk = reader.read_at(&cursor, 1024 * 1024)?;
        if chunk.data.is_empty() {
            break;
        }
        for item in commitlog::log::EntryIter::new(&chunk.data) {
            let (entry, pos) = item?;
            let offset = cursor.offset + pos as u64;
            match entry.command {
                LogCommand::Data => match Mutation::decode(&entry.payload) {
                    Ok(m) => println!("{:>10} @{:<10} DATA   {:?}", entry.sequence, offset, m),
                    Err(_) => println!(
                        "{:>10} @{:<10} DATA   {} bytes",
                        entry.sequence,
                        offset,
                        entry.payload.len()
                    ),
                },
                LogCommand::SwitchLog => println!(
                    "{:>10} @{:<10} SWITCH -> {}",
                    entry.sequence,
                    offset,
                    entry.switch_target()?
                ),
                LogCommand::Nop => println!(
                    "{:>10} @{:<10} NOP    {} bytes",
                    entry.sequence,
                    offset,
                    entry.serialized_len()
                ),
            }
        }
        if chunk.end.file_id != file_id {
            break;
        }
        cursor = chunk.end;
    }
    Ok(())
}

fn open_manager(config: Config, role: NodeRole, engine: Arc<MemTable>) -> commitlog::Result<LogManager> {
    let role = Arc::new(
        RoleStateMachine::new(role).with_shutdown_hook(Arc::new(|reason: &str| {
            tracing::error!("Fatal: {}", reason);
            process::exit(1);
        })),
    );
    let manager = LogManager::new(
        config,
        engine,
        Arc::new(ReplicaRegistry::standalone()),
        role,
        Arc::new(NoUpstream),
    );
    manager.init()?;
    Ok(manager)
}

fn write(config: Config, count: usize, batch: usize, value_size: usize) -> commitlog::Result<()> {
    let engine = Arc::new(MemTable::new());
    let manager = open_manager(
        config,
        NodeRole::new(ClusterRole::Master, LocalRole::Master),
        engine,
    )?;
    manager.replay_local_log()?;
    manager.start_log_for_master_write()?;
    manager.role().transition(RoleState::Master)?;

    let value = vec![b'v'; value_size];
    let mut written = 0;
    while written < count {
        let n = batch.max(1).min(count - written);
        let payloads = (written..written + n)
            .map(|i| Mutation::put(format!("key{:010}", i), value.clone()).encode())
            .collect::<commitlog::Result<Vec<_>>>()?;
        manager.write_log(&payloads)?;
        written += n;
    }

    let end = manager.get_write_cursor()?;
    manager.stop();
    println!("wrote {} mutations, end {}", count, end);
    Ok(())
}

fn replay(config: Config) -> commitlog::Result<()> {
    let engine = Arc::new(MemTable::new());
    let manager = open_manager(config, NodeRole::default(), engine.clone())?;
    manager.replay_local_log()?;

    let cursor = manager.get_replay_cursor()?;
    manager.stop();
    println!(
        "replayed to {}: {} keys, applied_log_id={}",
        cursor,
        engine.entry_count(),
        engine.applied_log_id()
    );
    Ok(())
}
