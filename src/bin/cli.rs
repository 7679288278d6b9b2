//! chunklog CLI
//!
//! Inspect, recover from, and load-test a backup directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use chunklog::log::{
    recover_log, LogCatalog, LogGeometry, Manifest, PrimaryLog, RecoveredEntry, PRIMARY_LOG_FILE, SECONDARY_DIR,
};
use chunklog::reorg::ReorgTotals;
use chunklog::types::Clock;
use chunklog::{ChunkId, Config, LogEngine, LogError, RangeKey, Result, UtilizationReport};
use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing_subscriber::{fmt, EnvFilter};

/// chunklog CLI
#[derive(Parser, Debug)]
#[command(name = "chunklog-cli")]
#[command(about = "Inspect and exercise a chunklog backup directory")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the utilization report of an existing backup directory
    Inspect {
        /// Backup directory
        dir: PathBuf,
    },

    /// List the recovered chunks of one range
    ///
    /// Reads the secondary log only and reports how many entries of the
    /// range still wait in the primary log. With --replay the directory is
    /// opened as an engine first, which moves those entries into the
    /// secondary logs.
    Recover {
        /// Backup directory
        dir: PathBuf,

        /// Owner node id of the range
        #[arg(short, long)]
        owner: u16,

        /// Range id
        #[arg(short, long)]
        range: u16,

        /// Replay the primary log before recovering (modifies the directory)
        #[arg(long)]
        replay: bool,
    },

    /// Run a synthetic multi-threaded workload and print the report
    Load {
        /// Backup directory (created if missing)
        dir: PathBuf,

        /// Producer threads
        #[arg(short, long, default_value = "4")]
        threads: u16,

        /// Chunks written per thread
        #[arg(short, long, default_value = "10000")]
        chunks: u64,

        /// Largest payload size in bytes (sizes vary down to half of it)
        #[arg(short, long, default_value = "256")]
        size: usize,

        /// Distinct chunk ids per thread (overwrites create stale data)
        #[arg(short = 'k', long, default_value = "1000")]
        keys: u64,

        /// Secondary log size in MiB
        #[arg(long, default_value = "64")]
        log_mb: usize,
    },
}

fn main() {
    // Initialize tracing/logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,chunklog=debug"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    let args = Args::parse();
    tracing::info!("chunklog CLI v{}", chunklog::VERSION);

    let result = match args.command {
        Commands::Inspect { dir } => inspect(&dir),
        Commands::Recover {
            dir,
            owner,
            range,
            replay,
        } => {
            if replay {
                recover_replayed(&dir, owner, range)
            } else {
                recover(&dir, owner, range)
            }
        }
        Commands::Load {
            dir,
            threads,
            chunks,
            size,
            keys,
            log_mb,
        } => load(&dir, threads, chunks, size, keys, log_mb),
    };

    if let Err(e) = result {
        tracing::error!("Command failed: {}", e);
        std::process::exit(1);
    }
}

/// Configuration of an existing directory with its stored geometry
fn stored_config(dir: &Path) -> Result<Config> {
    let mut config = Config::builder().backup_dir(dir).build();
    match Manifest::load(dir)? {
        Some(manifest) => manifest.apply(&mut config),
        None => tracing::warn!("No manifest in {}, assuming default geometry", dir.display()),
    }
    // The buffer must stay below a segment of the stored geometry
    config.secondary_log_buffer_size = config.secondary_log_buffer_size.min(config.segment_size / 2);
    Ok(config)
}

/// Open the catalog of an existing directory
fn open_catalog(config: &Config) -> Result<LogCatalog> {
    let catalog = LogCatalog::new(
        &config.backup_dir.join(SECONDARY_DIR),
        LogGeometry::from_config(config),
        config.secondary_log_buffer_size,
        Arc::new(Clock::new()),
    );
    catalog.open_existing()?;
    Ok(catalog)
}

fn inspect(dir: &Path) -> Result<()> {
    let config = stored_config(dir)?;
    let catalog = open_catalog(&config)?;
    let report = UtilizationReport::collect(&catalog, None, ReorgTotals::default());
    println!("{}", report);
    Ok(())
}

/// Entries of `key` in the primary log that no secondary log holds yet
fn primary_backlog(config: &Config, key: RangeKey) -> Result<usize> {
    let path = config.backup_dir.join(PRIMARY_LOG_FILE);
    if !config.two_level_logging || !path.exists() {
        return Ok(0);
    }
    let primary = PrimaryLog::open(&path, config.primary_log_size)?;
    let (entries, corrupt) = primary.read_entries()?;
    if corrupt > 0 {
        tracing::warn!(corrupt, "Skipped corrupt primary log entries");
    }
    Ok(entries.iter().filter(|(header, _)| header.range_key() == key).count())
}

fn print_entries(entries: &[RecoveredEntry]) {
    for entry in entries {
        let state = if entry.is_tombstone() { "removed" } else { "live" };
        println!(
            "{}  {:>12}  {:>8} bytes  {}",
            entry.chunk_id,
            entry.version.to_string(),
            entry.payload.len(),
            state
        );
    }
}

fn recover(dir: &Path, owner: u16, range: u16) -> Result<()> {
    let config = stored_config(dir)?;
    let catalog = open_catalog(&config)?;
    let key = RangeKey::new(owner, range);
    let backlog = primary_backlog(&config, key)?;

    match catalog.get(key) {
        Some(range) => {
            let outcome = recover_log(&range.log)?;
            print_entries(&outcome.entries);
            println!(
                "{} chunks from {} segments ({} corrupt entries, {} incomplete chains)",
                outcome.entries.len(),
                outcome.segments,
                outcome.corrupt,
                outcome.incomplete_chains
            );
        }
        None if backlog == 0 => {
            println!("range {} not found", key);
            return Ok(());
        }
        None => println!("range {} has no secondary log yet", key),
    }

    if backlog > 0 {
        println!(
            "{} entries of this range are only in the primary log; rerun with --replay to include them",
            backlog
        );
    }
    Ok(())
}

/// Open the directory as an engine (replaying the primary log) and recover
fn recover_replayed(dir: &Path, owner: u16, range: u16) -> Result<()> {
    let engine = LogEngine::open(stored_config(dir)?)?;
    let entries = match engine.recover_range(owner, range) {
        Ok(entries) => entries,
        Err(LogError::UnknownRange(key)) => {
            println!("range {} not found", key);
            return engine.close();
        }
        Err(e) => return Err(e),
    };
    print_entries(&entries);
    println!("{} chunks after replaying the primary log", entries.len());
    engine.close()
}

fn load(dir: &Path, threads: u16, chunks: u64, size: usize, keys: u64, log_mb: usize) -> Result<()> {
    let config = Config::builder()
        .backup_dir(dir)
        .secondary_log_size(log_mb * 1024 * 1024)
        .build();
    let engine = LogEngine::open(config)?;
    let payload = vec![0xA5u8; size.max(1)];
    let keys = keys.max(1);
    let started = Instant::now();

    let results: Vec<Result<()>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|t| {
                let engine = &engine;
                let payload = &payload;
                scope.spawn(move || -> Result<()> {
                    let mut rng = StdRng::seed_from_u64(u64::from(t));
                    for _ in 0..chunks {
                        let chunk = ChunkId::new(t + 1, rng.gen_range(0..keys));
                        let len = rng.gen_range(payload.len() / 2..=payload.len());
                        engine.submit(t + 1, 0, chunk, &payload[..len])?;
                    }
                    engine.flush(t + 1, 0)
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| {
                h.join()
                    .unwrap_or_else(|_| Err(LogError::InvalidArgument("producer thread panicked".to_string())))
            })
            .collect()
    });
    for result in results {
        result?;
    }

    let elapsed = started.elapsed();
    let total = threads as u64 * chunks;
    println!(
        "wrote {} chunks (up to {} bytes each) in {:.2?} ({:.0} chunks/s)",
        total,
        size,
        elapsed,
        total as f64 / elapsed.as_secs_f64().max(f64::EPSILON)
    );
    println!("{}", engine.utilization_report());
    engine.close()
}
