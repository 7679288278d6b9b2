//! Engine Module
//!
//! Owns every component and the three background threads, and exposes the
//! producer, flush, reorganization and recovery operations.
//!
//! ## Responsibilities
//! - Stamp versions and append entries to the write buffer
//! - Start and stop the process, writer and reorganization threads
//! - Replay the primary log and rebuild in-memory state on open
//! - Drain everything to the secondary logs on close
//!
//! ## Ownership
//! ```text
//!   LogEngine
//!     ├── BufferPool, VersionTable        (injectable, shared)
//!     ├── WriteBuffer ──────► ProcessThread ──► LogWriter ──► files
//!     ├── LogCatalog (RangeLog per range)           │
//!     ├── PrimaryLog (two-level logging only)       ▼
//!     └── ReorgCoordinator ◄──────────────── ReorgThread
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{LogError, Result};
use crate::log::{
    recover_log, AccessFlag, LogCatalog, LogGeometry, Manifest, PrimaryLog, RangeLog, RecoveredEntry,
    PRIMARY_LOG_FILE, SECONDARY_DIR,
};
use crate::pool::BufferPool;
use crate::process::{ProcessContext, ProcessThread};
use crate::reorg::{clean_segment, CleanStats, ReorgCoordinator, ReorgThread};
use crate::report::UtilizationReport;
use crate::types::{ChunkId, Clock, NodeId, RangeId, RangeKey};
use crate::version::{Version, VersionSnapshot, VersionTable};
use crate::write_buffer::{EntrySpec, WriteBuffer};
use crate::writer::{LogWriter, WriteJob};

/// Log-structured backup engine
///
/// ## Concurrency Model: many producers, one consumer per stage
///
/// - **Producers** (submit/submit_remove): any number of threads; they
///   only touch the version table and the write buffer
/// - **Process thread**: drains the write buffer, fills pooled buffers
/// - **Writer thread**: the only thread appending to log files
/// - **Reorganization thread**: cleans segments under the access handshake
///
/// Calls that must observe durable state (flush, recover_range,
/// request_reorganization) push their range through every stage and then
/// wait on a writer barrier.
pub struct LogEngine {
    config: Arc<Config>,
    clock: Arc<Clock>,
    pool: Arc<BufferPool>,
    versions: Arc<VersionTable>,
    write_buffer: Arc<WriteBuffer>,
    catalog: Arc<LogCatalog>,
    primary: Option<Arc<PrimaryLog>>,
    reorg: Arc<ReorgCoordinator>,
    writer: Arc<LogWriter>,
    process: ProcessThread,
    reorg_thread: ReorgThread,
    closed: AtomicBool,
}

impl LogEngine {
    /// Open or create the engine in `config.backup_dir` with a fresh pool
    /// and version table
    pub fn open(config: Config) -> Result<Self> {
        let pool = Arc::new(BufferPool::new(config.segment_size));
        Self::open_with(config, pool, Arc::new(VersionTable::new()))
    }

    /// Open with an externally owned buffer pool and version table
    ///
    /// On startup:
    /// 1. Validate the configuration against the directory manifest
    /// 2. Reopen existing secondary logs (rebuilds segment/location tables)
    /// 3. Move primary log entries missing from the secondary logs into them
    /// 4. Rebuild the version table from the secondary logs
    /// 5. Start the writer, process and reorganization threads
    pub fn open_with(config: Config, pool: Arc<BufferPool>, versions: Arc<VersionTable>) -> Result<Self> {
        // Step 1: Configuration and manifest
        config.validate()?;
        fs::create_dir_all(&config.backup_dir)?;
        match Manifest::load(&config.backup_dir)? {
            Some(manifest) => manifest.check(&config)?,
            None => Manifest::from_config(&config).store(&config.backup_dir)?,
        }

        // Step 2: Secondary logs
        let clock = Arc::new(Clock::new());
        let catalog = Arc::new(LogCatalog::new(
            &config.backup_dir.join(SECONDARY_DIR),
            LogGeometry::from_config(&config),
            config.secondary_log_buffer_size,
            Arc::clone(&clock),
        ));
        let reports = catalog.open_existing()?;
        let newest = reports.iter().map(|(_, r)| r.newest_timestamp).max().unwrap_or(0);
        clock.advance_past(newest);
        let corrupt: usize = reports.iter().map(|(_, r)| r.corrupt).sum();
        if corrupt > 0 {
            warn!(corrupt, "Corrupt entries found while reopening secondary logs");
        }

        // Step 3: Primary log replay
        let primary_path = config.backup_dir.join(PRIMARY_LOG_FILE);
        let primary = if config.two_level_logging || primary_path.exists() {
            let log = PrimaryLog::open(&primary_path, config.primary_log_size)?;
            let replayed = replay_primary(&log, &catalog)?;
            log.reset()?;
            log.sync()?;
            if replayed > 0 {
                info!(entries = replayed, "Moved primary log entries into secondary logs");
            }
            config.two_level_logging.then(|| Arc::new(log))
        } else {
            None
        };

        // Step 4: Version table
        for range in catalog.ranges() {
            versions.rebuild(range.key, range.log.chunk_versions());
        }

        // Step 5: Threads
        let config = Arc::new(config);
        let access = Arc::new(AccessFlag::new());
        let reorg = Arc::new(ReorgCoordinator::new(Arc::clone(&access)));
        let writer = Arc::new(LogWriter::spawn(
            Arc::clone(&pool),
            primary.clone(),
            Arc::clone(&reorg),
        )?);
        let write_buffer = Arc::new(WriteBuffer::new(&config, Arc::clone(&clock)));
        let process = ProcessThread::spawn(ProcessContext {
            config: Arc::clone(&config),
            write_buffer: Arc::clone(&write_buffer),
            pool: Arc::clone(&pool),
            catalog: Arc::clone(&catalog),
            primary: primary.clone(),
            writer: Arc::clone(&writer),
            access,
            stop: Arc::new(AtomicBool::new(false)),
        })?;
        let reorg_thread = ReorgThread::spawn(
            &config,
            Arc::clone(&reorg),
            Arc::clone(&catalog),
            Arc::clone(&versions),
            Arc::clone(&clock),
        )?;

        info!(
            dir = %config.backup_dir.display(),
            ranges = catalog.len(),
            two_level = config.two_level_logging,
            "Backup engine opened"
        );

        Ok(Self {
            config,
            clock,
            pool,
            versions,
            write_buffer,
            catalog,
            primary,
            reorg,
            writer,
            process,
            reorg_thread,
            closed: AtomicBool::new(false),
        })
    }

    /// Open an existing backup directory with default tuning
    pub fn open_path(path: &Path) -> Result<Self> {
        let config = Config::builder().backup_dir(path).build();
        Self::open(config)
    }

    // =========================================================================
    // Producer API
    // =========================================================================

    /// Log a new version of a chunk
    pub fn submit(&self, owner: NodeId, range_id: RangeId, chunk_id: ChunkId, payload: &[u8]) -> Result<Version> {
        let mut reader = payload;
        self.submit_from_reader(owner, range_id, chunk_id, &mut reader, payload.len())
    }

    /// Log a new version of a chunk, streaming `length` payload bytes from
    /// `reader` straight into the write buffer
    pub fn submit_from_reader<R: Read + ?Sized>(
        &self,
        owner: NodeId,
        range_id: RangeId,
        chunk_id: ChunkId,
        reader: &mut R,
        length: usize,
    ) -> Result<Version> {
        let key = RangeKey::new(owner, range_id);
        self.check_writable(key)?;

        let plan = self.write_buffer.plan(length)?;
        let version = self.versions.next_version(key, chunk_id);
        let entry = EntrySpec {
            owner,
            range_id,
            chunk_id,
            version,
        };
        self.write_buffer.append(&entry, &plan, reader)?;

        trace!(range = %key, chunk = %chunk_id, %version, length, "Submitted chunk");
        Ok(version)
    }

    /// Log the removal of a chunk (a tombstone entry)
    pub fn submit_remove(&self, owner: NodeId, range_id: RangeId, chunk_id: ChunkId) -> Result<Version> {
        let key = RangeKey::new(owner, range_id);
        self.check_writable(key)?;

        let plan = self.write_buffer.plan(0)?;
        let version = self.versions.mark_removed(key, chunk_id);
        let entry = EntrySpec {
            owner,
            range_id,
            chunk_id,
            version,
        };
        self.write_buffer.append(&entry, &plan, &mut std::io::empty())?;

        trace!(range = %key, chunk = %chunk_id, %version, "Submitted removal");
        Ok(version)
    }

    // =========================================================================
    // Flush, Reorganization, Recovery
    // =========================================================================

    /// Block until everything submitted to the range so far has left the
    /// write buffer and the jobs it produced are on disk
    ///
    /// Staged entries stay in the primary log and the range's secondary log
    /// buffer.
    pub fn flush(&self, owner: NodeId, range_id: RangeId) -> Result<()> {
        self.ensure_open()?;
        self.write_buffer.flush_range(RangeKey::new(owner, range_id))?;
        self.writer.barrier()
    }

    /// Block until everything submitted so far has left the write buffer
    pub fn flush_all(&self) -> Result<()> {
        self.ensure_open()?;
        self.write_buffer.flush_all()?;
        self.writer.barrier()
    }

    /// Reorganize a range's secondary log
    ///
    /// The range is first pushed all the way into its secondary log. With
    /// `blocking` the call returns after the full pass finished.
    pub fn request_reorganization(&self, owner: NodeId, range_id: RangeId, blocking: bool) -> Result<()> {
        let range = self.settle_range(RangeKey::new(owner, range_id))?;
        if blocking {
            if !self.reorg.reorganize_blocking(range.key) {
                return Err(LogError::ShuttingDown);
            }
        } else {
            self.reorg.request(range.key);
        }
        debug!(range = %range.key, blocking, "Reorganization requested");
        Ok(())
    }

    /// Latest version of every chunk of a range, in submission order
    ///
    /// Removed chunks are returned as tombstones with an empty payload.
    pub fn recover_range(&self, owner: NodeId, range_id: RangeId) -> Result<Vec<RecoveredEntry>> {
        let range = self.settle_range(RangeKey::new(owner, range_id))?;
        let outcome = recover_log(&range.log)?;
        if outcome.corrupt > 0 || outcome.incomplete_chains > 0 {
            warn!(
                range = %range.key,
                corrupt = outcome.corrupt,
                incomplete_chains = outcome.incomplete_chains,
                "Recovery skipped damaged entries"
            );
        }
        Ok(outcome.entries)
    }

    /// Delete a range: its secondary log file and its versions
    ///
    /// Returns whether the range existed.
    pub fn remove_range(&self, owner: NodeId, range_id: RangeId) -> Result<bool> {
        self.ensure_open()?;
        let key = RangeKey::new(owner, range_id);
        self.write_buffer.flush_range(key)?;
        if let Some(range) = self.catalog.get(key) {
            drop(range.buffer.lock().take());
        }
        self.writer.barrier()?;

        let removed = self.catalog.remove(key)?.is_some();
        self.versions.remove_range(key);
        if removed {
            info!(range = %key, "Removed backup range");
        }
        Ok(removed)
    }

    /// Push a range through every stage into its secondary log
    fn settle_range(&self, key: RangeKey) -> Result<Arc<RangeLog>> {
        self.ensure_open()?;
        self.write_buffer.flush_range(key)?;
        let range = self
            .catalog
            .get(key)
            .ok_or_else(|| LogError::UnknownRange(key.to_string()))?;
        self.writer.post_staged(&range)?;
        self.writer.barrier()?;
        Ok(range)
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    pub fn utilization_report(&self) -> UtilizationReport {
        UtilizationReport::collect(&self.catalog, self.primary.as_deref(), self.reorg.stats().totals())
    }

    /// Latest version handed out for a chunk
    pub fn current_version(&self, owner: NodeId, range_id: RangeId, chunk_id: ChunkId) -> Option<Version> {
        self.versions.current(RangeKey::new(owner, range_id), chunk_id)
    }

    /// Entries currently held by the primary log
    pub fn primary_log_entry_count(&self) -> Result<usize> {
        match &self.primary {
            Some(primary) => Ok(primary.read_entries()?.0.len()),
            None => Ok(0),
        }
    }

    /// Bytes submitted but not yet distributed by the process thread
    pub fn pending_bytes(&self) -> u64 {
        self.write_buffer.pending_bytes()
    }

    /// Occupied bytes of a range's secondary log (0 for unknown ranges)
    pub fn occupied_space(&self, owner: NodeId, range_id: RangeId) -> u64 {
        self.catalog
            .get(RangeKey::new(owner, range_id))
            .map_or(0, |range| range.log.occupied_space())
    }

    pub fn ranges(&self) -> Vec<RangeKey> {
        self.catalog.ranges().iter().map(|r| r.key).collect()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn backup_dir(&self) -> &Path {
        &self.config.backup_dir
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn versions(&self) -> &Arc<VersionTable> {
        &self.versions
    }

    pub fn now_secs(&self) -> u32 {
        self.clock.now_secs()
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Drain every stage and stop the background threads
    pub fn close(self) -> Result<()> {
        self.shutdown()
    }

    fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let timeout = Duration::from_millis(self.config.shutdown_timeout_ms);

        // Step 1: No new submissions; distribute what is left
        self.write_buffer.stop();
        let drained = self.write_buffer.flush_all();
        self.process.shutdown(timeout);

        // Step 2: Staged entries to their secondary logs
        for range in self.catalog.ranges() {
            if let Err(e) = self.writer.post_staged(&range) {
                error!(range = %range.key, error = %e, "Could not post staged entries on shutdown");
            }
        }
        let synced = self.writer.barrier();

        // Step 3: Reorganizer, then the writer (primary log no longer needed)
        self.reorg_thread.shutdown(timeout);
        let degraded = self.catalog.ranges().iter().any(|r| r.log.is_degraded());
        if self.primary.is_some() && synced.is_ok() && !degraded {
            let _ = self.writer.post(WriteJob::ResetPrimary);
        } else if self.primary.is_some() {
            warn!("Keeping primary log content for replay on next open");
        }
        let stopped = self.writer.shutdown(timeout);

        info!(ranges = self.catalog.len(), clean = stopped, "Backup engine closed");
        drained.and(synced)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::ShuttingDown);
        }
        Ok(())
    }

    fn check_writable(&self, key: RangeKey) -> Result<()> {
        self.ensure_open()?;
        match self.catalog.get(key) {
            Some(range) if range.log.is_degraded() => Err(LogError::Degraded(key.to_string())),
            _ => Ok(()),
        }
    }
}

impl Drop for LogEngine {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!(error = %e, "Error while closing backup engine");
        }
    }
}

// =============================================================================
// Primary Log Replay
// =============================================================================

/// Append primary log entries whose version is missing from their
/// secondary log; returns the number of entries moved
fn replay_primary(primary: &PrimaryLog, catalog: &LogCatalog) -> Result<usize> {
    let (entries, corrupt) = primary.read_entries()?;
    if corrupt > 0 {
        warn!(corrupt, "Skipped corrupt primary log entries");
    }
    if entries.is_empty() {
        return Ok(0);
    }

    // Decided before appending: fragments of one chain share a version
    let needed: Vec<bool> = entries
        .iter()
        .map(|(header, _)| match catalog.get(header.range_key()) {
            Some(range) => range
                .log
                .current_version(header.chunk_id)
                .map_or(true, |durable| durable < header.version),
            None => true,
        })
        .collect();

    let mut batches: BTreeMap<RangeKey, Vec<u8>> = BTreeMap::new();
    let mut moved = 0;
    for ((header, payload), needed) in entries.iter().zip(needed) {
        if !needed {
            continue;
        }
        let batch = batches.entry(header.range_key()).or_default();
        batch.extend_from_slice(&header.to_secondary().encode());
        batch.extend_from_slice(payload);
        moved += 1;
    }

    for (key, batch) in batches {
        let range = catalog.get_or_create(key)?;
        append_replayed(&range, &batch)?;
        range.log.sync()?;
    }
    Ok(moved)
}

/// Append during open, cleaning the log synchronously once if it is full
fn append_replayed(range: &RangeLog, data: &[u8]) -> Result<()> {
    let mut rest = data;
    let mut cleaned = false;

    loop {
        let outcome = range.log.append(rest)?;
        if !outcome.out_of_space {
            return Ok(());
        }
        rest = &rest[outcome.written..];

        if cleaned {
            range.log.mark_degraded("no space to replay the primary log");
            error!(range = %range.key, bytes = rest.len(), "Secondary log full during replay");
            return Ok(());
        }

        let snapshot = VersionSnapshot::default();
        let mut stats = CleanStats::default();
        for (index, _) in range.log.clean_candidates() {
            stats += clean_segment(&range.log, index, &snapshot)?;
        }
        debug!(range = %range.key, reclaimed = stats.bytes_reclaimed, "Cleaned log during replay");
        cleaned = true;
    }
}
