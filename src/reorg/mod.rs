//! Reorganization: reclaiming stale bytes from secondary logs
//!
//! ```text
//!   writer ── out of space ──► reorganize_blocking ─┐
//!   writer ── threshold ─────► request ─────────────┤
//!   engine ── explicit ──────► request / blocking ──┤
//!                                                   ▼
//!                                           ReorgCoordinator
//!                                                   │
//!                                                   ▼
//!                                  ReorgWorker (own thread)
//!                              full pass │ sweep step
//!                                        ▼
//!                              clean_segment (cleaner.rs)
//! ```

mod cleaner;
mod policy;
mod thread;

pub use cleaner::{clean_segment, CleanStats};
pub use policy::{choose_segment, cost_benefit, LogCandidate, ReorgPolicy};
pub use thread::ReorgCoordinator;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::Result;
use crate::log::LogCatalog;
use crate::types::Clock;
use crate::version::VersionTable;
use crate::writer::join_bounded;

use thread::ReorgWorker;

/// Running totals of reorganization work
#[derive(Debug, Default)]
pub struct ReorgStats {
    full_passes: AtomicU64,
    sweep_steps: AtomicU64,
    segments_cleaned: AtomicU64,
    segments_freed: AtomicU64,
    entries_dropped: AtomicU64,
    corrupt_entries: AtomicU64,
    bytes_reclaimed: AtomicU64,
}

/// Point-in-time copy of `ReorgStats`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReorgTotals {
    pub full_passes: u64,
    pub sweep_steps: u64,
    pub segments_cleaned: u64,
    pub segments_freed: u64,
    pub entries_dropped: u64,
    pub corrupt_entries: u64,
    pub bytes_reclaimed: u64,
}

impl ReorgStats {
    pub(crate) fn record_full(&self, stats: &CleanStats) {
        self.full_passes.fetch_add(1, Ordering::Relaxed);
        self.add(stats);
    }

    pub(crate) fn record_sweep(&self, stats: &CleanStats) {
        self.sweep_steps.fetch_add(1, Ordering::Relaxed);
        self.add(stats);
    }

    fn add(&self, stats: &CleanStats) {
        self.segments_cleaned.fetch_add(stats.segments_cleaned, Ordering::Relaxed);
        self.segments_freed.fetch_add(stats.segments_freed, Ordering::Relaxed);
        self.entries_dropped.fetch_add(stats.entries_dropped, Ordering::Relaxed);
        self.corrupt_entries.fetch_add(stats.corrupt_entries, Ordering::Relaxed);
        self.bytes_reclaimed.fetch_add(stats.bytes_reclaimed, Ordering::Relaxed);
    }

    pub fn totals(&self) -> ReorgTotals {
        ReorgTotals {
            full_passes: self.full_passes.load(Ordering::Relaxed),
            sweep_steps: self.sweep_steps.load(Ordering::Relaxed),
            segments_cleaned: self.segments_cleaned.load(Ordering::Relaxed),
            segments_freed: self.segments_freed.load(Ordering::Relaxed),
            entries_dropped: self.entries_dropped.load(Ordering::Relaxed),
            corrupt_entries: self.corrupt_entries.load(Ordering::Relaxed),
            bytes_reclaimed: self.bytes_reclaimed.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the running reorganization thread
pub struct ReorgThread {
    coordinator: Arc<ReorgCoordinator>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ReorgThread {
    pub fn spawn(
        config: &Config,
        coordinator: Arc<ReorgCoordinator>,
        catalog: Arc<LogCatalog>,
        versions: Arc<VersionTable>,
        clock: Arc<Clock>,
    ) -> Result<Self> {
        let worker = ReorgWorker::new(
            config,
            Arc::clone(&coordinator),
            catalog,
            versions,
            clock,
            ReorgPolicy::default(),
        );
        let handle = std::thread::Builder::new()
            .name("chunklog-reorg".to_string())
            .spawn(move || worker.run())?;
        Ok(Self {
            coordinator,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop after the current step; waits at most `timeout`
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.coordinator.stop();
        join_bounded(&self.handle, timeout, "reorg")
    }
}
