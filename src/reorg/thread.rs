//! Reorganization thread
//!
//! ## Work Sources (highest priority first)
//! ```text
//!   urgent queue   writer out of space; caller blocks on a ticket
//!   request queue  threshold crossed or explicit request; full pass
//!   sweep          background; a few segments of one log at a time
//! ```
//! A full pass cleans every closed segment with stale bytes and merges the
//! log's versions back into the version table. A sweep step cleans the one
//! segment with the best cost-benefit score.
//!
//! The thread requests log access before working on a log and releases it
//! afterwards. Each segment clean additionally holds the log's own access
//! flag, which keeps the writer out of that log for the one segment only.
//! It never acquires pool buffers and never waits on the write buffer, so
//! it cannot block the threads that would have to grant access.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, trace};

use crate::config::Config;
use crate::log::{AccessFlag, LogCatalog, LogGeometry, RangeLog};
use crate::types::{Clock, RangeKey};
use crate::version::{VersionSnapshot, VersionTable};

use super::cleaner::{clean_segment, CleanStats};
use super::policy::{choose_segment, LogCandidate, ReorgPolicy};
use super::ReorgStats;

/// Idle wait between sweep attempts when nothing needed cleaning
const SWEEP_INTERVAL: Duration = Duration::from_millis(200);

/// Single wait for the access grant
const ACCESS_WAIT: Duration = Duration::from_millis(20);

/// Wait of an urgent caller before it grants access itself
const URGENT_WAIT: Duration = Duration::from_millis(20);

pub(crate) enum ReorgTask {
    Urgent(RangeKey, u64),
    Requested(RangeKey),
}

#[derive(Default)]
struct ReorgQueue {
    urgent: VecDeque<(RangeKey, u64)>,
    requested: VecDeque<RangeKey>,
    issued: u64,
    completed: u64,
}

impl ReorgQueue {
    fn pop(&mut self) -> Option<ReorgTask> {
        if let Some((key, ticket)) = self.urgent.pop_front() {
            return Some(ReorgTask::Urgent(key, ticket));
        }
        self.requested.pop_front().map(ReorgTask::Requested)
    }
}

// =============================================================================
// Coordinator
// =============================================================================

/// Shared front of the reorganization thread
pub struct ReorgCoordinator {
    queue: Mutex<ReorgQueue>,
    work: Condvar,
    done: Condvar,
    stopped: AtomicBool,
    access: Arc<AccessFlag>,
    stats: ReorgStats,
}

impl ReorgCoordinator {
    pub fn new(access: Arc<AccessFlag>) -> Self {
        Self {
            queue: Mutex::new(ReorgQueue::default()),
            work: Condvar::new(),
            done: Condvar::new(),
            stopped: AtomicBool::new(false),
            access,
            stats: ReorgStats::default(),
        }
    }

    pub fn access(&self) -> &Arc<AccessFlag> {
        &self.access
    }

    pub fn stats(&self) -> &ReorgStats {
        &self.stats
    }

    /// Queue a full pass over `key` (ignored if one is already queued)
    pub fn request(&self, key: RangeKey) {
        let mut queue = self.queue.lock();
        if !queue.requested.contains(&key) {
            queue.requested.push_back(key);
            self.work.notify_one();
        }
    }

    /// Run a full pass over `key` ahead of everything else and wait for it
    ///
    /// While waiting, grants a pending access request itself. Returns false
    /// if the thread stopped before the pass ran.
    pub fn reorganize_blocking(&self, key: RangeKey) -> bool {
        let mut queue = self.queue.lock();
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        queue.issued += 1;
        let ticket = queue.issued;
        queue.urgent.push_back((key, ticket));
        self.work.notify_one();

        while queue.completed < ticket {
            if self.stopped.load(Ordering::Acquire) {
                return false;
            }
            let timed_out = self.done.wait_for(&mut queue, URGENT_WAIT).timed_out();
            if timed_out && self.access.grant() {
                debug!(range = %key, "Granted log access while waiting on urgent reorganization");
            }
        }
        true
    }

    /// Stop the thread; pending urgent callers return false
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let _queue = self.queue.lock();
        self.work.notify_all();
        self.done.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Next queued task, waiting up to `wait` if there is none
    pub(crate) fn next_task(&self, wait: Option<Duration>) -> Option<ReorgTask> {
        let mut queue = self.queue.lock();
        if let Some(task) = queue.pop() {
            return Some(task);
        }
        if let Some(wait) = wait {
            if !self.stopped.load(Ordering::Acquire) {
                self.work.wait_for(&mut queue, wait);
            }
        }
        queue.pop()
    }

    pub(crate) fn complete(&self, ticket: u64) {
        let mut queue = self.queue.lock();
        queue.completed = queue.completed.max(ticket);
        self.done.notify_all();
    }
}

// =============================================================================
// Worker
// =============================================================================

/// State of the log the sweep is working on
struct Sweep {
    range: Arc<RangeLog>,
    snapshot: VersionSnapshot,
    remaining: usize,
}

pub(crate) struct ReorgWorker {
    coordinator: Arc<ReorgCoordinator>,
    catalog: Arc<LogCatalog>,
    versions: Arc<VersionTable>,
    clock: Arc<Clock>,
    policy: ReorgPolicy,
    rng: StdRng,
    age_threshold: u32,
    cold_threshold: u32,
    iterations_per_log: usize,
    segment_capacity: u32,
    sweep: Option<Sweep>,
}

impl ReorgWorker {
    pub(crate) fn new(
        config: &Config,
        coordinator: Arc<ReorgCoordinator>,
        catalog: Arc<LogCatalog>,
        versions: Arc<VersionTable>,
        clock: Arc<Clock>,
        policy: ReorgPolicy,
    ) -> Self {
        Self {
            coordinator,
            catalog,
            versions,
            clock,
            policy,
            rng: StdRng::from_entropy(),
            age_threshold: config.reorg_age_threshold_secs,
            cold_threshold: config.cold_data_threshold_secs,
            iterations_per_log: config.iterations_per_log(),
            segment_capacity: LogGeometry::from_config(config).entry_capacity() as u32,
            sweep: None,
        }
    }

    pub(crate) fn run(mut self) {
        debug!(iterations_per_log = self.iterations_per_log, "Reorganization thread started");
        let mut idle = false;

        while !self.coordinator.is_stopped() {
            let wait = idle.then_some(SWEEP_INTERVAL);
            match self.coordinator.next_task(wait) {
                Some(ReorgTask::Urgent(key, ticket)) => {
                    self.end_sweep();
                    self.reorganize_full(key);
                    self.coordinator.complete(ticket);
                    idle = false;
                }
                Some(ReorgTask::Requested(key)) => {
                    self.end_sweep();
                    self.reorganize_full(key);
                    idle = false;
                }
                None => idle = !self.sweep_step(),
            }
        }

        self.end_sweep();
        info!("Reorganization thread stopped");
    }

    /// Request access and wait for the grant; false once the thread stops
    fn acquire_access(&self) -> bool {
        let access = self.coordinator.access();
        access.request();
        loop {
            if access.wait_granted(ACCESS_WAIT) {
                return true;
            }
            if self.coordinator.is_stopped() {
                access.release();
                return false;
            }
            access.request();
        }
    }

    /// Clean every closed segment of `key` holding stale bytes
    fn reorganize_full(&mut self, key: RangeKey) {
        let Some(range) = self.catalog.get(key) else {
            trace!(range = %key, "Reorganization requested for unknown range");
            return;
        };
        if !self.acquire_access() {
            return;
        }

        let snapshot = self.versions.snapshot(key);
        let mut stats = CleanStats::default();
        for (index, _) in range.log.clean_candidates() {
            range.log.set_access_flag(true);
            let cleaned = clean_segment(&range.log, index, &snapshot);
            range.log.set_access_flag(false);
            match cleaned {
                Ok(cleaned) => stats += cleaned,
                Err(e) => {
                    error!(range = %key, segment = index, error = %e, "Segment cleaning failed");
                    break;
                }
            }
        }

        self.versions.rebuild(key, range.log.chunk_versions());
        range.log.rearm_reorg_signal();
        self.coordinator.access().release();
        self.coordinator.stats.record_full(&stats);

        info!(
            range = %key,
            segments = stats.segments_cleaned,
            freed = stats.segments_freed,
            reclaimed = stats.bytes_reclaimed,
            dropped = stats.entries_dropped,
            "Full reorganization finished"
        );
    }

    /// Clean one segment of the current sweep log; false if nothing was done
    fn sweep_step(&mut self) -> bool {
        if self.sweep.as_ref().map_or(true, |s| s.remaining == 0) {
            self.end_sweep();
            if !self.begin_sweep() {
                return false;
            }
        }
        let Some(sweep) = self.sweep.as_mut() else {
            return false;
        };

        sweep.remaining -= 1;
        let now = self.clock.now_secs();
        let candidates = sweep.range.log.clean_candidates();
        let Some(index) = choose_segment(&candidates, self.segment_capacity, now, self.cold_threshold) else {
            sweep.remaining = 0;
            return false;
        };

        sweep.range.log.set_access_flag(true);
        let cleaned = clean_segment(&sweep.range.log, index, &sweep.snapshot);
        sweep.range.log.set_access_flag(false);
        match cleaned {
            Ok(stats) => {
                self.coordinator.stats.record_sweep(&stats);
                stats.segments_cleaned > 0
            }
            Err(e) => {
                error!(range = %sweep.range.key, segment = index, error = %e, "Segment cleaning failed");
                sweep.remaining = 0;
                false
            }
        }
    }

    fn begin_sweep(&mut self) -> bool {
        let ranges = self.catalog.ranges();
        let now = self.clock.now_secs();
        let candidates: Vec<LogCandidate> = ranges
            .iter()
            .map(|r| LogCandidate {
                key: r.key,
                occupied: r.log.occupied_space(),
                needs_reorganization: r.log.needs_reorganization(now, self.age_threshold),
            })
            .collect();
        if !candidates.iter().any(|c| c.needs_reorganization) {
            return false;
        }

        let newest = self.catalog.newest();
        let Some(key) = self.policy.choose_log(&candidates, newest, &mut self.rng) else {
            return false;
        };
        let Some(range) = ranges.into_iter().find(|r| r.key == key) else {
            return false;
        };
        if !self.acquire_access() {
            return false;
        }

        trace!(range = %key, iterations = self.iterations_per_log, "Sweeping log");
        self.sweep = Some(Sweep {
            snapshot: self.versions.snapshot(key),
            range,
            remaining: self.iterations_per_log,
        });
        true
    }

    fn end_sweep(&mut self) {
        if let Some(sweep) = self.sweep.take() {
            sweep.range.log.rearm_reorg_signal();
            self.coordinator.access().release();
        }
    }
}
