//! Log Catalog
//!
//! Maps every backup range to its secondary log and secondary log buffer.
//! Entries are created lazily on the first write to a range and live until
//! the range is removed or the engine shuts down.
//!
//! ## Concurrency:
//! - `ranges`: RwLock, read-locked on every lookup
//! - `create_lock`: held only while a new log file is created, so two
//!   producers of a new range never create its file twice

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::error::Result;
use crate::types::{Clock, RangeKey};

use super::{LogGeometry, ScanReport, SecondaryLog, SecondaryLogBuffer};

/// Secondary log and staging buffer of one range
pub struct RangeLog {
    pub key: RangeKey,
    pub log: SecondaryLog,
    pub buffer: Mutex<SecondaryLogBuffer>,
    /// Creation order within this engine run
    pub created: u64,
}

/// All ranges known to the engine
pub struct LogCatalog {
    dir: PathBuf,
    geometry: LogGeometry,
    buffer_size: usize,
    clock: Arc<Clock>,
    ranges: RwLock<HashMap<RangeKey, Arc<RangeLog>>>,
    create_lock: Mutex<()>,
    next_created: AtomicU64,
}

impl LogCatalog {
    pub fn new(dir: &Path, geometry: LogGeometry, buffer_size: usize, clock: Arc<Clock>) -> Self {
        Self {
            dir: dir.to_path_buf(),
            geometry,
            buffer_size,
            clock,
            ranges: RwLock::new(HashMap::new()),
            create_lock: Mutex::new(()),
            next_created: AtomicU64::new(1),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Open every secondary log already present in the directory
    pub fn open_existing(&self) -> Result<Vec<(RangeKey, ScanReport)>> {
        fs::create_dir_all(&self.dir)?;

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.is_file() {
                if let Some(key) = RangeKey::from_log_path(&path) {
                    found.push((key, path));
                }
            }
        }
        found.sort();

        let mut reports = Vec::with_capacity(found.len());
        let mut ranges = self.ranges.write();
        for (key, path) in found {
            let (log, report) = SecondaryLog::open(&path, key, self.geometry, Arc::clone(&self.clock))?;
            ranges.insert(key, Arc::new(self.wrap(key, log)));
            reports.push((key, report));
        }

        if !reports.is_empty() {
            info!(ranges = reports.len(), dir = %self.dir.display(), "Reopened secondary logs");
        }
        Ok(reports)
    }

    /// Log of a range, created on first use
    pub fn get_or_create(&self, key: RangeKey) -> Result<Arc<RangeLog>> {
        if let Some(range) = self.ranges.read().get(&key) {
            return Ok(Arc::clone(range));
        }

        let _creating = self.create_lock.lock();
        if let Some(range) = self.ranges.read().get(&key) {
            return Ok(Arc::clone(range));
        }

        let path = self.dir.join(key.log_file_name());
        let log = SecondaryLog::create(&path, key, self.geometry, Arc::clone(&self.clock))?;
        let range = Arc::new(self.wrap(key, log));
        self.ranges.write().insert(key, Arc::clone(&range));
        debug!(range = %key, "Registered backup range");
        Ok(range)
    }

    pub fn get(&self, key: RangeKey) -> Option<Arc<RangeLog>> {
        self.ranges.read().get(&key).cloned()
    }

    /// All ranges, ordered by key
    pub fn ranges(&self) -> Vec<Arc<RangeLog>> {
        let mut ranges: Vec<Arc<RangeLog>> = self.ranges.read().values().cloned().collect();
        ranges.sort_by_key(|r| r.key);
        ranges
    }

    /// Most recently created range
    pub fn newest(&self) -> Option<RangeKey> {
        self.ranges
            .read()
            .values()
            .max_by_key(|r| r.created)
            .map(|r| r.key)
    }

    pub fn len(&self) -> usize {
        self.ranges.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.read().is_empty()
    }

    /// Drop a range and delete its log file
    pub fn remove(&self, key: RangeKey) -> Result<Option<Arc<RangeLog>>> {
        let _creating = self.create_lock.lock();
        let removed = self.ranges.write().remove(&key);
        if let Some(range) = &removed {
            fs::remove_file(range.log.path())?;
            debug!(range = %key, "Removed backup range");
        }
        Ok(removed)
    }

    fn wrap(&self, key: RangeKey, log: SecondaryLog) -> RangeLog {
        RangeLog {
            key,
            log,
            buffer: Mutex::new(SecondaryLogBuffer::new(self.buffer_size)),
            created: self.next_created.fetch_add(1, Ordering::Relaxed),
        }
    }
}
