//! Version Table
//!
//! In-memory map from chunk id to its latest version, partitioned by backup
//! range. The table is not durable; it is rebuilt from the secondary logs when
//! the engine opens.
//!
//! ## Concurrency:
//! - `ranges`: RwLock, write-locked only when a range partition is created
//!   or dropped
//! - each partition: its own Mutex, so producers of different ranges never
//!   contend

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::types::{ChunkId, RangeKey};

use super::Version;

type Partition = Arc<Mutex<HashMap<ChunkId, Version>>>;

/// Latest known version of every chunk, per range
#[derive(Debug, Default)]
pub struct VersionTable {
    ranges: RwLock<HashMap<RangeKey, Partition>>,
}

/// Frozen copy of one range partition, used to classify entries while a log
/// is reorganized
#[derive(Debug, Clone, Default)]
pub struct VersionSnapshot {
    versions: HashMap<ChunkId, Version>,
}

impl VersionSnapshot {
    pub fn get(&self, chunk_id: ChunkId) -> Option<Version> {
        self.versions.get(&chunk_id).copied()
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp a new write of `chunk_id`
    pub fn next_version(&self, key: RangeKey, chunk_id: ChunkId) -> Version {
        let partition = self.partition(key);
        let mut versions = partition.lock();
        let next = versions
            .get(&chunk_id)
            .map(|current| current.next())
            .unwrap_or(Version::INITIAL);
        versions.insert(chunk_id, next);
        next
    }

    /// Stamp a removal of `chunk_id`; the returned version is a tombstone
    /// newer than anything handed out before
    pub fn mark_removed(&self, key: RangeKey, chunk_id: ChunkId) -> Version {
        let partition = self.partition(key);
        let mut versions = partition.lock();
        let tombstone = match versions.get(&chunk_id) {
            None => Version::tombstone(0),
            Some(current) if current.is_tombstone() => {
                Version::tombstone(current.epoch.wrapping_add(1))
            }
            Some(current) => Version::tombstone(current.epoch),
        };
        versions.insert(chunk_id, tombstone);
        tombstone
    }

    /// Latest version of `chunk_id`, if the chunk was ever written
    pub fn current(&self, key: RangeKey, chunk_id: ChunkId) -> Option<Version> {
        let ranges = self.ranges.read();
        let partition = ranges.get(&key)?;
        let version = partition.lock().get(&chunk_id).copied();
        version
    }

    /// Copy of all versions of one range
    pub fn snapshot(&self, key: RangeKey) -> VersionSnapshot {
        let ranges = self.ranges.read();
        match ranges.get(&key) {
            Some(partition) => VersionSnapshot {
                versions: partition.lock().clone(),
            },
            None => VersionSnapshot::default(),
        }
    }

    /// Record a version found on disk; never lowers a known version
    pub fn observe(&self, key: RangeKey, chunk_id: ChunkId, version: Version) {
        let partition = self.partition(key);
        let mut versions = partition.lock();
        let slot = versions.entry(chunk_id).or_insert(version);
        if version > *slot {
            *slot = version;
        }
    }

    /// Merge the versions found by a full pass over a range's log
    pub fn rebuild<I>(&self, key: RangeKey, found: I)
    where
        I: IntoIterator<Item = (ChunkId, Version)>,
    {
        let partition = self.partition(key);
        let mut versions = partition.lock();
        for (chunk_id, version) in found {
            let slot = versions.entry(chunk_id).or_insert(version);
            if version > *slot {
                *slot = version;
            }
        }
    }

    /// Drop the partition of a deleted range
    pub fn remove_range(&self, key: RangeKey) {
        self.ranges.write().remove(&key);
    }

    /// Number of chunks tracked for a range
    pub fn range_len(&self, key: RangeKey) -> usize {
        self.ranges
            .read()
            .get(&key)
            .map(|partition| partition.lock().len())
            .unwrap_or(0)
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn partition(&self, key: RangeKey) -> Partition {
        if let Some(partition) = self.ranges.read().get(&key) {
            return Arc::clone(partition);
        }
        let mut ranges = self.ranges.write();
        Arc::clone(ranges.entry(key).or_default())
    }
}
