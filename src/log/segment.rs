//! Segment bookkeeping
//!
//! Per-segment counters and the location table of one secondary log. Both
//! live in memory only and are rebuilt by scanning the log on open.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::header::ChainInfo;
use crate::types::ChunkId;
use crate::version::Version;

/// Bytes at the start of every segment holding its append sequence
/// (0 marks a free segment)
pub const SEGMENT_HEADER_SIZE: usize = 8;

/// In-memory state of one segment
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Append order of the segment's content; 0 = free
    pub sequence: u64,
    /// Entry bytes written after the segment header
    pub used: u32,
    /// Entry bytes still referenced by the location table
    pub live: u32,
    /// Engine time the segment was opened
    pub created: u32,
    /// Engine time of the newest entry
    pub last_write: u32,
}

impl SegmentInfo {
    pub fn is_free(&self) -> bool {
        self.sequence == 0
    }

    pub fn stale(&self) -> u32 {
        self.used.saturating_sub(self.live)
    }

    /// Live bytes relative to the segment's entry capacity
    pub fn utilization(&self, capacity: u32) -> f64 {
        if capacity == 0 {
            return 0.0;
        }
        self.live as f64 / capacity as f64
    }

    pub fn age(&self, now: u32) -> u32 {
        now.saturating_sub(self.last_write)
    }
}

/// Usage of one segment as shown in reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentUsage {
    pub index: u32,
    pub used: u32,
    pub live: u32,
    pub sequence: u64,
}

// =============================================================================
// Location Table
// =============================================================================

/// Where one fragment of a chunk is stored
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FragmentLocation {
    pub segment: u32,
    /// Offset of the header from the start of the segment
    pub offset: u32,
    /// Header + payload bytes
    pub len: u32,
}

/// Fragments of one version of a chunk, indexed by chain position
#[derive(Debug, Clone)]
struct VersionFragments {
    version: Version,
    fragments: Vec<Option<FragmentLocation>>,
}

impl VersionFragments {
    fn new(version: Version, count: usize) -> Self {
        Self {
            version,
            fragments: vec![None; count.max(1)],
        }
    }

    fn is_complete(&self) -> bool {
        self.fragments.iter().all(Option::is_some)
    }

    fn locations(&self) -> impl Iterator<Item = &FragmentLocation> {
        self.fragments.iter().flatten()
    }

    fn drop_live(&self, segments: &mut [SegmentInfo]) {
        for old in self.locations() {
            if let Some(segment) = segments.get_mut(old.segment as usize) {
                segment.live = segment.live.saturating_sub(old.len);
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
struct ChunkLocation {
    /// Newest version with every fragment in the log
    durable: Option<VersionFragments>,
    /// Newer chained version still missing fragments
    partial: Option<VersionFragments>,
}

impl ChunkLocation {
    fn newest(&self) -> Option<Version> {
        self.partial
            .as_ref()
            .or(self.durable.as_ref())
            .map(|f| f.version)
    }

    fn all_mut(&mut self) -> impl Iterator<Item = &mut VersionFragments> {
        self.durable.iter_mut().chain(self.partial.iter_mut())
    }
}

/// Latest durable version of every chunk in one log and where its
/// fragments are; drives the per-segment live byte counters
///
/// A chained version only replaces the previous one once all of its
/// fragments were recorded. Until then both stay live, so cleaning never
/// drops the last complete copy of a chunk.
#[derive(Debug, Default)]
pub struct LocationTable {
    chunks: HashMap<ChunkId, ChunkLocation>,
}

impl LocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fragment that was just written
    ///
    /// Returns whether the fragment is live. A newer complete version makes
    /// the fragments of the previous one stale.
    pub fn record(
        &mut self,
        chunk_id: ChunkId,
        version: Version,
        chain: Option<ChainInfo>,
        location: FragmentLocation,
        segments: &mut [SegmentInfo],
    ) -> bool {
        let (index, count) = chain.map_or((0, 1), |c| (c.index as usize, c.count as usize));
        if index >= count.max(1) {
            return false;
        }

        let chunk = self.chunks.entry(chunk_id).or_default();
        if chunk.durable.as_ref().map_or(false, |d| version <= d.version) {
            return false;
        }

        let replace = match &chunk.partial {
            Some(partial) if version < partial.version => return false,
            Some(partial) => version > partial.version || partial.fragments.len() != count.max(1),
            None => true,
        };
        if replace {
            if let Some(older) = chunk.partial.take() {
                older.drop_live(segments);
            }
            chunk.partial = Some(VersionFragments::new(version, count));
        }

        let Some(partial) = chunk.partial.as_mut() else {
            return false;
        };
        if let Some(previous) = partial.fragments[index].replace(location) {
            if let Some(segment) = segments.get_mut(previous.segment as usize) {
                segment.live = segment.live.saturating_sub(previous.len);
            }
        }
        if let Some(segment) = segments.get_mut(location.segment as usize) {
            segment.live += location.len;
        }

        if partial.is_complete() {
            if let Some(old) = chunk.durable.take() {
                old.drop_live(segments);
            }
            chunk.durable = chunk.partial.take();
        }
        true
    }

    /// Newest complete version of a chunk present in the log
    pub fn current(&self, chunk_id: ChunkId) -> Option<Version> {
        self.chunks
            .get(&chunk_id)
            .and_then(|c| c.durable.as_ref())
            .map(|d| d.version)
    }

    /// Point a live fragment at its new place; false if it was not live
    pub fn relocate(
        &mut self,
        chunk_id: ChunkId,
        version: Version,
        from: FragmentLocation,
        to: FragmentLocation,
    ) -> bool {
        let Some(chunk) = self.chunks.get_mut(&chunk_id) else {
            return false;
        };
        let Some(fragments) = chunk.all_mut().find(|f| f.version == version) else {
            return false;
        };
        match fragments
            .fragments
            .iter_mut()
            .flatten()
            .find(|f| f.segment == from.segment && f.offset == from.offset)
        {
            Some(fragment) => {
                *fragment = to;
                true
            }
            None => false,
        }
    }

    /// Forget every fragment pointing into a segment about to be freed or
    /// rewritten, except those at `keep_offsets` (ascending, pre-rewrite
    /// offsets); the chunk versions are kept
    pub fn forget_segment(&mut self, segment: u32, keep_offsets: &[u32]) {
        for chunk in self.chunks.values_mut() {
            for version in chunk.all_mut() {
                for slot in version.fragments.iter_mut() {
                    if slot.map_or(false, |f| {
                        f.segment == segment && keep_offsets.binary_search(&f.offset).is_err()
                    }) {
                        *slot = None;
                    }
                }
            }
        }
    }

    /// Newest version of every chunk in the log, complete or not
    ///
    /// Partial versions are included so a restarted version table never
    /// hands out a version that already has fragments on disk.
    pub fn versions(&self) -> Vec<(ChunkId, Version)> {
        self.chunks
            .iter()
            .filter_map(|(id, c)| c.newest().map(|v| (*id, v)))
            .collect()
    }
}
