//! Segment cleaner
//!
//! Reads one closed segment, keeps the entries that are still current and
//! hands them to `SecondaryLog::rewrite_segment`.
//!
//! An entry is dropped when
//! - its checksum fails or its header cannot be parsed (rest of segment), or
//! - both the version snapshot and the log's own location table hold a
//!   strictly newer version of the chunk; the location table only counts
//!   versions whose fragments are all in the log.
//!
//! Requiring both keeps entries whose newer version is still in flight:
//! the version table is stamped before the data reaches the log.
//!
//! Cleaning uses its own scratch memory and never waits on the buffer pool.

use std::ops::AddAssign;

use tracing::{trace, warn};

use crate::error::Result;
use crate::header::{SecondaryEntries, SecondaryHeader};
use crate::log::{SecondaryLog, Survivor, SEGMENT_HEADER_SIZE};
use crate::version::VersionSnapshot;

/// Work done by one or more cleaning passes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanStats {
    pub segments_cleaned: u64,
    pub segments_freed: u64,
    pub entries_kept: u64,
    pub entries_dropped: u64,
    pub corrupt_entries: u64,
    pub bytes_reclaimed: u64,
}

impl AddAssign for CleanStats {
    fn add_assign(&mut self, other: Self) {
        self.segments_cleaned += other.segments_cleaned;
        self.segments_freed += other.segments_freed;
        self.entries_kept += other.entries_kept;
        self.entries_dropped += other.entries_dropped;
        self.corrupt_entries += other.corrupt_entries;
        self.bytes_reclaimed += other.bytes_reclaimed;
    }
}

/// Whether an entry has been superseded
fn is_stale(log: &SecondaryLog, snapshot: &VersionSnapshot, header: &SecondaryHeader) -> bool {
    let durable_newer = log
        .current_version(header.chunk_id)
        .map_or(false, |v| v > header.version);
    let known_newer = snapshot
        .get(header.chunk_id)
        .map_or(true, |v| v > header.version);
    durable_newer && known_newer
}

/// Clean segment `index` of `log`
///
/// Returns empty stats when the segment is free, open, or has nothing to
/// drop; such a segment is not rewritten.
pub fn clean_segment(log: &SecondaryLog, index: usize, snapshot: &VersionSnapshot) -> Result<CleanStats> {
    let mut stats = CleanStats::default();
    let Some((info, data)) = log.read_segment(index, false)? else {
        return Ok(stats);
    };

    let key = log.key();
    let body = &data[SEGMENT_HEADER_SIZE..];
    let mut survivors = Vec::new();
    let mut kept = Vec::with_capacity(body.len());
    let mut dropped = 0u64;
    let mut corrupt = 0u64;

    for item in SecondaryEntries::new(body, key.owner) {
        let (offset, header, payload) = match item {
            Ok(entry) => entry,
            Err(e) => {
                warn!(range = %key, segment = index, error = %e, "Unreadable entry, dropping rest of segment");
                corrupt += 1;
                break;
            }
        };
        let len = header.encoded_len() + payload.len();

        if !header.verify(payload) {
            warn!(range = %key, chunk = %header.chunk_id, "Checksum mismatch, dropping entry");
            corrupt += 1;
            continue;
        }
        if is_stale(log, snapshot, &header) {
            dropped += 1;
            continue;
        }

        survivors.push(Survivor {
            chunk_id: header.chunk_id,
            version: header.version,
            old_offset: (SEGMENT_HEADER_SIZE + offset) as u32,
            len: len as u32,
        });
        kept.extend_from_slice(&body[offset..offset + len]);
    }

    if dropped == 0 && corrupt == 0 {
        trace!(range = %key, segment = index, "Nothing to drop, segment left as is");
        return Ok(stats);
    }

    let result = log.rewrite_segment(index, info.sequence, &survivors, &kept)?;
    stats.segments_cleaned = 1;
    stats.segments_freed = u64::from(result.target != Some(index));
    stats.entries_kept = survivors.len() as u64;
    stats.entries_dropped = dropped;
    stats.corrupt_entries = corrupt;
    stats.bytes_reclaimed = result.reclaimed as u64;

    trace!(
        range = %key,
        segment = index,
        target = ?result.target,
        kept = stats.entries_kept,
        dropped,
        corrupt,
        reclaimed = stats.bytes_reclaimed,
        "Cleaned segment"
    );
    Ok(stats)
}
