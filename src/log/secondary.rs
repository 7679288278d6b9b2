//! Secondary Log
//!
//! One fixed-size file per backup range, divided into equally sized
//! segments. Entries are appended to the open segment and never split
//! across segments.
//!
//! ## Segment Layout
//! ```text
//! ┌──────────────┬─────────┬─────────┬─────┬───┬──────────────┐
//! │ Sequence (8) │ Entry 1 │ Entry 2 │ ... │ 0 │   (unused)   │
//! └──────────────┴─────────┴─────────┴─────┴───┴──────────────┘
//!   sequence 0 = free segment, a zero type byte ends the entries
//! ```
//!
//! ## Concurrency:
//! - `state`: segment table + location table, held for a whole append or
//!   segment rewrite so placement decisions and counters stay consistent
//! - `file`: positioned reads and writes; always taken after `state` when
//!   both are needed
//! - the writer only appends to the open segment; the reorganizer never
//!   cleans the open segment
//! - `access`: cooperative claim on the segments, held by the writer for
//!   one append or by the reorganizer for one segment clean, never both
//!
//! ```text
//!            begin_write()                  set_access_flag(true)
//!   Writer ◄─────────────── Free ──────────────────────────► Reorganizer
//!          ── guard drop ──►     ◄── set_access_flag(false) ──
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::Mutex;
use tracing::{debug, error, trace, warn};

use crate::error::{LogError, Result};
use crate::header::{SecondaryEntries, SecondaryHeader};
use crate::types::{ChunkId, Clock, RangeKey};
use crate::version::Version;

use super::segment::{FragmentLocation, LocationTable, SegmentInfo, SegmentUsage, SEGMENT_HEADER_SIZE};
use super::LogGeometry;

/// Result of one append call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Bytes of the input that were written (always whole entries)
    pub written: usize,
    /// The log ran out of free segments before everything was written
    pub out_of_space: bool,
    /// Occupied space just crossed the reorganization threshold
    pub reorg_due: bool,
}

/// An entry kept by the cleaner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Survivor {
    pub chunk_id: ChunkId,
    pub version: Version,
    /// Offset of the entry in the segment before the rewrite
    pub old_offset: u32,
    /// Header + payload bytes
    pub len: u32,
}

/// Result of a segment rewrite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RewriteResult {
    /// Segment now holding the survivors (`None` if nothing survived)
    pub target: Option<usize>,
    pub reclaimed: u32,
}

/// Counters of a scan on open
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub segments: usize,
    pub entries: usize,
    pub corrupt: usize,
    pub newest_timestamp: u32,
}

struct LogState {
    segments: Vec<SegmentInfo>,
    open: Option<usize>,
    next_sequence: u64,
    locations: LocationTable,
}

impl LogState {
    fn new(segment_count: usize) -> Self {
        Self {
            segments: vec![SegmentInfo::default(); segment_count],
            open: None,
            next_sequence: 1,
            locations: LocationTable::new(),
        }
    }

    fn occupied(&self) -> u64 {
        self.segments.iter().map(|s| s.used as u64).sum()
    }

    fn free_segment(&self, exclude: Option<usize>) -> Option<usize> {
        self.segments
            .iter()
            .enumerate()
            .find(|(i, s)| s.is_free() && Some(*i) != exclude && Some(*i) != self.open)
            .map(|(i, _)| i)
    }

    /// Draw a free segment and make it the open one
    fn open_segment(&mut self, now: u32) -> Option<usize> {
        let index = self.free_segment(None)?;
        self.segments[index] = SegmentInfo {
            sequence: self.next_sequence,
            created: now,
            last_write: now,
            ..SegmentInfo::default()
        };
        self.next_sequence += 1;
        self.open = Some(index);
        Some(index)
    }
}

/// Segmented append-only log of one backup range
pub struct SecondaryLog {
    key: RangeKey,
    path: PathBuf,
    geometry: LogGeometry,
    clock: Arc<Clock>,
    file: Mutex<File>,
    state: Mutex<LogState>,
    degraded: AtomicBool,
    reorg_signalled: AtomicBool,
    access: AtomicU8,
}

const ACCESS_FREE: u8 = 0;
const ACCESS_WRITER: u8 = 1;
const ACCESS_REORGANIZER: u8 = 2;

/// Writer claim on a log's segments, released on drop
pub struct WriteAccess<'a> {
    log: &'a SecondaryLog,
}

impl Drop for WriteAccess<'_> {
    fn drop(&mut self) {
        self.log.access.store(ACCESS_FREE, Ordering::Release);
    }
}

impl SecondaryLog {
    /// Create an empty log file (truncating any previous one)
    pub fn create(path: &Path, key: RangeKey, geometry: LogGeometry, clock: Arc<Clock>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(geometry.log_size() as u64)?;

        debug!(range = %key, path = %path.display(), "Created secondary log");

        Ok(Self::assemble(path, key, geometry, clock, file, LogState::new(geometry.segment_count)))
    }

    /// Open an existing log and rebuild its segment and location tables
    pub fn open(
        path: &Path,
        key: RangeKey,
        geometry: LogGeometry,
        clock: Arc<Clock>,
    ) -> Result<(Self, ScanReport)> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len != geometry.log_size() as u64 {
            return Err(LogError::Config(format!(
                "secondary log {} is {} bytes, expected {}",
                path.display(),
                len,
                geometry.log_size()
            )));
        }

        let mut state = LogState::new(geometry.segment_count);
        let mut report = ScanReport::default();

        // Sequences first: content is replayed in append order
        let mut order = Vec::new();
        let mut sequence_bytes = [0u8; SEGMENT_HEADER_SIZE];
        for index in 0..geometry.segment_count {
            file.seek(SeekFrom::Start(geometry.segment_offset(index)))?;
            file.read_exact(&mut sequence_bytes)?;
            let sequence = u64::from_le_bytes(sequence_bytes);
            if sequence != 0 {
                order.push((sequence, index));
            }
        }
        order.sort_unstable();

        let mut data = vec![0u8; geometry.segment_size];
        for (sequence, index) in order {
            file.seek(SeekFrom::Start(geometry.segment_offset(index)))?;
            file.read_exact(&mut data)?;

            state.segments[index].sequence = sequence;
            state.next_sequence = state.next_sequence.max(sequence + 1);

            let mut created = u32::MAX;
            let mut last_write = 0;
            let mut entries = SecondaryEntries::new(&data[SEGMENT_HEADER_SIZE..], key.owner);
            for item in entries.by_ref() {
                let (offset, header, payload) = match item {
                    Ok(entry) => entry,
                    Err(e) => {
                        warn!(range = %key, segment = index, error = %e, "Corrupt entry while scanning, truncating segment");
                        report.corrupt += 1;
                        break;
                    }
                };
                report.entries += 1;

                if let Some(ts) = header.timestamp {
                    created = created.min(ts);
                    last_write = last_write.max(ts);
                }
                if !header.verify(payload) {
                    warn!(range = %key, chunk = %header.chunk_id, "Checksum mismatch while scanning");
                    report.corrupt += 1;
                    continue;
                }

                let location = FragmentLocation {
                    segment: index as u32,
                    offset: (SEGMENT_HEADER_SIZE + offset) as u32,
                    len: (header.encoded_len() + payload.len()) as u32,
                };
                let st = &mut state;
                st.locations.record(
                    header.chunk_id,
                    header.version,
                    header.chain,
                    location,
                    &mut st.segments,
                );
            }

            let segment = &mut state.segments[index];
            segment.used = entries.offset() as u32;
            segment.created = if created == u32::MAX { 0 } else { created };
            segment.last_write = last_write;
            report.segments += 1;
            report.newest_timestamp = report.newest_timestamp.max(last_write);
        }

        debug!(
            range = %key,
            segments = report.segments,
            entries = report.entries,
            corrupt = report.corrupt,
            "Opened secondary log"
        );

        let log = Self::assemble(path, key, geometry, clock, file, state);
        let occupied = log.occupied_space();
        log.reorg_signalled
            .store(occupied >= geometry.activation_bytes, Ordering::Release);
        Ok((log, report))
    }

    fn assemble(
        path: &Path,
        key: RangeKey,
        geometry: LogGeometry,
        clock: Arc<Clock>,
        file: File,
        state: LogState,
    ) -> Self {
        Self {
            key,
            path: path.to_path_buf(),
            geometry,
            clock,
            file: Mutex::new(file),
            state: Mutex::new(state),
            degraded: AtomicBool::new(false),
            reorg_signalled: AtomicBool::new(false),
            access: AtomicU8::new(ACCESS_FREE),
        }
    }

    pub fn key(&self) -> RangeKey {
        self.key
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn geometry(&self) -> LogGeometry {
        self.geometry
    }

    // =========================================================================
    // Append
    // =========================================================================

    /// Append a run of secondary-form entries
    ///
    /// Writes as many whole entries as fit into the open segment and fresh
    /// segments. When no free segment is left the outcome reports
    /// `out_of_space` and how much was written; the caller decides whether
    /// to reorganize and retry with the rest.
    pub fn append(&self, data: &[u8]) -> Result<AppendOutcome> {
        if self.is_degraded() {
            return Err(LogError::Degraded(self.key.to_string()));
        }

        let capacity = self.geometry.entry_capacity();
        let mut bounds: Vec<(usize, usize, SecondaryHeader)> = Vec::new();
        for item in SecondaryEntries::new(data, self.key.owner) {
            let (offset, header, payload) = item?;
            let end = offset + header.encoded_len() + payload.len();
            if end - offset > capacity {
                return Err(LogError::CapacityExceeded(format!(
                    "entry of {} bytes does not fit a segment of {} bytes",
                    end - offset,
                    capacity
                )));
            }
            bounds.push((offset, end, header));
        }

        let now = self.clock.now_secs();
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let mut file = self.file.lock();
        let mut outcome = AppendOutcome::default();
        let mut next = 0;

        while next < bounds.len() {
            let segment = match state.open {
                Some(segment) => segment,
                None => match state.open_segment(now) {
                    Some(segment) => segment,
                    None => {
                        outcome.out_of_space = true;
                        break;
                    }
                },
            };

            let used = state.segments[segment].used as usize;
            let run_start = bounds[next].0;
            let mut run_end = run_start;
            let mut last = next;
            while last < bounds.len() && bounds[last].1 - run_start <= capacity - used {
                run_end = bounds[last].1;
                last += 1;
            }

            if last == next {
                // Next entry does not fit, close the segment
                state.open = None;
                continue;
            }

            let base = self.geometry.segment_offset(segment);
            if used == 0 {
                file.seek(SeekFrom::Start(base))?;
                file.write_all(&state.segments[segment].sequence.to_le_bytes())?;
            }
            let run_len = run_end - run_start;
            file.seek(SeekFrom::Start(base + (SEGMENT_HEADER_SIZE + used) as u64))?;
            file.write_all(&data[run_start..run_end])?;
            if used + run_len < capacity {
                file.write_all(&[0u8])?;
            }

            for (offset, end, header) in &bounds[next..last] {
                let location = FragmentLocation {
                    segment: segment as u32,
                    offset: (SEGMENT_HEADER_SIZE + used + (offset - run_start)) as u32,
                    len: (end - offset) as u32,
                };
                state.locations.record(
                    header.chunk_id,
                    header.version,
                    header.chain,
                    location,
                    &mut state.segments,
                );
            }

            let info = &mut state.segments[segment];
            info.used += run_len as u32;
            info.last_write = now;
            if info.used as usize == capacity {
                state.open = None;
            }

            outcome.written = run_end;
            next = last;
        }

        if state.occupied() >= self.geometry.activation_bytes {
            outcome.reorg_due = !self.reorg_signalled.swap(true, Ordering::AcqRel);
        }

        Ok(outcome)
    }

    // =========================================================================
    // Reading
    // =========================================================================

    /// Segments holding data, in append order
    pub fn segments_in_order(&self) -> Vec<(usize, SegmentInfo)> {
        let state = self.state.lock();
        let mut segments: Vec<(usize, SegmentInfo)> = state
            .segments
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, s)| !s.is_free())
            .collect();
        segments.sort_by_key(|(i, s)| (s.sequence, *i));
        segments
    }

    /// Read a segment's header and entries (`[0, SEGMENT_HEADER_SIZE + used)`)
    ///
    /// Returns `None` for a free segment, or for the open segment unless
    /// `include_open` is set.
    pub fn read_segment(&self, index: usize, include_open: bool) -> Result<Option<(SegmentInfo, Vec<u8>)>> {
        let info = {
            let state = self.state.lock();
            let Some(info) = state.segments.get(index).copied() else {
                return Err(LogError::InvalidArgument(format!(
                    "segment {} out of range for log {}",
                    index, self.key
                )));
            };
            if info.is_free() || (!include_open && state.open == Some(index)) {
                return Ok(None);
            }
            info
        };

        let mut data = vec![0u8; SEGMENT_HEADER_SIZE + info.used as usize];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.geometry.segment_offset(index)))?;
        file.read_exact(&mut data)?;
        Ok(Some((info, data)))
    }

    // =========================================================================
    // Reorganization Support
    // =========================================================================

    /// Segments the reorganizer may clean: in use, not open, holding stale bytes
    pub fn clean_candidates(&self) -> Vec<(usize, SegmentInfo)> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .copied()
            .enumerate()
            .filter(|(i, s)| !s.is_free() && state.open != Some(*i) && s.stale() > 0)
            .collect()
    }

    /// Newest durable version of a chunk in this log
    pub fn current_version(&self, chunk_id: ChunkId) -> Option<Version> {
        self.state.lock().locations.current(chunk_id)
    }

    /// Current version of every chunk in this log
    pub fn chunk_versions(&self) -> Vec<(ChunkId, Version)> {
        self.state.lock().locations.versions()
    }

    /// Replace a segment by its survivors
    ///
    /// Survivors (already concatenated in `data`) go to a free segment when
    /// one exists, otherwise the segment is rewritten in place. The new
    /// segment inherits the old sequence so recovery order is unchanged.
    pub fn rewrite_segment(
        &self,
        index: usize,
        sequence: u64,
        survivors: &[Survivor],
        data: &[u8],
    ) -> Result<RewriteResult> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        let old = state.segments[index];
        if old.sequence != sequence || state.open == Some(index) {
            return Err(LogError::InvalidArgument(format!(
                "segment {} of log {} changed while it was cleaned",
                index, self.key
            )));
        }

        let mut file = self.file.lock();
        let keep: Vec<u32> = survivors.iter().map(|s| s.old_offset).collect();
        state.locations.forget_segment(index as u32, &keep);

        if survivors.is_empty() {
            file.seek(SeekFrom::Start(self.geometry.segment_offset(index)))?;
            file.write_all(&[0u8; SEGMENT_HEADER_SIZE])?;
            state.segments[index] = SegmentInfo::default();
            return Ok(RewriteResult {
                target: None,
                reclaimed: old.used,
            });
        }

        let target = state.free_segment(Some(index)).unwrap_or(index);
        let mut bytes = Vec::with_capacity(SEGMENT_HEADER_SIZE + data.len() + 1);
        bytes.extend_from_slice(&sequence.to_le_bytes());
        bytes.extend_from_slice(data);
        if data.len() < self.geometry.entry_capacity() {
            bytes.push(0);
        }
        file.seek(SeekFrom::Start(self.geometry.segment_offset(target)))?;
        file.write_all(&bytes)?;

        if target != index {
            file.seek(SeekFrom::Start(self.geometry.segment_offset(index)))?;
            file.write_all(&[0u8; SEGMENT_HEADER_SIZE])?;
            state.segments[index] = SegmentInfo::default();
        }

        let mut live = 0u32;
        let mut offset = SEGMENT_HEADER_SIZE as u32;
        for survivor in survivors {
            let from = FragmentLocation {
                segment: index as u32,
                offset: survivor.old_offset,
                len: survivor.len,
            };
            let to = FragmentLocation {
                segment: target as u32,
                offset,
                len: survivor.len,
            };
            if state
                .locations
                .relocate(survivor.chunk_id, survivor.version, from, to)
            {
                live += survivor.len;
            }
            offset += survivor.len;
        }

        state.segments[target] = SegmentInfo {
            sequence,
            used: data.len() as u32,
            live,
            created: old.created,
            last_write: old.last_write,
        };

        Ok(RewriteResult {
            target: Some(target),
            reclaimed: old.used.saturating_sub(data.len() as u32),
        })
    }

    /// Re-arm the threshold signal once occupancy dropped below it
    pub fn rearm_reorg_signal(&self) {
        if self.occupied_space() < self.geometry.activation_bytes {
            self.reorg_signalled.store(false, Ordering::Release);
        }
    }

    /// Whether background reorganization should look at this log
    pub fn needs_reorganization(&self, now: u32, age_threshold: u32) -> bool {
        let state = self.state.lock();
        if state.occupied() >= self.geometry.activation_bytes {
            return true;
        }
        state
            .segments
            .iter()
            .enumerate()
            .any(|(i, s)| {
                !s.is_free() && state.open != Some(i) && s.stale() > 0 && s.age(now) >= age_threshold
            })
    }

    // =========================================================================
    // Introspection
    // =========================================================================

    /// Entry bytes stored in all segments
    pub fn occupied_space(&self) -> u64 {
        self.state.lock().occupied()
    }

    /// Entry bytes belonging to live versions
    pub fn live_bytes(&self) -> u64 {
        self.state.lock().segments.iter().map(|s| s.live as u64).sum()
    }

    /// Entry capacity of the whole log
    pub fn capacity(&self) -> u64 {
        (self.geometry.entry_capacity() * self.geometry.segment_count) as u64
    }

    pub fn free_segments(&self) -> usize {
        self.state.lock().segments.iter().filter(|s| s.is_free()).count()
    }

    /// Used and live bytes of every segment in use
    pub fn segment_distribution(&self) -> Vec<SegmentUsage> {
        let state = self.state.lock();
        state
            .segments
            .iter()
            .enumerate()
            .filter(|(_, s)| !s.is_free())
            .map(|(i, s)| SegmentUsage {
                index: i as u32,
                used: s.used,
                live: s.live,
                sequence: s.sequence,
            })
            .collect()
    }

    /// Snapshot of the full segment table
    pub fn segment_table(&self) -> Vec<SegmentInfo> {
        self.state.lock().segments.clone()
    }

    pub fn open_segment(&self) -> Option<usize> {
        self.state.lock().open
    }

    // =========================================================================
    // Access
    // =========================================================================

    /// Spin until the claim moves from free to `holder`
    fn claim(&self, holder: u8) {
        let backoff = Backoff::new();
        while self
            .access
            .compare_exchange_weak(ACCESS_FREE, holder, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            if backoff.is_completed() {
                thread::sleep(Duration::from_micros(50));
            } else {
                backoff.snooze();
            }
        }
    }

    /// Reorganizer: claim (`true`) or give back (`false`) the segments
    ///
    /// Claiming waits for an append in progress to finish.
    pub fn set_access_flag(&self, accessed: bool) {
        if accessed {
            self.claim(ACCESS_REORGANIZER);
        } else {
            let _ = self.access.compare_exchange(
                ACCESS_REORGANIZER,
                ACCESS_FREE,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
    }

    /// Whether the reorganizer is working on this log right now
    pub fn is_accessed(&self) -> bool {
        self.access.load(Ordering::Acquire) == ACCESS_REORGANIZER
    }

    /// Writer: claim the segments for one append
    ///
    /// Waits while the reorganizer cleans a segment of this log.
    pub fn begin_write(&self) -> WriteAccess<'_> {
        if self.is_accessed() {
            trace!(range = %self.key, "Waiting for the reorganizer to leave the log");
        }
        self.claim(ACCESS_WRITER);
        WriteAccess { log: self }
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    /// Stop accepting appends; reads keep working
    pub fn mark_degraded(&self, reason: &str) {
        if !self.degraded.swap(true, Ordering::AcqRel) {
            error!(range = %self.key, reason, "Secondary log degraded to read-only");
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }
}
