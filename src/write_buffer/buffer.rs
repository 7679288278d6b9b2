//! Write Buffer
//!
//! Multi-producer ring that stages framed entries until the process thread
//! distributes them.
//!
//! ## Positions (absolute, never wrap)
//! ```text
//!      read_pos            committed           reserved
//!         │   published       │   being copied    │    free
//!   ──────┼───────────────────┼───────────────────┼──────────────
//!         └── consumer owns ──┘└ producers own ───┘
//! ```
//! - `reserved` is advanced by producers with a CAS bounded by
//!   `read_pos + capacity`; every producer owns its reserved range
//! - `committed` is advanced in reservation order, so the consumer only
//!   ever sees fully written entries
//! - `read_pos` is advanced by the process thread after a flush round
//!
//! The metadata mutex guards the per-range pending table together with the
//! `committed` store and the flush generation. It is never held across I/O.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::Config;
use crate::error::{LogError, Result};
use crate::header::{checksum_parts, flags, FragmentPlan, HeaderLayout, PrimaryHeader};
use crate::types::{ChunkId, Clock, NodeId, RangeId, RangeKey};
use crate::version::Version;

use super::ring::RingBuffer;

/// Longest single park of a producer waiting for space
const SPACE_WAIT: Duration = Duration::from_millis(10);

/// Longest single park of a caller waiting for a flush round
const ROUND_WAIT: Duration = Duration::from_millis(50);

/// Identity and version of an entry to append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntrySpec {
    pub owner: NodeId,
    pub range_id: RangeId,
    pub chunk_id: ChunkId,
    pub version: Version,
}

impl EntrySpec {
    pub fn range_key(&self) -> RangeKey {
        RangeKey::new(self.owner, self.range_id)
    }
}

/// Region and routing table taken by one flush round
#[derive(Debug)]
pub struct FlushSnapshot {
    pub start: u64,
    pub end: u64,
    /// Bytes (framed, full header form) per range inside `[start, end)`
    pub pending: HashMap<RangeKey, u64>,
    pub generation: u64,
}

impl FlushSnapshot {
    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

#[derive(Default)]
struct PendingTable {
    ranges: HashMap<RangeKey, u64>,
    total: u64,
}

/// Shared staging ring between producers and the process thread
pub struct WriteBuffer {
    ring: RingBuffer,
    capacity: u64,
    write_capacity: usize,
    max_fragment: usize,
    flush_threshold: u64,
    layout: HeaderLayout,
    clock: Arc<Clock>,

    reserved: AtomicU64,
    committed: AtomicU64,
    read_pos: AtomicU64,

    meta: Mutex<PendingTable>,
    flush_started: AtomicU64,
    flush_completed: AtomicU64,

    flush_requested: AtomicBool,
    priority_flush: AtomicBool,
    stopped: AtomicBool,

    space_lock: Mutex<()>,
    space_freed: Condvar,
    work_lock: Mutex<()>,
    work_available: Condvar,
    round_lock: Mutex<()>,
    round_done: Condvar,
}

impl WriteBuffer {
    pub fn new(config: &Config, clock: Arc<Clock>) -> Self {
        Self {
            ring: RingBuffer::new(config.write_buffer_size),
            capacity: config.write_buffer_size as u64,
            write_capacity: config.write_capacity,
            max_fragment: config.max_fragment_size(),
            flush_threshold: config.flush_threshold_bytes() as u64,
            layout: HeaderLayout {
                checksums: config.use_checksums,
                timestamps: config.use_timestamps,
            },
            clock,
            reserved: AtomicU64::new(0),
            committed: AtomicU64::new(0),
            read_pos: AtomicU64::new(0),
            meta: Mutex::new(PendingTable::default()),
            flush_started: AtomicU64::new(0),
            flush_completed: AtomicU64::new(0),
            flush_requested: AtomicBool::new(false),
            priority_flush: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            space_lock: Mutex::new(()),
            space_freed: Condvar::new(),
            work_lock: Mutex::new(()),
            work_available: Condvar::new(),
            round_lock: Mutex::new(()),
            round_done: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn layout(&self) -> HeaderLayout {
        self.layout
    }

    /// Bytes published but not yet distributed
    ///
    /// `read_pos` never passes `committed`; reading it first keeps the
    /// difference from going negative while a round finishes concurrently.
    pub fn pending_bytes(&self) -> u64 {
        let read = self.read_pos.load(Ordering::Acquire);
        self.committed.load(Ordering::Acquire).saturating_sub(read)
    }

    /// Bytes of one range published since the last flush round started
    pub fn pending_for(&self, key: RangeKey) -> u64 {
        self.meta.lock().ranges.get(&key).copied().unwrap_or(0)
    }

    // =========================================================================
    // Producer Side
    // =========================================================================

    /// Framing of a payload of `length` bytes, rejecting what can never fit
    pub fn plan(&self, length: usize) -> Result<FragmentPlan> {
        let plan = FragmentPlan::new(self.layout, length, self.max_fragment)?;
        let total = plan.total_len();
        if total as u64 > self.capacity {
            return Err(LogError::CapacityExceeded(format!(
                "entry of {} bytes exceeds the write buffer ({} bytes)",
                total, self.capacity
            )));
        }
        if total > self.write_capacity {
            return Err(LogError::CapacityExceeded(format!(
                "entry of {} bytes exceeds the write capacity ({} bytes)",
                total, self.write_capacity
            )));
        }
        Ok(plan)
    }

    /// Append one entry, reading its payload straight into the ring
    ///
    /// If the reader fails, the reserved space is published as void (the
    /// process thread skips it) and the I/O error is returned.
    pub fn append<R: Read + ?Sized>(
        &self,
        entry: &EntrySpec,
        plan: &FragmentPlan,
        payload: &mut R,
    ) -> Result<()> {
        let total = plan.total_len();
        let header_len = plan.header_len;
        let start = self.reserve(total)?;

        // Payloads first; the checksums are computed over what landed in the ring
        let mut copy_error = None;
        let mut pos = start;
        for index in 0..plan.count {
            let fragment = plan.fragment_len(index);
            if copy_error.is_none() {
                // SAFETY: [start, start + total) is reserved by this call
                if let Err(e) = unsafe { self.ring.fill_from(pos + header_len as u64, fragment, payload) } {
                    copy_error = Some(e);
                }
            }
            pos += (header_len + fragment) as u64;
        }

        let timestamp = self.layout.timestamps.then(|| self.clock.now_secs());
        let mut pos = start;
        for index in 0..plan.count {
            let fragment = plan.fragment_len(index);
            let checksum = match (self.layout.checksums, copy_error.is_some()) {
                (false, _) => None,
                (true, true) => Some(0),
                (true, false) => {
                    // SAFETY: reserved by this call, payload already written
                    let (a, b) = unsafe { self.ring.slices(pos + header_len as u64, fragment) };
                    Some(checksum_parts(a, b))
                }
            };

            let header = PrimaryHeader {
                owner: entry.owner,
                range_id: entry.range_id,
                chunk_id: entry.chunk_id,
                length: fragment as u32,
                version: entry.version,
                timestamp,
                chain: plan.chain(index),
                checksum,
            };
            let mut bytes = [0u8; PrimaryHeader::MAX_SIZE];
            let written = header.encode_into(&mut bytes);
            debug_assert_eq!(written, header_len);
            if copy_error.is_some() {
                bytes[0] |= flags::VOID;
            }
            // SAFETY: reserved by this call
            unsafe { self.ring.write(pos, &bytes[..written]) };
            pos += (written + fragment) as u64;
        }

        self.commit(start, start + total as u64, entry.range_key());

        match copy_error {
            Some(e) => Err(LogError::Io(e)),
            None => Ok(()),
        }
    }

    /// Reserve `size` bytes, waiting for the consumer when the ring is full
    fn reserve(&self, size: usize) -> Result<u64> {
        let size = size as u64;
        let backoff = Backoff::new();

        loop {
            if self.stopped.load(Ordering::Acquire) {
                return Err(LogError::ShuttingDown);
            }

            let current = self.reserved.load(Ordering::Acquire);
            let read = self.read_pos.load(Ordering::Acquire);
            if current + size - read <= self.capacity {
                if self
                    .reserved
                    .compare_exchange_weak(current, current + size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(current);
                }
                backoff.spin();
                continue;
            }

            // No space: ask for a flush and wait for read_pos to move
            if !self.flush_requested.swap(true, Ordering::AcqRel) {
                trace!(size, "Write buffer full, requesting flush");
            }
            self.wake_consumer();

            if backoff.is_completed() {
                let mut guard = self.space_lock.lock();
                if self.read_pos.load(Ordering::Acquire) == read {
                    self.space_freed.wait_for(&mut guard, SPACE_WAIT);
                }
            } else {
                backoff.snooze();
            }
        }
    }

    /// Publish `[start, end)` once every earlier reservation is published
    fn commit(&self, start: u64, end: u64, key: RangeKey) {
        let backoff = Backoff::new();
        while self.committed.load(Ordering::Acquire) != start {
            backoff.snooze();
        }

        let total = {
            let mut meta = self.meta.lock();
            *meta.ranges.entry(key).or_insert(0) += end - start;
            meta.total += end - start;
            self.committed.store(end, Ordering::Release);
            meta.total
        };

        if total >= self.flush_threshold {
            self.wake_consumer();
        }
    }

    // =========================================================================
    // Flush Requests
    // =========================================================================

    /// Block until every byte of `key` published before this call has been
    /// distributed by the process thread
    pub fn flush_range(&self, key: RangeKey) -> Result<()> {
        let target = {
            let meta = self.meta.lock();
            let started = self.flush_started.load(Ordering::Acquire);
            if meta.ranges.get(&key).copied().unwrap_or(0) > 0 {
                started + 1
            } else {
                started
            }
        };
        self.wait_for_round(target)
    }

    /// Block until everything published before this call has been distributed
    pub fn flush_all(&self) -> Result<()> {
        let target = {
            let _meta = self.meta.lock();
            let started = self.flush_started.load(Ordering::Acquire);
            if self.committed.load(Ordering::Acquire) > self.read_pos.load(Ordering::Acquire) {
                started + 1
            } else {
                started
            }
        };
        self.wait_for_round(target)
    }

    fn wait_for_round(&self, target: u64) -> Result<()> {
        if self.flush_completed.load(Ordering::Acquire) >= target {
            return Ok(());
        }

        let mut guard = self.round_lock.lock();
        while self.flush_completed.load(Ordering::Acquire) < target {
            if self.stopped.load(Ordering::Acquire) && self.pending_bytes() == 0 {
                break;
            }
            self.priority_flush.store(true, Ordering::Release);
            self.wake_consumer();
            self.round_done.wait_for(&mut guard, ROUND_WAIT);
        }

        if self.flush_completed.load(Ordering::Acquire) >= target || self.pending_bytes() == 0 {
            Ok(())
        } else {
            Err(LogError::ShuttingDown)
        }
    }

    /// Reject new appends; pending data is still distributed
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.wake_consumer();
        let _guard = self.space_lock.lock();
        self.space_freed.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    fn wake_consumer(&self) {
        let _guard = self.work_lock.lock();
        self.work_available.notify_one();
    }

    // =========================================================================
    // Consumer Side (process thread only)
    // =========================================================================

    /// Park until a flush is due or `timeout` elapses
    pub(crate) fn wait_for_work(&self, timeout: Duration) {
        let mut guard = self.work_lock.lock();
        if self.flush_due() || (self.stopped.load(Ordering::Acquire) && self.pending_bytes() > 0) {
            return;
        }
        self.work_available.wait_for(&mut guard, timeout);
    }

    fn flush_due(&self) -> bool {
        self.priority_flush.load(Ordering::Acquire)
            || self.flush_requested.load(Ordering::Acquire)
            || self.pending_bytes() >= self.flush_threshold
    }

    /// Take the published region and the pending table for one round
    pub(crate) fn begin_flush(&self) -> FlushSnapshot {
        let mut meta = self.meta.lock();
        let start = self.read_pos.load(Ordering::Acquire);
        let end = self.committed.load(Ordering::Acquire);
        let pending = std::mem::take(&mut meta.ranges);
        meta.total = 0;
        let generation = self.flush_started.fetch_add(1, Ordering::AcqRel) + 1;
        self.priority_flush.store(false, Ordering::Release);
        self.flush_requested.store(false, Ordering::Release);
        FlushSnapshot {
            start,
            end,
            pending,
            generation,
        }
    }

    /// Release the region of a finished round to the producers
    pub(crate) fn finish_flush(&self, snapshot: &FlushSnapshot) {
        self.read_pos.store(snapshot.end, Ordering::Release);
        {
            let _guard = self.space_lock.lock();
            self.space_freed.notify_all();
        }

        self.flush_completed.store(snapshot.generation, Ordering::Release);
        let _guard = self.round_lock.lock();
        self.round_done.notify_all();

        if !snapshot.is_empty() {
            debug!(
                generation = snapshot.generation,
                bytes = snapshot.len(),
                ranges = snapshot.pending.len(),
                "Write buffer flush round finished"
            );
        }
    }

    /// Copy `dst.len()` bytes at `pos` out of the ring
    ///
    /// `[pos, pos + dst.len())` must lie inside the current flush snapshot.
    pub(crate) fn copy_out(&self, pos: u64, dst: &mut [u8]) {
        debug_assert!(pos >= self.read_pos.load(Ordering::Acquire));
        debug_assert!(pos + dst.len() as u64 <= self.committed.load(Ordering::Acquire));
        // SAFETY: published bytes are only written again after read_pos moves
        unsafe { self.ring.read(pos, dst) }
    }

    /// Borrow `len` bytes at `pos` as two slices (second non-empty on wrap)
    ///
    /// Same contract as `copy_out`.
    pub(crate) fn with_region<T>(&self, pos: u64, len: usize, f: impl FnOnce(&[u8], &[u8]) -> T) -> T {
        debug_assert!(pos >= self.read_pos.load(Ordering::Acquire));
        debug_assert!(pos + len as u64 <= self.committed.load(Ordering::Acquire));
        // SAFETY: see copy_out
        let (a, b) = unsafe { self.ring.slices(pos, len) };
        f(a, b)
    }
}
