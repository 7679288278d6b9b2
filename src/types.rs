//! Identifiers and the engine clock
//!
//! ## Chunk ID Layout
//! ```text
//! ┌──────────────────┬───────────────────────────────────────┐
//! │ creator node (16)│             local id (48)             │
//! └──────────────────┴───────────────────────────────────────┘
//! ```

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Node identifier (creator of a chunk, owner of a backup range)
pub type NodeId = u16;

/// Backup range identifier, unique per owner
pub type RangeId = u16;

// =============================================================================
// Chunk ID
// =============================================================================

/// Globally unique chunk identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ChunkId(pub u64);

impl ChunkId {
    /// Bits reserved for the local id
    pub const LOCAL_ID_BITS: u32 = 48;

    /// Mask selecting the local id
    pub const LOCAL_ID_MASK: u64 = (1u64 << Self::LOCAL_ID_BITS) - 1;

    /// Build a chunk id from its creator and local id (truncated to 48 bits)
    pub fn new(creator: NodeId, local_id: u64) -> Self {
        Self(((creator as u64) << Self::LOCAL_ID_BITS) | (local_id & Self::LOCAL_ID_MASK))
    }

    /// Node that created the chunk
    pub fn creator(self) -> NodeId {
        (self.0 >> Self::LOCAL_ID_BITS) as NodeId
    }

    /// Creator-local part of the id
    pub fn local_id(self) -> u64 {
        self.0 & Self::LOCAL_ID_MASK
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl From<u64> for ChunkId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

// =============================================================================
// Range Key
// =============================================================================

/// Identity of one backup range: the owning node plus its range id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RangeKey {
    pub owner: NodeId,
    pub range_id: RangeId,
}

impl RangeKey {
    pub fn new(owner: NodeId, range_id: RangeId) -> Self {
        Self { owner, range_id }
    }

    /// A chunk stored in this range but created elsewhere is a migration entry
    pub fn is_migrated(&self, chunk_id: ChunkId) -> bool {
        chunk_id.creator() != self.owner
    }

    /// File name of the secondary log backing this range
    /// (1, 7) → "sec_0001_0007.log"
    pub fn log_file_name(&self) -> String {
        format!("sec_{:04x}_{:04x}.log", self.owner, self.range_id)
    }

    /// Parse a range key back from a secondary log file name
    pub fn from_log_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let stem = name.strip_prefix("sec_")?.strip_suffix(".log")?;
        let (owner, range_id) = stem.split_once('_')?;
        Some(Self {
            owner: u16::from_str_radix(owner, 16).ok()?,
            range_id: u16::from_str_radix(range_id, 16).ok()?,
        })
    }
}

impl fmt::Display for RangeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04x}/{}", self.owner, self.range_id)
    }
}

// =============================================================================
// Clock
// =============================================================================

/// Seconds since engine start, shifted so that timestamps keep increasing
/// across restarts (the offset is the newest timestamp found on disk)
#[derive(Debug)]
pub struct Clock {
    start: Instant,
    offset: AtomicU32,
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            offset: AtomicU32::new(0),
        }
    }

    /// Current engine time in seconds
    pub fn now_secs(&self) -> u32 {
        let elapsed = self.start.elapsed().as_secs().min(u32::MAX as u64) as u32;
        self.offset.load(Ordering::Relaxed).saturating_add(elapsed)
    }

    /// Raise the offset so `now_secs()` never goes below `seen`
    pub fn advance_past(&self, seen: u32) {
        self.offset.fetch_max(seen, Ordering::Relaxed);
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}
