//! Log Module
//!
//! On-disk side of the engine: one shared primary log and one segmented
//! secondary log per backup range.
//!
//! ## Directory Layout
//! ```text
//!   {backup_dir}/
//!     ├── manifest.bin            geometry + format version (bincode)
//!     ├── primary.log             staging log of low-volume ranges
//!     └── secondary/
//!           ├── sec_0001_0000.log
//!           └── sec_0001_0001.log
//! ```
//!
//! ## Write Paths
//! ```text
//!   low volume:  process ──► primary.log            (full headers, staging copy)
//!                        └─► SecondaryLogBuffer ──► sec_*.log (when full)
//!   high volume: process ─────────────────────────► sec_*.log
//! ```

mod access;
mod buffer;
mod catalog;
mod manifest;
mod primary;
mod recovery;
mod secondary;
mod segment;

pub use access::{AccessFlag, AccessState};
pub use buffer::SecondaryLogBuffer;
pub use catalog::{LogCatalog, RangeLog};
pub use manifest::{Manifest, FORMAT_VERSION, MANIFEST_FILE};
pub use primary::{PrimaryLog, PRIMARY_LOG_FILE};
pub use recovery::{recover_log, RecoveredEntry, RecoveryOutcome};
pub use secondary::{AppendOutcome, RewriteResult, ScanReport, SecondaryLog, Survivor, WriteAccess};
pub use segment::{FragmentLocation, LocationTable, SegmentInfo, SegmentUsage, SEGMENT_HEADER_SIZE};

use crate::config::Config;

/// Directory holding the secondary logs
pub const SECONDARY_DIR: &str = "secondary";

/// Shape of every secondary log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogGeometry {
    pub segment_size: usize,
    pub segment_count: usize,
    /// Occupied bytes that activate reorganization
    pub activation_bytes: u64,
}

impl LogGeometry {
    pub fn from_config(config: &Config) -> Self {
        Self {
            segment_size: config.segment_size,
            segment_count: config.segments_per_log(),
            activation_bytes: config.reorg_activation_bytes(),
        }
    }

    /// Size of the log file
    pub fn log_size(&self) -> usize {
        self.segment_size * self.segment_count
    }

    /// Entry bytes one segment can hold
    pub fn entry_capacity(&self) -> usize {
        self.segment_size - SEGMENT_HEADER_SIZE
    }

    /// File offset of a segment
    pub fn segment_offset(&self, index: usize) -> u64 {
        (index * self.segment_size) as u64
    }
}
