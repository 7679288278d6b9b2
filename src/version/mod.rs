//! Versioning Module
//!
//! Every write of a chunk is stamped with a `(epoch, version)` pair taken from
//! the version table. Versions decide which on-disk entry of a chunk is live
//! during reorganization and recovery.
//!
//! ## Ordering
//! ```text
//! (0,1) < (0,2) < ... < (0,MAX-1) < (0,MAX)=tombstone < (1,1) < ...
//! ```
//! The counter never reaches the sentinel through an ordinary write: the
//! epoch rolls over first. A write that follows a tombstone starts a new epoch.

mod table;

pub use table::{VersionSnapshot, VersionTable};

use std::fmt;

use serde::{Deserialize, Serialize};

/// Version counter value reserved for removals
pub const TOMBSTONE_VERSION: u32 = u32::MAX;

/// Version of one chunk write
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Version {
    pub epoch: u16,
    pub version: u32,
}

impl Version {
    /// First version handed out for a chunk
    pub const INITIAL: Version = Version { epoch: 0, version: 1 };

    pub fn new(epoch: u16, version: u32) -> Self {
        Self { epoch, version }
    }

    /// Tombstone within the given epoch
    pub fn tombstone(epoch: u16) -> Self {
        Self {
            epoch,
            version: TOMBSTONE_VERSION,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.version == TOMBSTONE_VERSION
    }

    /// Version of the write that follows this one
    pub fn next(self) -> Self {
        if self.is_tombstone() || self.version + 1 == TOMBSTONE_VERSION {
            Self {
                epoch: self.epoch.wrapping_add(1),
                version: 1,
            }
        } else {
            Self {
                epoch: self.epoch,
                version: self.version + 1,
            }
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_tombstone() {
            write!(f, "({}, removed)", self.epoch)
        } else {
            write!(f, "({}, {})", self.epoch, self.version)
        }
    }
}
