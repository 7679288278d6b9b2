//! Backup directory manifest
//!
//! Records the geometry the logs were created with. Reopening a directory
//! with a different geometry would misread every segment, so it is refused.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::error::{LogError, Result};

/// File name of the manifest inside the backup directory
pub const MANIFEST_FILE: &str = "manifest.bin";

/// On-disk format version
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub format_version: u32,
    pub segment_size: u64,
    pub secondary_log_size: u64,
    pub primary_log_size: u64,
}

impl Manifest {
    pub fn from_config(config: &Config) -> Self {
        Self {
            format_version: FORMAT_VERSION,
            segment_size: config.segment_size as u64,
            secondary_log_size: config.secondary_log_size as u64,
            primary_log_size: config.primary_log_size as u64,
        }
    }

    /// Read the manifest of a backup directory, if there is one
    pub fn load(dir: &Path) -> Result<Option<Self>> {
        let path = dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(path)?;
        Ok(Some(bincode::deserialize(&bytes)?))
    }

    pub fn store(&self, dir: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)?;
        let tmp = dir.join(format!("{}.tmp", MANIFEST_FILE));
        fs::write(&tmp, bytes)?;
        fs::rename(tmp, dir.join(MANIFEST_FILE))?;
        Ok(())
    }

    /// Refuse a configuration whose geometry differs from the stored one
    pub fn check(&self, config: &Config) -> Result<()> {
        if self.format_version != FORMAT_VERSION {
            return Err(LogError::Config(format!(
                "backup directory has format version {}, expected {}",
                self.format_version, FORMAT_VERSION
            )));
        }
        let wanted = Self::from_config(config);
        if wanted != *self {
            return Err(LogError::Config(format!(
                "backup directory geometry {:?} does not match the configuration {:?}",
                self, wanted
            )));
        }
        Ok(())
    }

    /// Apply the stored geometry to a configuration (used by tools that
    /// open an existing directory)
    pub fn apply(&self, config: &mut Config) {
        config.segment_size = self.segment_size as usize;
        config.secondary_log_size = self.secondary_log_size as usize;
        config.primary_log_size = self.primary_log_size as usize;
    }
}
