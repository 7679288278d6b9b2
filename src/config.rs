//! Configuration for chunklog
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::error::{LogError, Result};

/// Upper bound for the write buffer (the ring positions are 64-bit, the
/// bound keeps a single reservation within `u32` lengths)
pub const WRITE_BUFFER_MAX_SIZE: usize = 1024 * 1024 * 1024;

/// Largest fragment (header + payload) a single log entry may occupy
pub const MAX_FRAGMENT_CAP: usize = 2 * 1024 * 1024;

/// Main configuration for a chunklog instance
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Storage Configuration
    // -------------------------------------------------------------------------
    /// Root directory for all log files
    /// Internal structure:
    ///   {backup_dir}/
    ///     ├── manifest.bin                    (format + geometry)
    ///     ├── primary.log                     (primary log)
    ///     └── secondary/
    ///           └── sec_{owner:04x}_{range:04x}.log
    pub backup_dir: PathBuf,

    /// Size of a flash page; every on-disk size is a multiple of it
    pub flash_page_size: usize,

    /// Size of one secondary log segment
    pub segment_size: usize,

    /// Size of one secondary log (a whole number of segments)
    pub secondary_log_size: usize,

    /// Size of the primary log
    pub primary_log_size: usize,

    /// Whether low-volume ranges are staged through the primary log
    pub two_level_logging: bool,

    // -------------------------------------------------------------------------
    // Write Path Configuration
    // -------------------------------------------------------------------------
    /// Capacity of the shared write buffer (power of two)
    pub write_buffer_size: usize,

    /// Largest framed entry accepted by `submit`
    pub write_capacity: usize,

    /// Per-range volume below which a flush is routed through the primary log
    pub secondary_log_buffer_size: usize,

    /// Fill level (percent of the write buffer) that wakes the process thread
    pub flush_threshold_percent: u8,

    /// Maximum time between two process thread flushes (milliseconds)
    pub process_timeout_ms: u64,

    /// Whether a CRC32 over the payload is stored in every header
    pub use_checksums: bool,

    /// Whether entry headers carry a timestamp (seconds since start)
    pub use_timestamps: bool,

    // -------------------------------------------------------------------------
    // Reorganization Configuration
    // -------------------------------------------------------------------------
    /// Occupancy (percent of a secondary log) that activates background
    /// reorganization of that log
    pub reorg_utilization_threshold: u8,

    /// Segments untouched by the reorganizer for this long become eligible
    /// for background cleaning regardless of occupancy
    pub reorg_age_threshold_secs: u32,

    /// Entries older than this do not contribute to a segment's age
    pub cold_data_threshold_secs: u32,

    // -------------------------------------------------------------------------
    // Lifecycle Configuration
    // -------------------------------------------------------------------------
    /// Bounded wait for background threads on shutdown (milliseconds)
    pub shutdown_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backup_dir: PathBuf::from("./chunklog_data"),
            flash_page_size: 4 * 1024,
            segment_size: 8 * 1024 * 1024,          // 8 MB
            secondary_log_size: 128 * 1024 * 1024,  // 128 MB
            primary_log_size: 256 * 1024 * 1024,    // 256 MB
            two_level_logging: true,
            write_buffer_size: 64 * 1024 * 1024,    // 64 MB
            write_capacity: 32 * 1024 * 1024,       // 32 MB
            secondary_log_buffer_size: 128 * 1024,  // 128 KB
            flush_threshold_percent: 45,
            process_timeout_ms: 100,
            use_checksums: true,
            use_timestamps: true,
            reorg_utilization_threshold: 70,
            reorg_age_threshold_secs: 3600,
            cold_data_threshold_secs: 9000,
            shutdown_timeout_ms: 5000,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check the geometry constraints between all sizes
    pub fn validate(&self) -> Result<()> {
        let page = self.flash_page_size;
        if page == 0 {
            return Err(LogError::Config("flash page size must not be zero".to_string()));
        }

        if !self.write_buffer_size.is_power_of_two()
            || self.write_buffer_size < page
            || self.write_buffer_size > WRITE_BUFFER_MAX_SIZE
        {
            return Err(LogError::Config(format!(
                "write buffer size {} must be a power of two between {} and {}",
                self.write_buffer_size, page, WRITE_BUFFER_MAX_SIZE
            )));
        }

        if self.segment_size <= page || self.segment_size % page != 0 {
            return Err(LogError::Config(format!(
                "segment size {} must be a multiple of the flash page size {} and larger than it",
                self.segment_size, page
            )));
        }

        if self.segment_size > u32::MAX as usize {
            return Err(LogError::Config("segment size must fit into 32 bits".to_string()));
        }

        if self.secondary_log_size % self.segment_size != 0
            || self.secondary_log_size < 2 * self.segment_size
        {
            return Err(LogError::Config(format!(
                "secondary log size {} must hold at least two whole segments of {}",
                self.secondary_log_size, self.segment_size
            )));
        }

        if self.primary_log_size < self.segment_size {
            return Err(LogError::Config(format!(
                "primary log size {} must hold at least one segment",
                self.primary_log_size
            )));
        }

        if self.secondary_log_buffer_size == 0 || self.secondary_log_buffer_size >= self.segment_size {
            return Err(LogError::Config(format!(
                "secondary log buffer size {} must be non-zero and smaller than a segment",
                self.secondary_log_buffer_size
            )));
        }

        if self.flush_threshold_percent == 0 || self.flush_threshold_percent > 100 {
            return Err(LogError::Config("flush threshold must be within 1..=100 percent".to_string()));
        }

        if self.reorg_utilization_threshold == 0 || self.reorg_utilization_threshold > 100 {
            return Err(LogError::Config(
                "reorganization threshold must be within 1..=100 percent".to_string(),
            ));
        }

        if self.write_capacity < self.max_fragment_size() {
            return Err(LogError::Config(format!(
                "write capacity {} is smaller than one fragment ({})",
                self.write_capacity,
                self.max_fragment_size()
            )));
        }

        if self.reorg_utilization_threshold <= 50 {
            tracing::warn!(
                "Reorganization threshold of {}% leaves little headroom for cleaning",
                self.reorg_utilization_threshold
            );
        }

        Ok(())
    }

    // =========================================================================
    // Derived values
    // =========================================================================

    /// Largest fragment (header included) of one log entry
    pub fn max_fragment_size(&self) -> usize {
        if self.segment_size > 2 * MAX_FRAGMENT_CAP {
            MAX_FRAGMENT_CAP
        } else {
            self.segment_size / 2
        }
    }

    /// Number of segments in one secondary log
    pub fn segments_per_log(&self) -> usize {
        self.secondary_log_size / self.segment_size
    }

    /// Bytes in the write buffer that wake the process thread
    pub fn flush_threshold_bytes(&self) -> usize {
        self.write_buffer_size / 100 * self.flush_threshold_percent as usize
    }

    /// Occupied bytes of a secondary log that activate reorganization
    pub fn reorg_activation_bytes(&self) -> u64 {
        self.secondary_log_size as u64 / 100 * self.reorg_utilization_threshold as u64
    }

    /// Background sweep iterations spent on one log before switching
    pub fn iterations_per_log(&self) -> usize {
        (self.segments_per_log() / 3).max(1)
    }
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the backup directory (root for all log files)
    pub fn backup_dir(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.backup_dir = path.into();
        self
    }

    /// Set the flash page size
    pub fn flash_page_size(mut self, size: usize) -> Self {
        self.config.flash_page_size = size;
        self
    }

    /// Set the secondary log segment size
    pub fn segment_size(mut self, size: usize) -> Self {
        self.config.segment_size = size;
        self
    }

    /// Set the size of every secondary log
    pub fn secondary_log_size(mut self, size: usize) -> Self {
        self.config.secondary_log_size = size;
        self
    }

    /// Set the primary log size
    pub fn primary_log_size(mut self, size: usize) -> Self {
        self.config.primary_log_size = size;
        self
    }

    /// Enable or disable staging through the primary log
    pub fn two_level_logging(mut self, enabled: bool) -> Self {
        self.config.two_level_logging = enabled;
        self
    }

    /// Set the write buffer size (power of two)
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Set the largest accepted framed entry
    pub fn write_capacity(mut self, size: usize) -> Self {
        self.config.write_capacity = size;
        self
    }

    /// Set the secondary log buffer size (primary/secondary routing threshold)
    pub fn secondary_log_buffer_size(mut self, size: usize) -> Self {
        self.config.secondary_log_buffer_size = size;
        self
    }

    /// Set the flush threshold (percent of the write buffer)
    pub fn flush_threshold_percent(mut self, percent: u8) -> Self {
        self.config.flush_threshold_percent = percent;
        self
    }

    /// Set the process thread timeout (in milliseconds)
    pub fn process_timeout_ms(mut self, ms: u64) -> Self {
        self.config.process_timeout_ms = ms;
        self
    }

    /// Enable or disable payload checksums
    pub fn use_checksums(mut self, enabled: bool) -> Self {
        self.config.use_checksums = enabled;
        self
    }

    /// Enable or disable entry timestamps
    pub fn use_timestamps(mut self, enabled: bool) -> Self {
        self.config.use_timestamps = enabled;
        self
    }

    /// Set the occupancy threshold (percent) that activates reorganization
    pub fn reorg_utilization_threshold(mut self, percent: u8) -> Self {
        self.config.reorg_utilization_threshold = percent;
        self
    }

    /// Set the segment age (seconds) after which background cleaning applies
    pub fn reorg_age_threshold_secs(mut self, secs: u32) -> Self {
        self.config.reorg_age_threshold_secs = secs;
        self
    }

    /// Set the cold data threshold (in seconds)
    pub fn cold_data_threshold_secs(mut self, secs: u32) -> Self {
        self.config.cold_data_threshold_secs = secs;
        self
    }

    /// Set the bounded shutdown wait (in milliseconds)
    pub fn shutdown_timeout_ms(mut self, ms: u64) -> Self {
        self.config.shutdown_timeout_ms = ms;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
