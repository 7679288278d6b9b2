//! Utilization report
//!
//! Point-in-time view of every secondary log plus the primary log and the
//! reorganization totals. Serializable with serde/bincode and printable.
//!
//! ```text
//! range       occupied        live    capacity  segments  state
//! 0001/0        8.0 MiB     2.1 MiB    128 MiB     2/16   ok
//! 0001/3       64.0 MiB    30.2 MiB    128 MiB     8/16   ok *
//! 0001/7      120.5 MiB   119.9 MiB    128 MiB    15/16   degraded
//! ```
//! `*` marks a log the reorganizer is cleaning right now.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::log::{LogCatalog, PrimaryLog, SegmentUsage};
use crate::reorg::ReorgTotals;
use crate::types::{NodeId, RangeId};

/// Usage of one secondary log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RangeUtilization {
    pub owner: NodeId,
    pub range_id: RangeId,
    pub occupied: u64,
    pub live: u64,
    pub capacity: u64,
    pub segments_in_use: usize,
    pub segment_count: usize,
    /// Bytes waiting in the range's secondary log buffer
    pub staged: usize,
    pub degraded: bool,
    /// Held by the reorganizer when the report was taken
    pub active: bool,
    pub segments: Vec<SegmentUsage>,
}

impl RangeUtilization {
    /// Occupied share of the log's capacity (0.0 - 1.0)
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.occupied as f64 / self.capacity as f64
    }
}

/// Usage of the whole backup directory
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UtilizationReport {
    pub ranges: Vec<RangeUtilization>,
    pub total_occupied: u64,
    pub total_live: u64,
    pub total_capacity: u64,
    pub primary_used: u64,
    pub primary_capacity: u64,
    pub reorg: ReorgTotals,
}

impl UtilizationReport {
    /// Collect the report from the catalog (ranges in key order)
    pub fn collect(catalog: &LogCatalog, primary: Option<&PrimaryLog>, reorg: ReorgTotals) -> Self {
        let ranges: Vec<RangeUtilization> = catalog
            .ranges()
            .iter()
            .map(|range| {
                let segments = range.log.segment_distribution();
                RangeUtilization {
                    owner: range.key.owner,
                    range_id: range.key.range_id,
                    occupied: range.log.occupied_space(),
                    live: range.log.live_bytes(),
                    capacity: range.log.capacity(),
                    segments_in_use: segments.len(),
                    segment_count: range.log.geometry().segment_count,
                    staged: range.buffer.lock().len(),
                    degraded: range.log.is_degraded(),
                    active: range.log.is_accessed(),
                    segments,
                }
            })
            .collect();

        Self {
            total_occupied: ranges.iter().map(|r| r.occupied).sum(),
            total_live: ranges.iter().map(|r| r.live).sum(),
            total_capacity: ranges.iter().map(|r| r.capacity).sum(),
            primary_used: primary.map_or(0, PrimaryLog::used),
            primary_capacity: primary.map_or(0, PrimaryLog::capacity),
            ranges,
            reorg,
        }
    }

    /// Ranges the reorganizer was cleaning when the report was taken
    pub fn active_ranges(&self) -> impl Iterator<Item = &RangeUtilization> {
        self.ranges.iter().filter(|r| r.active)
    }

    pub fn degraded_ranges(&self) -> usize {
        self.ranges.iter().filter(|r| r.degraded).count()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

fn human(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

impl fmt::Display for UtilizationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{:<10} {:>11} {:>11} {:>11} {:>9}  state",
            "range", "occupied", "live", "capacity", "segments"
        )?;
        for range in &self.ranges {
            writeln!(
                f,
                "{:<10} {:>11} {:>11} {:>11} {:>9}  {}{}",
                format!("{:04x}/{}", range.owner, range.range_id),
                human(range.occupied),
                human(range.live),
                human(range.capacity),
                format!("{}/{}", range.segments_in_use, range.segment_count),
                if range.degraded { "degraded" } else { "ok" },
                if range.active { " *" } else { "" }
            )?;
        }
        writeln!(
            f,
            "total: {} ranges, {} occupied, {} live of {}",
            self.ranges.len(),
            human(self.total_occupied),
            human(self.total_live),
            human(self.total_capacity)
        )?;
        if self.primary_capacity > 0 {
            writeln!(
                f,
                "primary log: {} of {}",
                human(self.primary_used),
                human(self.primary_capacity)
            )?;
        }
        write!(
            f,
            "reorganization: {} full passes, {} sweep steps, {} segments cleaned, {} reclaimed",
            self.reorg.full_passes,
            self.reorg.sweep_steps,
            self.reorg.segments_cleaned,
            human(self.reorg.bytes_reclaimed)
        )
    }
}
