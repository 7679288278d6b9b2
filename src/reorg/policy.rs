//! Selection policy for background reorganization
//!
//! Log choice: most picks go to the largest log that needs
//! reorganization; every `deterministic_picks + 1`-th pick is random over
//! all logs so small logs are not starved forever.
//!
//! Segment choice: cost-benefit over the segments holding stale bytes.
//! ```text
//!   benefit = (1 - u) * age / (1 + u)
//!   u   = live bytes / segment capacity
//!   age = seconds since last write, at least 1, capped at the cold threshold
//! ```
//! Empty segments (u = 0) always win; ties go to the lower utilization.

use std::cmp::Ordering;

use rand::seq::SliceRandom;
use rand::Rng;

use crate::log::SegmentInfo;
use crate::types::RangeKey;

/// What the policy knows about one log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogCandidate {
    pub key: RangeKey,
    pub occupied: u64,
    pub needs_reorganization: bool,
}

/// Alternating deterministic/random log selection
#[derive(Debug, Clone)]
pub struct ReorgPolicy {
    /// Deterministic picks between two random ones
    pub deterministic_picks: u32,
    /// Never pick the most recently created log at random
    pub skip_newest: bool,
    picks: u64,
}

impl Default for ReorgPolicy {
    fn default() -> Self {
        Self {
            deterministic_picks: 2,
            skip_newest: true,
            picks: 0,
        }
    }
}

impl ReorgPolicy {
    pub fn new(deterministic_picks: u32, skip_newest: bool) -> Self {
        Self {
            deterministic_picks,
            skip_newest,
            picks: 0,
        }
    }

    /// Pick the next log to work on
    pub fn choose_log<R: Rng + ?Sized>(
        &mut self,
        candidates: &[LogCandidate],
        newest: Option<RangeKey>,
        rng: &mut R,
    ) -> Option<RangeKey> {
        if candidates.is_empty() {
            return None;
        }
        self.picks += 1;

        let period = self.deterministic_picks as u64 + 1;
        if self.picks % period == 0 {
            let pool: Vec<&LogCandidate> = candidates
                .iter()
                .filter(|c| !(self.skip_newest && candidates.len() > 1 && Some(c.key) == newest))
                .collect();
            if let Some(candidate) = pool.choose(rng) {
                return Some(candidate.key);
            }
        }

        candidates
            .iter()
            .filter(|c| c.needs_reorganization)
            .max_by(|a, b| a.occupied.cmp(&b.occupied).then_with(|| b.key.cmp(&a.key)))
            .map(|c| c.key)
    }
}

/// Cost-benefit score of cleaning a segment
pub fn cost_benefit(info: &SegmentInfo, capacity: u32, now: u32, cold_threshold: u32) -> f64 {
    let utilization = info.utilization(capacity);
    if utilization <= 0.0 {
        return f64::INFINITY;
    }
    let age = info.age(now).clamp(1, cold_threshold.max(1)) as f64;
    (1.0 - utilization) * age / (1.0 + utilization)
}

/// Best segment to clean among `candidates`
pub fn choose_segment(
    candidates: &[(usize, SegmentInfo)],
    capacity: u32,
    now: u32,
    cold_threshold: u32,
) -> Option<usize> {
    candidates
        .iter()
        .map(|(index, info)| {
            (
                *index,
                cost_benefit(info, capacity, now, cold_threshold),
                info.utilization(capacity),
            )
        })
        .max_by(|a, b| {
            a.1.partial_cmp(&b.1)
                .unwrap_or(Ordering::Equal)
                .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
                .then_with(|| b.0.cmp(&a.0))
        })
        .map(|(index, _, _)| index)
}

