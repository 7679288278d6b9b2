//! Range recovery
//!
//! Replays a secondary log into the latest version of every chunk.
//!
//! ## Process
//! 1. Read segments in append order (segment sequence)
//! 2. Drop entries failing their checksum or following a malformed header
//! 3. Reassemble chained payloads; chains missing a fragment are dropped
//! 4. Keep the highest version per chunk (tombstones included)
//! 5. Return survivors in the order they were appended

use std::collections::HashMap;

use bytes::{Bytes, BytesMut};
use tracing::{debug, info, warn};

use crate::error::{LogError, Result};
use crate::header::SecondaryEntries;
use crate::types::ChunkId;
use crate::version::Version;

use super::{SecondaryLog, SEGMENT_HEADER_SIZE};

/// Latest version of one chunk as found in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredEntry {
    pub chunk_id: ChunkId,
    pub version: Version,
    /// Empty for tombstones
    pub payload: Bytes,
}

impl RecoveredEntry {
    pub fn is_tombstone(&self) -> bool {
        self.version.is_tombstone()
    }
}

/// Recovered entries plus what had to be skipped
#[derive(Debug, Clone, Default)]
pub struct RecoveryOutcome {
    pub entries: Vec<RecoveredEntry>,
    pub segments: usize,
    pub corrupt: usize,
    pub incomplete_chains: usize,
}

struct Candidate {
    version: Version,
    position: u64,
    payload: Bytes,
}

struct PartialChain {
    position: u64,
    parts: Vec<Option<Bytes>>,
}

/// Attempts before giving up on a log that keeps changing under the scan
const MAX_SCAN_ATTEMPTS: usize = 8;

/// Replay every segment of `log`
///
/// The scan starts over when a segment is cleaned while it runs, so the
/// result always reflects one consistent segment order.
pub fn recover_log(log: &SecondaryLog) -> Result<RecoveryOutcome> {
    for attempt in 1..=MAX_SCAN_ATTEMPTS {
        if let Some(outcome) = scan(log)? {
            info!(
                range = %log.key(),
                chunks = outcome.entries.len(),
                segments = outcome.segments,
                corrupt = outcome.corrupt,
                incomplete_chains = outcome.incomplete_chains,
                "Recovered secondary log"
            );
            return Ok(outcome);
        }
        debug!(range = %log.key(), attempt, "Segment moved during recovery, rescanning");
    }
    Err(LogError::InvalidArgument(format!(
        "secondary log {} kept changing during recovery",
        log.key()
    )))
}

/// One pass over the log; `None` if a segment moved while it was read
fn scan(log: &SecondaryLog) -> Result<Option<RecoveryOutcome>> {
    let key = log.key();
    let mut outcome = RecoveryOutcome::default();
    let mut best: HashMap<ChunkId, Candidate> = HashMap::new();
    let mut chains: HashMap<(ChunkId, Version), PartialChain> = HashMap::new();
    let mut position = 0u64;

    for (index, expected) in log.segments_in_order() {
        let data = match log.read_segment(index, true)? {
            Some((info, data)) if info.sequence == expected.sequence => Bytes::from(data),
            _ => return Ok(None),
        };
        outcome.segments += 1;

        for item in SecondaryEntries::new(&data[SEGMENT_HEADER_SIZE..], key.owner) {
            let (offset, header, payload) = match item {
                Ok(entry) => entry,
                Err(e) => {
                    warn!(range = %key, segment = index, error = %e, "Corrupt entry during recovery");
                    outcome.corrupt += 1;
                    break;
                }
            };
            position += 1;

            if !header.verify(payload) {
                warn!(range = %key, chunk = %header.chunk_id, "Checksum mismatch during recovery, dropping entry");
                outcome.corrupt += 1;
                continue;
            }

            let start = SEGMENT_HEADER_SIZE + offset + header.encoded_len();
            let payload = data.slice(start..start + payload.len());

            match header.chain {
                None => offer(&mut best, header.chunk_id, header.version, position, payload),
                Some(chain) => {
                    let partial = chains
                        .entry((header.chunk_id, header.version))
                        .or_insert_with(|| PartialChain {
                            position,
                            parts: vec![None; chain.count as usize],
                        });
                    if partial.parts.len() != chain.count as usize || chain.index >= chain.count {
                        outcome.corrupt += 1;
                        continue;
                    }
                    partial.parts[chain.index as usize] = Some(payload);
                }
            }
        }
    }

    for ((chunk_id, version), partial) in chains {
        if partial.parts.iter().any(Option::is_none) {
            outcome.incomplete_chains += 1;
            continue;
        }
        let total = partial.parts.iter().flatten().map(Bytes::len).sum();
        let mut payload = BytesMut::with_capacity(total);
        for part in partial.parts.iter().flatten() {
            payload.extend_from_slice(part);
        }
        offer(&mut best, chunk_id, version, partial.position, payload.freeze());
    }

    let mut entries: Vec<(u64, RecoveredEntry)> = best
        .into_iter()
        .map(|(chunk_id, c)| {
            (
                c.position,
                RecoveredEntry {
                    chunk_id,
                    version: c.version,
                    payload: c.payload,
                },
            )
        })
        .collect();
    entries.sort_by_key(|(position, _)| *position);
    outcome.entries = entries.into_iter().map(|(_, e)| e).collect();
    Ok(Some(outcome))
}

/// Keep the newer of two versions; equal versions keep the first copy
fn offer(best: &mut HashMap<ChunkId, Candidate>, chunk_id: ChunkId, version: Version, position: u64, payload: Bytes) {
    match best.get(&chunk_id) {
        Some(current) if current.version >= version => {}
        _ => {
            best.insert(
                chunk_id,
                Candidate {
                    version,
                    position,
                    payload,
                },
            );
        }
    }
}
