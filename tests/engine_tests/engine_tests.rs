//! Tests for Engine
//!
//! These tests verify:
//! - Submit/recover round trips, chained entries and submission order
//! - Tombstones and range removal
//! - Low-volume ranges staged through the primary log
//! - Submission order kept across primary log overflows and route changes
//! - Reorganization reclaiming overwritten data
//! - Space bounds, degraded logs and error reporting
//! - Engine lifecycle (close/reopen, primary log replay)

use std::sync::Arc;

use chunklog::header::PrimaryHeader;
use chunklog::log::{PrimaryLog, PRIMARY_LOG_FILE};
use chunklog::pool::BufferPool;
use chunklog::version::VersionTable;
use chunklog::{ChunkId, Config, LogEngine, LogError, RangeKey, UtilizationReport, Version};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

/// 64 KB segments, 8 per log; 20 KB payloads fit three to a segment
fn small_config(dir: &std::path::Path) -> Config {
    Config::builder()
        .backup_dir(dir)
        .segment_size(64 * 1024)
        .secondary_log_size(512 * 1024)
        .primary_log_size(1024 * 1024)
        .write_buffer_size(1024 * 1024)
        .secondary_log_buffer_size(16 * 1024)
        .process_timeout_ms(10)
        .build()
}

/// 1 MB segments with the default secondary log buffer
fn staging_config(dir: &std::path::Path) -> Config {
    Config::builder()
        .backup_dir(dir)
        .segment_size(1024 * 1024)
        .secondary_log_size(8 * 1024 * 1024)
        .primary_log_size(2 * 1024 * 1024)
        .write_buffer_size(1024 * 1024)
        .process_timeout_ms(10)
        .build()
}

fn setup_temp_engine() -> (TempDir, LogEngine) {
    let temp_dir = TempDir::new().unwrap();
    let engine = LogEngine::open(small_config(temp_dir.path())).unwrap();
    (temp_dir, engine)
}

const BIG: usize = 20 * 1024;

fn big_payload(seed: u8) -> Vec<u8> {
    (0..BIG).map(|i| (i as u8).wrapping_add(seed)).collect()
}

// =============================================================================
// Round Trip Tests
// =============================================================================

#[test]
fn test_engine_open_creates_layout() {
    let (temp, engine) = setup_temp_engine();

    assert!(temp.path().join("manifest.bin").exists());
    assert!(temp.path().join(PRIMARY_LOG_FILE).exists());
    assert!(engine.ranges().is_empty());
    engine.close().unwrap();
}

#[test]
fn test_submit_and_recover() {
    let (_temp, engine) = setup_temp_engine();

    for local in 1..=3u64 {
        let version = engine
            .submit(1, 0, ChunkId::new(1, local), format!("chunk-{}", local).as_bytes())
            .unwrap();
        assert_eq!(version, Version::INITIAL);
    }
    engine.flush(1, 0).unwrap();

    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 3);
    for (i, entry) in recovered.iter().enumerate() {
        let local = i as u64 + 1;
        assert_eq!(entry.chunk_id, ChunkId::new(1, local));
        assert_eq!(entry.version, Version::INITIAL);
        assert_eq!(&entry.payload[..], format!("chunk-{}", local).as_bytes());
    }
}

#[test]
fn test_recover_returns_latest_in_submission_order() {
    let (_temp, engine) = setup_temp_engine();
    let a = ChunkId::new(1, 1);
    let b = ChunkId::new(1, 2);

    engine.submit(1, 0, a, b"a-1").unwrap();
    engine.submit(1, 0, b, b"b-1").unwrap();
    let latest = engine.submit(1, 0, a, b"a-2").unwrap();

    let recovered = engine.recover_range(1, 0).unwrap();
    let order: Vec<ChunkId> = recovered.iter().map(|e| e.chunk_id).collect();

    assert_eq!(order, vec![b, a]);
    assert_eq!(recovered[1].version, latest);
    assert_eq!(&recovered[1].payload[..], b"a-2");
}

#[test]
fn test_chained_entry_round_trip() {
    let (_temp, engine) = setup_temp_engine();
    // Larger than one fragment (half a segment)
    let payload: Vec<u8> = (0..100 * 1024).map(|i| (i % 251) as u8).collect();

    engine.submit(1, 0, ChunkId::new(1, 1), &payload).unwrap();
    engine.submit(1, 0, ChunkId::new(1, 2), b"after").unwrap();

    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 2);
    assert_eq!(recovered[0].payload.len(), payload.len());
    assert_eq!(&recovered[0].payload[..], &payload[..]);
    assert_eq!(&recovered[1].payload[..], b"after");
}

#[test]
fn test_recover_is_idempotent() {
    let (_temp, engine) = setup_temp_engine();
    engine.submit(1, 0, ChunkId::new(1, 1), b"stable").unwrap();

    let first = engine.recover_range(1, 0).unwrap();
    let second = engine.recover_range(1, 0).unwrap();

    assert_eq!(first, second);
}

#[test]
fn test_shared_pool_and_versions() {
    let temp_dir = TempDir::new().unwrap();
    let config = small_config(temp_dir.path());
    let pool = Arc::new(BufferPool::new(config.segment_size));
    let versions = Arc::new(VersionTable::new());
    let engine = LogEngine::open_with(config, Arc::clone(&pool), Arc::clone(&versions)).unwrap();

    let version = engine.submit(3, 1, ChunkId::new(3, 9), b"shared").unwrap();

    assert_eq!(versions.current(RangeKey::new(3, 1), ChunkId::new(3, 9)), Some(version));
    assert!(Arc::ptr_eq(engine.pool(), &pool));
}

// =============================================================================
// Removal Tests
// =============================================================================

#[test]
fn test_submit_remove_recovers_tombstone() {
    let (_temp, engine) = setup_temp_engine();
    let chunk = ChunkId::new(1, 5);

    engine.submit(1, 0, chunk, b"doomed").unwrap();
    let removed = engine.submit_remove(1, 0, chunk).unwrap();

    assert!(removed.is_tombstone());
    assert_eq!(engine.current_version(1, 0, chunk), Some(removed));

    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 1);
    assert!(recovered[0].is_tombstone());
    assert!(recovered[0].payload.is_empty());

    // Writing again after removal starts a new epoch
    let rewritten = engine.submit(1, 0, chunk, b"back").unwrap();
    assert!(rewritten > removed);
}

#[test]
fn test_remove_range() {
    let (_temp, engine) = setup_temp_engine();
    engine.submit(2, 4, ChunkId::new(2, 1), b"gone soon").unwrap();
    engine.recover_range(2, 4).unwrap();

    assert!(engine.remove_range(2, 4).unwrap());

    assert!(engine.ranges().is_empty());
    assert_eq!(engine.current_version(2, 4, ChunkId::new(2, 1)), None);
    assert!(matches!(engine.recover_range(2, 4), Err(LogError::UnknownRange(_))));
    assert!(!engine.remove_range(2, 4).unwrap());
}

#[test]
fn test_unknown_range_errors() {
    let (_temp, engine) = setup_temp_engine();

    assert!(matches!(engine.recover_range(9, 9), Err(LogError::UnknownRange(_))));
    assert!(matches!(
        engine.request_reorganization(9, 9, true),
        Err(LogError::UnknownRange(_))
    ));
    assert_eq!(engine.occupied_space(9, 9), 0);
}

// =============================================================================
// Two-Level Logging Tests
// =============================================================================

#[test]
fn test_small_range_staged_through_primary_log() {
    let temp_dir = TempDir::new().unwrap();
    let engine = LogEngine::open(staging_config(temp_dir.path())).unwrap();

    for local in 0..1000u64 {
        engine.submit(1, 0, ChunkId::new(1, local), &[local as u8; 64]).unwrap();
    }
    engine.flush(1, 0).unwrap();

    assert_eq!(engine.primary_log_entry_count().unwrap(), 1000);
    assert_eq!(engine.occupied_space(1, 0), 0);

    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 1000);
    assert!(engine.occupied_space(1, 0) > 0);
    assert_eq!(recovered[999].chunk_id, ChunkId::new(1, 999));
    assert_eq!(&recovered[999].payload[..], &[999u64 as u8; 64][..]);
}

#[test]
fn test_direct_logging_without_primary_log() {
    let temp_dir = TempDir::new().unwrap();
    let mut config = small_config(temp_dir.path());
    config.two_level_logging = false;
    let engine = LogEngine::open(config).unwrap();

    engine.submit(1, 0, ChunkId::new(1, 1), b"direct").unwrap();
    engine.flush(1, 0).unwrap();

    assert!(engine.occupied_space(1, 0) > 0);
    assert_eq!(engine.primary_log_entry_count().unwrap(), 0);
    assert!(!temp_dir.path().join(PRIMARY_LOG_FILE).exists());
}

#[test]
fn test_order_kept_across_primary_log_overflows() {
    let temp_dir = TempDir::new().unwrap();
    let engine = LogEngine::open(small_config(temp_dir.path())).unwrap();
    const RANGES: u16 = 40;
    const ROUNDS: u64 = 6;
    const PAYLOAD: usize = 1000;
    // Just under the 16 KB secondary log buffer, so every round is staged
    const STAGED_PER_ROUND: u64 = 14;
    // Owner 99 alternates between staged and direct rounds
    const MIXED: u16 = 99;

    let mut expected: Vec<(u16, Vec<ChunkId>)> = (1..=RANGES).map(|owner| (owner, Vec::new())).collect();
    expected.push((MIXED, Vec::new()));
    let mut submitted = 0;

    for round in 0..ROUNDS {
        for (owner, chunks) in expected.iter_mut() {
            let count = match *owner {
                MIXED if round % 2 == 1 => 20,
                MIXED => 4,
                _ => STAGED_PER_ROUND,
            };
            for i in 0..count {
                let chunk = ChunkId::new(*owner, round * 100 + i);
                engine
                    .submit(*owner, 0, chunk, &vec![(round + i) as u8; PAYLOAD])
                    .unwrap();
                chunks.push(chunk);
                submitted += 1;
            }
        }
        engine.flush_all().unwrap();
    }

    // Staged rounds of 40 ranges add up to more than the 1 MB primary log
    assert!(engine.primary_log_entry_count().unwrap() < submitted);
    assert_eq!(engine.utilization_report().degraded_ranges(), 0);

    for (owner, chunks) in &expected {
        let recovered = engine.recover_range(*owner, 0).unwrap();
        let order: Vec<ChunkId> = recovered.iter().map(|e| e.chunk_id).collect();
        assert_eq!(&order, chunks, "range {} out of order", owner);
        for entry in &recovered {
            let local = entry.chunk_id.local_id();
            let fill = (local / 100 + local % 100) as u8;
            assert_eq!(&entry.payload[..], &vec![fill; PAYLOAD][..]);
        }
    }
}

// =============================================================================
// Reorganization Tests
// =============================================================================

#[test]
fn test_overwrite_then_reorganize_keeps_latest() {
    let (_temp, engine) = setup_temp_engine();
    let chunk = ChunkId(0x0002_0000_0000_0001);

    assert_eq!(engine.submit(2, 0, chunk, b"first").unwrap(), Version::new(0, 1));
    assert_eq!(engine.submit(2, 0, chunk, b"second").unwrap(), Version::new(0, 2));

    engine.request_reorganization(2, 0, true).unwrap();

    let recovered = engine.recover_range(2, 0).unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(recovered[0].version, Version::new(0, 2));
    assert_eq!(&recovered[0].payload[..], b"second");
}

#[test]
fn test_reorganization_reclaims_overwritten_segments() {
    let (_temp, engine) = setup_temp_engine();

    for local in 1..=8u64 {
        engine.submit(1, 0, ChunkId::new(1, local), &big_payload(1)).unwrap();
    }
    engine.flush(1, 0).unwrap();
    for local in 1..=8u64 {
        engine.submit(1, 0, ChunkId::new(1, local), &big_payload(2)).unwrap();
    }
    engine.flush(1, 0).unwrap();
    let before = engine.occupied_space(1, 0);

    engine.request_reorganization(1, 0, true).unwrap();

    assert_eq!(engine.occupied_space(1, 0), before / 2);
    let report = engine.utilization_report();
    assert!(report.reorg.full_passes >= 1);
    assert!(report.reorg.entries_dropped >= 8);

    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 8);
    for entry in &recovered {
        assert_eq!(entry.version, Version::new(0, 2));
        assert_eq!(&entry.payload[..], &big_payload(2)[..]);
    }
}

#[test]
fn test_overwrites_stay_within_log_capacity() {
    let (_temp, engine) = setup_temp_engine();
    let capacity = 512 * 1024;

    for round in 0..20u8 {
        for local in 1..=4u64 {
            engine.submit(1, 0, ChunkId::new(1, local), &big_payload(round)).unwrap();
        }
        engine.flush(1, 0).unwrap();
        assert!(engine.occupied_space(1, 0) <= capacity);
    }

    let report = engine.utilization_report();
    assert_eq!(report.degraded_ranges(), 0);

    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 4);
    for entry in &recovered {
        assert_eq!(entry.version, Version::new(0, 20));
        assert_eq!(&entry.payload[..], &big_payload(19)[..]);
    }
}

#[test]
fn test_full_log_without_stale_data_degrades() {
    let (_temp, engine) = setup_temp_engine();

    for local in 1..=30u64 {
        match engine.submit(1, 0, ChunkId::new(1, local), &big_payload(local as u8)) {
            Ok(_) => engine.flush(1, 0).unwrap(),
            Err(LogError::Degraded(_)) => break,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }

    let result = engine.submit(1, 0, ChunkId::new(1, 99), b"refused");
    assert!(matches!(result, Err(LogError::Degraded(_))));
    assert_eq!(engine.utilization_report().degraded_ranges(), 1);

    // What reached the log is still recoverable: 8 segments of 3 entries
    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 24);

    // Other ranges are unaffected
    engine.submit(2, 0, ChunkId::new(2, 1), b"fine").unwrap();
    assert_eq!(engine.recover_range(2, 0).unwrap().len(), 1);
}

// =============================================================================
// Report Tests
// =============================================================================

#[test]
fn test_utilization_report() {
    let (_temp, engine) = setup_temp_engine();
    engine.submit(1, 0, ChunkId::new(1, 1), &big_payload(0)).unwrap();
    engine.submit(2, 3, ChunkId::new(2, 1), &big_payload(1)).unwrap();
    engine.recover_range(1, 0).unwrap();
    engine.recover_range(2, 3).unwrap();

    let report = engine.utilization_report();

    assert_eq!(report.ranges.len(), 2);
    assert_eq!((report.ranges[0].owner, report.ranges[0].range_id), (1, 0));
    assert_eq!((report.ranges[1].owner, report.ranges[1].range_id), (2, 3));
    assert_eq!(
        report.total_occupied,
        engine.occupied_space(1, 0) + engine.occupied_space(2, 3)
    );
    // Entry capacity excludes the per-segment header
    assert_eq!(report.total_capacity, 2 * 8 * (64 * 1024 - 8));
    assert_eq!(report.ranges[0].segment_count, 8);
    assert!(report.ranges[0].utilization() > 0.0);

    let decoded = UtilizationReport::from_bytes(&report.to_bytes().unwrap()).unwrap();
    assert_eq!(decoded, report);
}

// =============================================================================
// Lifecycle Tests
// =============================================================================

#[test]
fn test_reopen_recovers_everything() {
    let temp_dir = TempDir::new().unwrap();
    let chunk = ChunkId::new(1, 1);
    {
        let engine = LogEngine::open(small_config(temp_dir.path())).unwrap();
        engine.submit(1, 0, chunk, b"v1").unwrap();
        engine.submit(1, 0, chunk, b"v2").unwrap();
        engine.submit(1, 2, ChunkId::new(1, 2), b"other range").unwrap();
        engine.close().unwrap();
    }

    let engine = LogEngine::open(small_config(temp_dir.path())).unwrap();

    assert_eq!(engine.ranges(), vec![RangeKey::new(1, 0), RangeKey::new(1, 2)]);
    assert_eq!(engine.current_version(1, 0, chunk), Some(Version::new(0, 2)));
    let recovered = engine.recover_range(1, 0).unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(&recovered[0].payload[..], b"v2");

    // New versions continue after the recovered ones
    assert_eq!(engine.submit(1, 0, chunk, b"v3").unwrap(), Version::new(0, 3));
}

#[test]
fn test_reopen_with_other_geometry_fails() {
    let temp_dir = TempDir::new().unwrap();
    LogEngine::open(small_config(temp_dir.path())).unwrap().close().unwrap();

    let mut config = small_config(temp_dir.path());
    config.secondary_log_size = 1024 * 1024;

    assert!(matches!(LogEngine::open(config), Err(LogError::Config(_))));
}

#[test]
fn test_open_replays_primary_log() {
    let temp_dir = TempDir::new().unwrap();
    let config = small_config(temp_dir.path());
    LogEngine::open(config.clone()).unwrap().close().unwrap();

    // Entries staged in the primary log by a run that never closed
    {
        let primary = PrimaryLog::open(&temp_dir.path().join(PRIMARY_LOG_FILE), config.primary_log_size).unwrap();
        let payload = b"left behind";
        let header = PrimaryHeader {
            owner: 5,
            range_id: 1,
            chunk_id: ChunkId::new(5, 42),
            length: payload.len() as u32,
            version: Version::INITIAL,
            timestamp: Some(3),
            chain: None,
            checksum: Some(crc32fast::hash(payload)),
        };
        let mut bytes = header.encode();
        bytes.extend_from_slice(payload);
        primary.append(&bytes).unwrap();
        primary.sync().unwrap();
    }

    let engine = LogEngine::open(config).unwrap();

    assert_eq!(engine.primary_log_entry_count().unwrap(), 0);
    assert_eq!(engine.current_version(5, 1, ChunkId::new(5, 42)), Some(Version::INITIAL));
    let recovered = engine.recover_range(5, 1).unwrap();
    assert_eq!(recovered.len(), 1);
    assert_eq!(&recovered[0].payload[..], b"left behind");
}
