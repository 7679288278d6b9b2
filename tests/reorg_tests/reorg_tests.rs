//! Tests for reorganization
//!
//! These tests verify:
//! - Log selection (largest first, periodic random pick, newest skipped)
//! - Cost-benefit segment selection
//! - Segment cleaning: stale entries dropped, survivors moved, order kept
//! - Cleaning never drops an entry whose newer version is not yet durable
//! - A partially written chained version never replaces the last complete one
//! - The reorganization thread running an urgent full pass

use std::sync::Arc;
use std::time::Duration;

use chunklog::header::{ChainInfo, SecondaryHeader};
use chunklog::log::{recover_log, AccessFlag, LogCatalog, LogGeometry, SecondaryLog, SegmentInfo};
use chunklog::reorg::{
    choose_segment, clean_segment, cost_benefit, LogCandidate, ReorgCoordinator, ReorgPolicy, ReorgThread,
};
use chunklog::types::Clock;
use chunklog::version::{VersionSnapshot, VersionTable};
use chunklog::{ChunkId, Config, RangeKey, Version};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

const SEGMENT: usize = 4096;
const SEGMENTS: usize = 4;
const OWNER: u16 = 1;
/// Two entries fill a segment, the third opens the next one
const PAYLOAD: usize = 1500;

fn geometry() -> LogGeometry {
    LogGeometry {
        segment_size: SEGMENT,
        segment_count: SEGMENTS,
        activation_bytes: (SEGMENT * SEGMENTS) as u64,
    }
}

fn key() -> RangeKey {
    RangeKey::new(OWNER, 0)
}

fn setup_temp_log() -> (TempDir, SecondaryLog) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(key().log_file_name());
    let log = SecondaryLog::create(&path, key(), geometry(), Arc::new(Clock::new())).unwrap();
    (temp_dir, log)
}

fn entry(local: u64, version: Version, fill: u8) -> Vec<u8> {
    let payload = vec![fill; PAYLOAD];
    let header = SecondaryHeader {
        chunk_id: ChunkId::new(OWNER, local),
        migrated: false,
        length: PAYLOAD as u32,
        version,
        timestamp: None,
        chain: None,
        checksum: Some(crc32fast::hash(&payload)),
    };
    let mut bytes = header.encode();
    bytes.extend_from_slice(&payload);
    bytes
}

/// One fragment of a chained version; fragments carry `PAYLOAD` bytes each
fn fragment(local: u64, version: Version, index: u8, count: u8, fill: u8) -> Vec<u8> {
    let payload = vec![fill; PAYLOAD];
    let header = SecondaryHeader {
        chunk_id: ChunkId::new(OWNER, local),
        migrated: false,
        length: PAYLOAD as u32,
        version,
        timestamp: None,
        chain: Some(ChainInfo { index, count }),
        checksum: Some(crc32fast::hash(&payload)),
    };
    let mut bytes = header.encode();
    bytes.extend_from_slice(&payload);
    bytes
}

/// Segment 0: chunk 1 v1, chunk 2 v1 (closed); segment 1: the first
/// `fragments` of a two-fragment chunk 1 v2
///
/// The log is reopened from disk and the version table rebuilt from it, as
/// after a restart.
fn write_chained_overwrite(temp_dir: &TempDir, fragments: u8) -> (SecondaryLog, VersionTable) {
    let path = temp_dir.path().join(key().log_file_name());
    let clock = Arc::new(Clock::new());
    {
        let log = SecondaryLog::create(&path, key(), geometry(), Arc::clone(&clock)).unwrap();
        log.append(&entry(1, Version::new(0, 1), 0x11)).unwrap();
        log.append(&entry(2, Version::new(0, 1), 0x21)).unwrap();
        for index in 0..fragments {
            log.append(&fragment(1, Version::new(0, 2), index, 2, 0x30 + index)).unwrap();
        }
        log.sync().unwrap();
    }

    let (log, _) = SecondaryLog::open(&path, key(), geometry(), clock).unwrap();
    let versions = VersionTable::new();
    versions.rebuild(key(), log.chunk_versions());
    (log, versions)
}

fn entry_len() -> usize {
    entry(0, Version::INITIAL, 0).len()
}

/// Segment 0: chunk 1 v1, chunk 2 v1 (closed); segment 1: chunk 1 v2 (open)
fn write_overwrite_scenario(log: &SecondaryLog, versions: &VersionTable) {
    log.append(&entry(1, Version::new(0, 1), 0x11)).unwrap();
    log.append(&entry(2, Version::new(0, 1), 0x21)).unwrap();
    log.append(&entry(1, Version::new(0, 2), 0x12)).unwrap();

    versions.observe(key(), ChunkId::new(OWNER, 1), Version::new(0, 2));
    versions.observe(key(), ChunkId::new(OWNER, 2), Version::new(0, 1));
}

fn candidate(owner: u16, occupied: u64, needs: bool) -> LogCandidate {
    LogCandidate {
        key: RangeKey::new(owner, 0),
        occupied,
        needs_reorganization: needs,
    }
}

fn segment(used: u32, live: u32, last_write: u32) -> SegmentInfo {
    SegmentInfo {
        sequence: 1,
        used,
        live,
        created: 0,
        last_write,
    }
}

// =============================================================================
// Log Selection Tests
// =============================================================================

#[test]
fn test_policy_picks_largest_log_needing_work() {
    let mut policy = ReorgPolicy::new(u32::MAX, true);
    let mut rng = StdRng::seed_from_u64(7);
    let candidates = [candidate(1, 500, true), candidate(2, 900, true), candidate(3, 5000, false)];

    assert_eq!(policy.choose_log(&candidates, None, &mut rng), Some(RangeKey::new(2, 0)));
}

#[test]
fn test_policy_tie_goes_to_lower_key() {
    let mut policy = ReorgPolicy::new(u32::MAX, true);
    let mut rng = StdRng::seed_from_u64(7);
    let candidates = [candidate(4, 100, true), candidate(2, 100, true)];

    assert_eq!(policy.choose_log(&candidates, None, &mut rng), Some(RangeKey::new(2, 0)));
}

#[test]
fn test_policy_nothing_to_do() {
    let mut policy = ReorgPolicy::new(u32::MAX, true);
    let mut rng = StdRng::seed_from_u64(7);

    assert_eq!(policy.choose_log(&[], None, &mut rng), None);
    assert_eq!(policy.choose_log(&[candidate(1, 10, false)], None, &mut rng), None);
}

#[test]
fn test_policy_random_pick_every_third_skips_newest() {
    let mut policy = ReorgPolicy::default();
    let mut rng = StdRng::seed_from_u64(42);
    let candidates = [candidate(1, 10, false), candidate(2, 20, false), candidate(3, 9000, true)];
    let newest = Some(RangeKey::new(3, 0));

    for round in 0..30 {
        let picked = policy.choose_log(&candidates, newest, &mut rng);
        if round % 3 == 2 {
            let picked = picked.unwrap();
            assert_ne!(picked, RangeKey::new(3, 0));
        } else {
            assert_eq!(picked, Some(RangeKey::new(3, 0)));
        }
    }
}

#[test]
fn test_policy_random_pick_keeps_single_newest_log() {
    let mut policy = ReorgPolicy::new(0, true);
    let mut rng = StdRng::seed_from_u64(1);
    let candidates = [candidate(5, 10, false)];

    assert_eq!(
        policy.choose_log(&candidates, Some(RangeKey::new(5, 0)), &mut rng),
        Some(RangeKey::new(5, 0))
    );
}

// =============================================================================
// Segment Selection Tests
// =============================================================================

#[test]
fn test_cost_benefit_prefers_empty_and_old_segments() {
    let capacity = 1000;

    assert!(cost_benefit(&segment(800, 0, 0), capacity, 10, 100).is_infinite());

    let young = cost_benefit(&segment(800, 400, 90), capacity, 100, 1000);
    let old = cost_benefit(&segment(800, 400, 10), capacity, 100, 1000);
    assert!(old > young);

    // Age is capped at the cold threshold
    let cold = cost_benefit(&segment(800, 400, 0), capacity, 10_000, 100);
    let colder = cost_benefit(&segment(800, 400, 0), capacity, 50_000, 100);
    assert_eq!(cold, colder);
}

#[test]
fn test_cost_benefit_age_floor() {
    let just_written = cost_benefit(&segment(800, 500, 100), 1000, 100, 1000);

    assert!(just_written > 0.0);
}

#[test]
fn test_choose_segment() {
    let capacity = 1000;
    let candidates = [
        (0, segment(900, 800, 0)),
        (1, segment(900, 100, 0)),
        (2, segment(900, 500, 0)),
    ];
    assert_eq!(choose_segment(&candidates, capacity, 100, 1000), Some(1));

    let with_empty = [(3, segment(900, 100, 0)), (4, segment(900, 0, 99))];
    assert_eq!(choose_segment(&with_empty, capacity, 100, 1000), Some(4));

    assert_eq!(choose_segment(&[], capacity, 100, 1000), None);
}

// =============================================================================
// Cleaner Tests
// =============================================================================

#[test]
fn test_clean_moves_survivors_and_keeps_order() {
    let (_temp, log) = setup_temp_log();
    let versions = VersionTable::new();
    write_overwrite_scenario(&log, &versions);
    let len = entry_len() as u64;

    let stats = clean_segment(&log, 0, &versions.snapshot(key())).unwrap();

    assert_eq!(stats.segments_cleaned, 1);
    assert_eq!(stats.segments_freed, 1);
    assert_eq!(stats.entries_dropped, 1);
    assert_eq!(stats.entries_kept, 1);
    assert_eq!(stats.bytes_reclaimed, len);
    assert_eq!(log.occupied_space(), 2 * len);
    assert_eq!(log.live_bytes(), 2 * len);
    assert!(log.segment_table()[0].is_free());

    let recovered = recover_log(&log).unwrap();
    let order: Vec<(ChunkId, Version)> = recovered.entries.iter().map(|e| (e.chunk_id, e.version)).collect();
    assert_eq!(
        order,
        vec![
            (ChunkId::new(OWNER, 2), Version::new(0, 1)),
            (ChunkId::new(OWNER, 1), Version::new(0, 2)),
        ]
    );
}

#[test]
fn test_clean_is_idempotent() {
    let (_temp, log) = setup_temp_log();
    let versions = VersionTable::new();
    write_overwrite_scenario(&log, &versions);
    let snapshot = versions.snapshot(key());

    clean_segment(&log, 0, &snapshot).unwrap();
    let occupied = log.occupied_space();
    let table = log.segment_table();

    for (index, _) in log.segments_in_order() {
        let stats = clean_segment(&log, index, &snapshot).unwrap();
        assert_eq!(stats.segments_cleaned, 0);
    }
    assert_eq!(log.occupied_space(), occupied);
    assert_eq!(log.segment_table(), table);
}

#[test]
fn test_clean_frees_fully_stale_segment() {
    let (_temp, log) = setup_temp_log();
    let versions = VersionTable::new();
    log.append(&entry(1, Version::new(0, 1), 1)).unwrap();
    log.append(&entry(2, Version::new(0, 1), 2)).unwrap();
    log.append(&entry(1, Version::new(0, 2), 3)).unwrap();
    log.append(&entry(2, Version::new(0, 2), 4)).unwrap();
    versions.observe(key(), ChunkId::new(OWNER, 1), Version::new(0, 2));
    versions.observe(key(), ChunkId::new(OWNER, 2), Version::new(0, 2));

    let stats = clean_segment(&log, 0, &versions.snapshot(key())).unwrap();

    assert_eq!(stats.entries_kept, 0);
    assert_eq!(stats.entries_dropped, 2);
    assert_eq!(stats.segments_freed, 1);
    assert_eq!(log.free_segments(), SEGMENTS - 1);
}

#[test]
fn test_clean_keeps_entry_when_snapshot_lags() {
    let (_temp, log) = setup_temp_log();
    let versions = VersionTable::new();
    write_overwrite_scenario(&log, &versions);

    // Snapshot taken before the newer version was stamped
    let lagging = VersionTable::new();
    lagging.observe(key(), ChunkId::new(OWNER, 1), Version::new(0, 1));
    lagging.observe(key(), ChunkId::new(OWNER, 2), Version::new(0, 1));
    let before = log.occupied_space();

    let stats = clean_segment(&log, 0, &lagging.snapshot(key())).unwrap();

    assert_eq!(stats.segments_cleaned, 0);
    assert_eq!(log.occupied_space(), before);
}

#[test]
fn test_clean_keeps_entry_without_durable_newer_version() {
    let (_temp, log) = setup_temp_log();
    log.append(&entry(1, Version::new(0, 1), 1)).unwrap();
    log.append(&entry(2, Version::new(0, 1), 2)).unwrap();
    log.append(&entry(3, Version::new(0, 1), 3)).unwrap();

    // The table already knows a newer version that never reached the log
    let versions = VersionTable::new();
    versions.observe(key(), ChunkId::new(OWNER, 1), Version::new(0, 5));

    let stats = clean_segment(&log, 0, &versions.snapshot(key())).unwrap();

    assert_eq!(stats.entries_dropped, 0);
    assert_eq!(recover_log(&log).unwrap().entries.len(), 3);
}

#[test]
fn test_clean_keeps_last_complete_version_behind_partial_chain() {
    let temp_dir = TempDir::new().unwrap();
    let (log, versions) = write_chained_overwrite(&temp_dir, 1);
    let chunk = ChunkId::new(OWNER, 1);

    // The partial version counts for version assignment but not as durable
    assert_eq!(log.current_version(chunk), Some(Version::new(0, 1)));
    assert_eq!(versions.snapshot(key()).get(chunk), Some(Version::new(0, 2)));

    let stats = clean_segment(&log, 0, &versions.snapshot(key())).unwrap();

    assert_eq!(stats.entries_dropped, 0);
    assert_eq!(stats.segments_cleaned, 0);

    let recovered = recover_log(&log).unwrap();
    assert_eq!(recovered.incomplete_chains, 1);
    assert_eq!(recovered.entries.len(), 2);
    let first = recovered.entries.iter().find(|e| e.chunk_id == chunk).unwrap();
    assert_eq!(first.version, Version::new(0, 1));
    assert_eq!(&first.payload[..], &vec![0x11u8; PAYLOAD][..]);
}

#[test]
fn test_clean_drops_old_version_once_chain_is_complete() {
    let temp_dir = TempDir::new().unwrap();
    let (log, versions) = write_chained_overwrite(&temp_dir, 2);
    let chunk = ChunkId::new(OWNER, 1);

    assert_eq!(log.current_version(chunk), Some(Version::new(0, 2)));

    let stats = clean_segment(&log, 0, &versions.snapshot(key())).unwrap();

    assert_eq!(stats.entries_dropped, 1);
    assert_eq!(stats.entries_kept, 1);

    let recovered = recover_log(&log).unwrap();
    assert_eq!(recovered.incomplete_chains, 0);
    let latest = recovered.entries.iter().find(|e| e.chunk_id == chunk).unwrap();
    assert_eq!(latest.version, Version::new(0, 2));
    let mut expected = vec![0x30u8; PAYLOAD];
    expected.extend_from_slice(&[0x31u8; PAYLOAD]);
    assert_eq!(&latest.payload[..], &expected[..]);
}

#[test]
fn test_partial_chain_keeps_old_version_live_while_appending() {
    let (_temp, log) = setup_temp_log();
    let chunk = ChunkId::new(OWNER, 1);
    log.append(&entry(1, Version::new(0, 1), 0x11)).unwrap();
    let complete = log.live_bytes();

    log.append(&fragment(1, Version::new(0, 2), 0, 2, 0x30)).unwrap();
    assert_eq!(log.current_version(chunk), Some(Version::new(0, 1)));
    assert!(log.live_bytes() > complete);

    log.append(&fragment(1, Version::new(0, 2), 1, 2, 0x31)).unwrap();
    assert_eq!(log.current_version(chunk), Some(Version::new(0, 2)));
    assert_eq!(log.live_bytes(), 2 * fragment(1, Version::new(0, 2), 0, 2, 0).len() as u64);
}

#[test]
fn test_clean_with_empty_snapshot_uses_log_versions() {
    let (_temp, log) = setup_temp_log();
    let versions = VersionTable::new();
    write_overwrite_scenario(&log, &versions);

    let stats = clean_segment(&log, 0, &VersionSnapshot::default()).unwrap();

    assert_eq!(stats.entries_dropped, 1);
    assert_eq!(stats.entries_kept, 1);
}

#[test]
fn test_clean_skips_open_segment() {
    let (_temp, log) = setup_temp_log();
    let versions = VersionTable::new();
    write_overwrite_scenario(&log, &versions);
    let open = log.open_segment().unwrap();

    let stats = clean_segment(&log, open, &versions.snapshot(key())).unwrap();

    assert_eq!(stats.segments_cleaned, 0);
}

#[test]
fn test_clean_drops_checksum_failures() {
    let (_temp, log) = setup_temp_log();
    let mut bad = entry(1, Version::new(0, 1), 1);
    let last = bad.len() - 1;
    bad[last] ^= 0xFF;
    log.append(&bad).unwrap();
    log.append(&entry(2, Version::new(0, 1), 2)).unwrap();
    log.append(&entry(3, Version::new(0, 1), 3)).unwrap();

    let stats = clean_segment(&log, 0, &VersionSnapshot::default()).unwrap();

    assert_eq!(stats.corrupt_entries, 1);
    assert_eq!(stats.entries_kept, 1);
    let recovered = recover_log(&log).unwrap();
    assert_eq!(recovered.corrupt, 0);
    assert_eq!(recovered.entries.len(), 2);
}

// =============================================================================
// Reorganization Thread Tests
// =============================================================================

#[test]
fn test_coordinator_stopped_rejects_blocking_request() {
    let coordinator = ReorgCoordinator::new(Arc::new(AccessFlag::new()));
    coordinator.stop();

    assert!(coordinator.is_stopped());
    assert!(!coordinator.reorganize_blocking(key()));
}

#[test]
fn test_thread_runs_urgent_full_pass() {
    let temp_dir = TempDir::new().unwrap();
    let config = Config::builder()
        .backup_dir(temp_dir.path())
        .segment_size(SEGMENT)
        .secondary_log_size(SEGMENT * SEGMENTS)
        .build();
    let clock = Arc::new(Clock::new());
    let catalog = Arc::new(LogCatalog::new(temp_dir.path(), geometry(), 1024, Arc::clone(&clock)));
    let versions = Arc::new(VersionTable::new());
    let range = catalog.get_or_create(key()).unwrap();
    write_overwrite_scenario(&range.log, &versions);

    let coordinator = Arc::new(ReorgCoordinator::new(Arc::new(AccessFlag::new())));
    let thread = ReorgThread::spawn(
        &config,
        Arc::clone(&coordinator),
        Arc::clone(&catalog),
        Arc::clone(&versions),
        clock,
    )
    .unwrap();

    // Nobody else grants access; the blocked caller does it itself
    assert!(coordinator.reorganize_blocking(key()));

    let totals = coordinator.stats().totals();
    assert_eq!(totals.full_passes, 1);
    assert_eq!(totals.segments_cleaned, 1);
    assert_eq!(totals.entries_dropped, 1);
    assert_eq!(range.log.occupied_space(), 2 * entry_len() as u64);

    // Unknown ranges complete without work
    assert!(coordinator.reorganize_blocking(RangeKey::new(9, 9)));

    assert!(thread.shutdown(Duration::from_secs(5)));
    assert!(!coordinator.reorganize_blocking(key()));
}
