//! Tests for versions and the version table
//!
//! These tests verify:
//! - Version ordering, tombstones and epoch rollover
//! - Per-range stamping of writes and removals
//! - Snapshots and rebuilding from observed versions

use std::sync::Arc;
use std::thread;

use chunklog::version::{VersionTable, TOMBSTONE_VERSION};
use chunklog::{ChunkId, RangeKey, Version};

fn key(owner: u16, range: u16) -> RangeKey {
    RangeKey::new(owner, range)
}

// =============================================================================
// Version Tests
// =============================================================================

#[test]
fn test_version_ordering() {
    assert!(Version::new(0, 1) < Version::new(0, 2));
    assert!(Version::new(0, 2) < Version::tombstone(0));
    assert!(Version::tombstone(0) < Version::new(1, 1));
    assert!(Version::new(0, u32::MAX - 1) < Version::new(1, 1));
}

#[test]
fn test_version_next() {
    assert_eq!(Version::INITIAL.next(), Version::new(0, 2));
    assert_eq!(Version::tombstone(3).next(), Version::new(4, 1));

    // The counter rolls into a new epoch before reaching the sentinel
    let last = Version::new(0, TOMBSTONE_VERSION - 1);
    assert_eq!(last.next(), Version::new(1, 1));
}

#[test]
fn test_version_display() {
    assert_eq!(Version::new(2, 5).to_string(), "(2, 5)");
    assert_eq!(Version::tombstone(1).to_string(), "(1, removed)");
}

// =============================================================================
// Version Table Tests
// =============================================================================

#[test]
fn test_table_next_version_per_chunk() {
    let table = VersionTable::new();
    let range = key(1, 0);
    let a = ChunkId::new(1, 1);
    let b = ChunkId::new(1, 2);

    assert_eq!(table.next_version(range, a), Version::new(0, 1));
    assert_eq!(table.next_version(range, a), Version::new(0, 2));
    assert_eq!(table.next_version(range, b), Version::new(0, 1));
    assert_eq!(table.current(range, a), Some(Version::new(0, 2)));
    assert_eq!(table.range_len(range), 2);
}

#[test]
fn test_table_ranges_are_independent() {
    let table = VersionTable::new();
    let chunk = ChunkId::new(1, 1);

    table.next_version(key(1, 0), chunk);
    table.next_version(key(1, 0), chunk);

    assert_eq!(table.next_version(key(1, 1), chunk), Version::INITIAL);
    assert_eq!(table.current(key(2, 0), chunk), None);
}

#[test]
fn test_table_removal_then_rewrite() {
    let table = VersionTable::new();
    let range = key(1, 0);
    let chunk = ChunkId::new(1, 7);

    let written = table.next_version(range, chunk);
    let removed = table.mark_removed(range, chunk);
    assert!(removed.is_tombstone());
    assert!(removed > written);

    let rewritten = table.next_version(range, chunk);
    assert!(rewritten > removed);
    assert_eq!(rewritten, Version::new(1, 1));

    // A second removal in a row still produces a newer tombstone
    let again = table.mark_removed(range, chunk);
    let once_more = table.mark_removed(range, chunk);
    assert!(once_more > again);
}

#[test]
fn test_table_removal_of_unknown_chunk() {
    let table = VersionTable::new();
    let removed = table.mark_removed(key(1, 0), ChunkId::new(1, 99));

    assert_eq!(removed, Version::tombstone(0));
}

#[test]
fn test_table_observe_never_lowers() {
    let table = VersionTable::new();
    let range = key(3, 1);
    let chunk = ChunkId::new(3, 1);

    table.observe(range, chunk, Version::new(0, 5));
    table.observe(range, chunk, Version::new(0, 2));

    assert_eq!(table.current(range, chunk), Some(Version::new(0, 5)));
    assert_eq!(table.next_version(range, chunk), Version::new(0, 6));
}

#[test]
fn test_table_rebuild_merges() {
    let table = VersionTable::new();
    let range = key(1, 2);
    table.next_version(range, ChunkId::new(1, 1));

    table.rebuild(
        range,
        vec![
            (ChunkId::new(1, 1), Version::new(0, 9)),
            (ChunkId::new(1, 2), Version::new(0, 3)),
        ],
    );

    assert_eq!(table.current(range, ChunkId::new(1, 1)), Some(Version::new(0, 9)));
    assert_eq!(table.current(range, ChunkId::new(1, 2)), Some(Version::new(0, 3)));
}

#[test]
fn test_table_snapshot_is_frozen() {
    let table = VersionTable::new();
    let range = key(1, 0);
    let chunk = ChunkId::new(1, 1);
    table.next_version(range, chunk);

    let snapshot = table.snapshot(range);
    table.next_version(range, chunk);

    assert_eq!(snapshot.get(chunk), Some(Version::INITIAL));
    assert_eq!(snapshot.len(), 1);
    assert!(table.snapshot(key(9, 9)).is_empty());
}

#[test]
fn test_table_remove_range() {
    let table = VersionTable::new();
    let range = key(1, 0);
    table.next_version(range, ChunkId::new(1, 1));

    table.remove_range(range);

    assert_eq!(table.range_len(range), 0);
    assert_eq!(table.current(range, ChunkId::new(1, 1)), None);
}

#[test]
fn test_table_concurrent_stamping_is_unique() {
    let table = Arc::new(VersionTable::new());
    let range = key(1, 0);
    let chunk = ChunkId::new(1, 1);

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            thread::spawn(move || (0..250).map(|_| table.next_version(range, chunk)).collect::<Vec<_>>())
        })
        .collect();

    let mut all: Vec<Version> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
    all.sort();
    all.dedup();

    assert_eq!(all.len(), 1000);
    assert_eq!(table.current(range, chunk), Some(Version::new(0, 1000)));
}
