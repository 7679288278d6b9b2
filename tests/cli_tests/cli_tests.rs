//! Tests for the chunklog CLI
//!
//! These tests verify:
//! - `recover` reports entries that only exist in the primary log
//! - `recover --replay` moves them into the secondary log and lists them
//! - `inspect` prints the utilization table of a directory

use std::path::Path;
use std::process::Command;

use chunklog::header::PrimaryHeader;
use chunklog::log::{PrimaryLog, PRIMARY_LOG_FILE};
use chunklog::{ChunkId, Config, LogEngine, Version};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn test_config(dir: &Path) -> Config {
    Config::builder()
        .backup_dir(dir)
        .segment_size(1024 * 1024)
        .secondary_log_size(8 * 1024 * 1024)
        .primary_log_size(2 * 1024 * 1024)
        .write_buffer_size(1024 * 1024)
        .process_timeout_ms(10)
        .build()
}

/// Directory with chunk 0x0005000000000001 in range 5/1's secondary log and
/// chunk 0x000500000000002a of the same range left in the primary log
fn setup_temp_backup() -> (TempDir, Config) {
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(temp_dir.path());
    {
        let engine = LogEngine::open(config.clone()).unwrap();
        engine.submit(5, 1, ChunkId::new(5, 1), b"in the secondary log").unwrap();
        engine.close().unwrap();
    }

    let primary = PrimaryLog::open(&temp_dir.path().join(PRIMARY_LOG_FILE), config.primary_log_size).unwrap();
    let payload = b"left behind";
    let header = PrimaryHeader {
        owner: 5,
        range_id: 1,
        chunk_id: ChunkId::new(5, 42),
        length: payload.len() as u32,
        version: Version::INITIAL,
        timestamp: None,
        chain: None,
        checksum: Some(crc32fast::hash(payload)),
    };
    let mut bytes = header.encode();
    bytes.extend_from_slice(payload);
    primary.append(&bytes).unwrap();
    primary.sync().unwrap();

    (temp_dir, config)
}

fn run_cli(args: &[&str]) -> String {
    let output = Command::new(env!("CARGO_BIN_EXE_chunklog-cli"))
        .args(args)
        .env("RUST_LOG", "error")
        .output()
        .unwrap();
    assert!(output.status.success(), "{}", String::from_utf8_lossy(&output.stderr));
    String::from_utf8(output.stdout).unwrap()
}

// =============================================================================
// Recover Tests
// =============================================================================

#[test]
fn test_recover_reports_primary_log_backlog() {
    let (temp_dir, _config) = setup_temp_backup();
    let dir = temp_dir.path().to_str().unwrap();

    let out = run_cli(&["recover", dir, "--owner", "5", "--range", "1"]);

    assert!(out.contains("0x0005000000000001"));
    assert!(!out.contains("0x000500000000002a"));
    assert!(out.contains("1 chunks from"));
    assert!(out.contains("1 entries of this range are only in the primary log"));

    // Reading does not replay
    let primary = PrimaryLog::open(&temp_dir.path().join(PRIMARY_LOG_FILE), 2 * 1024 * 1024).unwrap();
    assert_eq!(primary.read_entries().unwrap().0.len(), 1);
}

#[test]
fn test_recover_with_replay_includes_primary_log_entries() {
    let (temp_dir, config) = setup_temp_backup();
    let dir = temp_dir.path().to_str().unwrap();

    let out = run_cli(&["recover", dir, "--owner", "5", "--range", "1", "--replay"]);

    assert!(out.contains("0x0005000000000001"));
    assert!(out.contains("0x000500000000002a"));
    assert!(out.contains("2 chunks after replaying the primary log"));

    let out = run_cli(&["recover", dir, "--owner", "5", "--range", "1"]);
    assert!(out.contains("2 chunks from"));
    assert!(!out.contains("only in the primary log"));

    let engine = LogEngine::open(config).unwrap();
    assert_eq!(engine.primary_log_entry_count().unwrap(), 0);
}

#[test]
fn test_recover_unknown_range() {
    let (temp_dir, _config) = setup_temp_backup();
    let dir = temp_dir.path().to_str().unwrap();

    let out = run_cli(&["recover", dir, "--owner", "9", "--range", "9"]);

    assert!(out.contains("range"));
    assert!(out.contains("not found"));
}

// =============================================================================
// Inspect Tests
// =============================================================================

#[test]
fn test_inspect_prints_ranges() {
    let (temp_dir, _config) = setup_temp_backup();

    let out = run_cli(&["inspect", temp_dir.path().to_str().unwrap()]);

    assert!(out.lines().any(|line| line.starts_with("0005/1")));
    assert!(out.contains("total: 1 ranges"));
}
