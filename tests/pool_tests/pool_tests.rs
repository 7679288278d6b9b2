//! Tests for the buffer pool
//!
//! These tests verify:
//! - Class sizes and limits
//! - Smallest-fitting-class selection and fallback
//! - Exhaustion reporting without waiting
//! - Blocking acquire resumed by a release
//! - Concurrent producers never exceeding the budget

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chunklog::pool::{BufferPool, SizeClass, DEFAULT_CLASS_LIMITS};
use chunklog::LogError;

const SEGMENT: usize = 64 * 1024;

// =============================================================================
// Class Selection Tests
// =============================================================================

#[test]
fn test_pool_block_sizes() {
    let pool = BufferPool::new(SEGMENT);

    assert_eq!(pool.block_size(SizeClass::Large), SEGMENT);
    assert_eq!(pool.block_size(SizeClass::Medium), SEGMENT / 8);
    assert_eq!(pool.block_size(SizeClass::Small), SEGMENT / 16);
    assert_eq!(pool.available(SizeClass::Large), DEFAULT_CLASS_LIMITS[0]);
    assert_eq!(pool.available(SizeClass::Medium), DEFAULT_CLASS_LIMITS[1]);
    assert_eq!(pool.available(SizeClass::Small), DEFAULT_CLASS_LIMITS[2]);
}

#[test]
fn test_pool_picks_smallest_fitting_class() {
    let pool = BufferPool::new(SEGMENT);

    let small = pool.try_acquire(100, true).unwrap();
    assert_eq!(small.class(), SizeClass::Small);
    assert!(small.is_empty());

    let medium = pool.try_acquire(SEGMENT / 16 + 1, true).unwrap();
    assert_eq!(medium.class(), SizeClass::Medium);

    let large = pool.try_acquire(SEGMENT / 8 + 1, true).unwrap();
    assert_eq!(large.class(), SizeClass::Large);

    pool.release(small);
    pool.release(medium);
    pool.release(large);
}

#[test]
fn test_pool_falls_back_to_larger_class() {
    let pool = BufferPool::with_limits(SEGMENT, [2, 2, 1]);

    let first = pool.try_acquire(10, true).unwrap();
    let second = pool.try_acquire(10, true).unwrap();

    assert_eq!(first.class(), SizeClass::Small);
    assert_eq!(second.class(), SizeClass::Medium);

    pool.release(first);
    pool.release(second);
}

#[test]
fn test_pool_without_must_fit_accepts_smaller_block() {
    let pool = BufferPool::with_limits(SEGMENT, [1, 1, 1]);
    let large = pool.try_acquire(SEGMENT, true).unwrap();

    let fallback = pool.try_acquire(SEGMENT, false).unwrap();
    assert_eq!(fallback.class(), SizeClass::Medium);

    let result = pool.try_acquire(SEGMENT, true);
    assert!(matches!(result, Err(LogError::BufferPoolExhausted(_))));

    pool.release(large);
    pool.release(fallback);
}

#[test]
fn test_pool_rejects_oversized_request() {
    let pool = BufferPool::new(SEGMENT);

    assert!(matches!(pool.try_acquire(SEGMENT + 1, true), Err(LogError::CapacityExceeded(_))));
    assert!(matches!(pool.acquire(SEGMENT + 1, false), Err(LogError::CapacityExceeded(_))));
}

// =============================================================================
// Exhaustion Tests
// =============================================================================

#[test]
fn test_pool_exhaustion_and_release() {
    let pool = BufferPool::with_limits(SEGMENT, [2, 0, 0]);

    let a = pool.try_acquire(SEGMENT, true).unwrap();
    let b = pool.try_acquire(SEGMENT, true).unwrap();
    assert_eq!(pool.available(SizeClass::Large), 0);
    assert!(matches!(pool.try_acquire(1, false), Err(LogError::BufferPoolExhausted(_))));

    pool.release(a);
    assert_eq!(pool.available(SizeClass::Large), 1);
    let c = pool.try_acquire(SEGMENT, true).unwrap();

    pool.release(b);
    pool.release(c);
    assert_eq!(pool.available(SizeClass::Large), 2);
}

#[test]
fn test_pool_released_block_is_reset() {
    let pool = BufferPool::with_limits(SEGMENT, [1, 0, 0]);

    let mut block = pool.try_acquire(SEGMENT, true).unwrap();
    assert!(block.extend_from_slice(b"some staged bytes"));
    assert_eq!(block.len(), 17);
    pool.release(block);

    let block = pool.try_acquire(SEGMENT, true).unwrap();
    assert!(block.is_empty());
    assert_eq!(block.remaining(), SEGMENT);
    pool.release(block);
}

#[test]
fn test_pool_block_rejects_overflow() {
    let pool = BufferPool::with_limits(SEGMENT, [0, 0, 1]);
    let mut block = pool.try_acquire(16, true).unwrap();

    let too_much = vec![0u8; block.capacity() + 1];
    assert!(!block.extend_from_slice(&too_much));
    assert!(block.is_empty());

    pool.release(block);
}

#[test]
fn test_pool_acquire_waits_for_release() {
    let pool = Arc::new(BufferPool::with_limits(SEGMENT, [1, 0, 0]));
    let held = pool.try_acquire(SEGMENT, true).unwrap();

    let waiter = {
        let pool = Arc::clone(&pool);
        thread::spawn(move || {
            let block = pool.acquire(SEGMENT, true).unwrap();
            pool.release(block);
        })
    };

    thread::sleep(Duration::from_millis(50));
    assert!(!waiter.is_finished());

    pool.release(held);
    waiter.join().unwrap();
    assert_eq!(pool.available(SizeClass::Large), 1);
}

// =============================================================================
// Concurrency Tests
// =============================================================================

#[test]
fn test_pool_concurrent_producers_stay_within_budget() {
    let pool = Arc::new(BufferPool::with_limits(SEGMENT, [2, 0, 0]));
    let in_use = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let deadline = Instant::now() + Duration::from_secs(10);

    let handles: Vec<_> = (0..3)
        .map(|_| {
            let pool = Arc::clone(&pool);
            let in_use = Arc::clone(&in_use);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for _ in 0..50 {
                    let mut block = pool.acquire(SEGMENT, true).unwrap();
                    let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);

                    assert!(block.extend_from_slice(&[0xAB; 128]));
                    thread::yield_now();

                    in_use.fetch_sub(1, Ordering::SeqCst);
                    block.clear();
                    pool.release(block);
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }

    assert!(Instant::now() < deadline, "producers took too long");
    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(pool.available(SizeClass::Large), 2);
}
