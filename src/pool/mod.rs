//! Buffer Pool Module
//!
//! Size-classed scratch blocks for the distribution stage and the writer.
//!
//! ## Size Classes
//! ```text
//!   class    block size       blocks
//!   ─────────────────────────────────
//!   Large    segment          8
//!   Medium   segment / 8      32
//!   Small    segment / 16     64
//! ```
//!
//! Each class is a bounded lock-free ring (`crossbeam::queue::ArrayQueue`)
//! of free blocks. Blocks are allocated lazily up to the class limit, so
//! the pool never holds more than its budget and never grows past it.
//!
//! ## Acquire Policy
//! - the smallest class whose blocks hold `min_size` is tried first, then
//!   the larger ones
//! - without `must_fit`, smaller classes are accepted too, falling through
//!   Large → Medium → Small; the caller then spreads its data over several
//!   blocks
//! - when nothing is free the caller backs off and parks until a block is
//!   released

mod buffer;

pub use buffer::{PooledBuffer, SizeClass};

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam::queue::ArrayQueue;
use crossbeam::utils::Backoff;
use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::error::{LogError, Result};

/// Default number of blocks per class (Large, Medium, Small)
pub const DEFAULT_CLASS_LIMITS: [usize; 3] = [8, 32, 64];

/// Longest single park while waiting for a released block
const PARK_INTERVAL: Duration = Duration::from_millis(5);

/// Waiting longer than this is reported once per acquire
const SLOW_ACQUIRE_WARNING: Duration = Duration::from_secs(1);

const ALL_CLASSES: [SizeClass; 3] = [SizeClass::Large, SizeClass::Medium, SizeClass::Small];

struct ClassPool {
    block_size: usize,
    limit: usize,
    free: ArrayQueue<Box<[u8]>>,
    allocated: AtomicUsize,
}

impl ClassPool {
    fn new(block_size: usize, limit: usize) -> Self {
        Self {
            block_size,
            limit,
            free: ArrayQueue::new(limit.max(1)),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Pop a free block or allocate a new one within the limit
    fn take(&self) -> Option<Box<[u8]>> {
        if let Some(block) = self.free.pop() {
            return Some(block);
        }

        let mut allocated = self.allocated.load(Ordering::Acquire);
        while allocated < self.limit {
            match self.allocated.compare_exchange_weak(
                allocated,
                allocated + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(vec![0u8; self.block_size].into_boxed_slice()),
                Err(current) => allocated = current,
            }
        }

        // Another thread may have released while we raced on the counter
        self.free.pop()
    }

    fn available(&self) -> usize {
        self.free.len() + self.limit.saturating_sub(self.allocated.load(Ordering::Acquire))
    }
}

/// Pre-budgeted scratch memory shared by the engine threads
pub struct BufferPool {
    classes: [ClassPool; 3],
    wait_lock: Mutex<()>,
    released: Condvar,
}

impl BufferPool {
    /// Pool with the default block counts for the given segment size
    pub fn new(segment_size: usize) -> Self {
        Self::with_limits(segment_size, DEFAULT_CLASS_LIMITS)
    }

    /// Pool with explicit block counts (Large, Medium, Small)
    pub fn with_limits(segment_size: usize, limits: [usize; 3]) -> Self {
        Self {
            classes: [
                ClassPool::new(segment_size, limits[0]),
                ClassPool::new((segment_size / 8).max(1), limits[1]),
                ClassPool::new((segment_size / 16).max(1), limits[2]),
            ],
            wait_lock: Mutex::new(()),
            released: Condvar::new(),
        }
    }

    /// Block size of a class
    pub fn block_size(&self, class: SizeClass) -> usize {
        self.classes[class.index()].block_size
    }

    /// Blocks of a class that can be handed out right now
    pub fn available(&self, class: SizeClass) -> usize {
        self.classes[class.index()].available()
    }

    /// Acquire a block, waiting for a release if the pool is exhausted
    ///
    /// Fails only with `CapacityExceeded` when `min_size` is larger than a
    /// Large block.
    pub fn acquire(&self, min_size: usize, must_fit: bool) -> Result<PooledBuffer> {
        let backoff = Backoff::new();
        let started = Instant::now();
        let mut warned = false;

        loop {
            match self.try_acquire(min_size, must_fit) {
                Err(LogError::BufferPoolExhausted(_)) => {}
                other => return other,
            }

            if backoff.is_completed() {
                let mut guard = self.wait_lock.lock();
                self.released.wait_for(&mut guard, PARK_INTERVAL);
            } else {
                backoff.snooze();
            }

            if !warned && started.elapsed() > SLOW_ACQUIRE_WARNING {
                warn!(
                    min_size,
                    must_fit, "Buffer pool exhausted, still waiting for a released block"
                );
                warned = true;
            }
        }
    }

    /// Acquire a block without waiting
    pub fn try_acquire(&self, min_size: usize, must_fit: bool) -> Result<PooledBuffer> {
        let large = self.block_size(SizeClass::Large);
        if min_size > large {
            return Err(LogError::CapacityExceeded(format!(
                "requested buffer of {} bytes, largest pooled block is {}",
                min_size, large
            )));
        }

        // Smallest fitting class first
        for class in ALL_CLASSES.iter().rev() {
            let pool = &self.classes[class.index()];
            if pool.block_size >= min_size {
                if let Some(block) = pool.take() {
                    return Ok(PooledBuffer::new(block, *class));
                }
            }
        }

        if !must_fit {
            for class in ALL_CLASSES.iter() {
                let pool = &self.classes[class.index()];
                if pool.block_size < min_size {
                    if let Some(block) = pool.take() {
                        return Ok(PooledBuffer::new(block, *class));
                    }
                }
            }
        }

        Err(LogError::BufferPoolExhausted(min_size))
    }

    /// Return a block to its class
    pub fn release(&self, buffer: PooledBuffer) {
        let class = buffer.class();
        let pool = &self.classes[class.index()];
        let block = buffer.into_block();

        if block.len() != pool.block_size {
            debug_assert!(
                false,
                "block of {} bytes returned to the {:?} class ({} bytes)",
                block.len(),
                class,
                pool.block_size
            );
            error!(
                ?class,
                size = block.len(),
                "Mismatched buffer returned to the pool, dropping it"
            );
            pool.allocated.fetch_sub(1, Ordering::AcqRel);
        } else if pool.free.push(block).is_err() {
            debug_assert!(false, "{:?} class received more blocks than it allocated", class);
            pool.allocated.fetch_sub(1, Ordering::AcqRel);
        }

        let _guard = self.wait_lock.lock();
        self.released.notify_all();
    }
}
