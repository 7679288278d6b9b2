//! Buffer nodes
//!
//! Per-round, per-range accumulation of entries taken from the write buffer.
//! A node spans as many pooled blocks as it needs; no entry is ever split
//! between two blocks, so every block can be posted on its own.
//!
//! Room for an entry is reserved (`ensure`) before anything is written, so
//! an entry lands either in both the node and the primary batch or in
//! neither.

use crate::error::Result;
use crate::header::SecondaryHeader;
use crate::pool::{BufferPool, PooledBuffer, SizeClass};
use crate::types::RangeKey;

/// Where a range's entries go in this round
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Low volume: primary log copy + secondary log buffer
    Staged,
    /// High volume: straight to the secondary log
    Direct,
}

/// Chain of pooled blocks filled front to back
#[derive(Debug, Default)]
pub struct BufferChain {
    buffers: Vec<PooledBuffer>,
    /// Bytes still expected, used to size the next block
    expected: usize,
}

impl BufferChain {
    pub fn new(expected: usize) -> Self {
        Self {
            buffers: Vec::new(),
            expected,
        }
    }

    /// Make sure the last block has room for `total` bytes
    ///
    /// With `wait` the call blocks until the pool hands out a block;
    /// otherwise an exhausted pool yields `BufferPoolExhausted`.
    pub fn ensure(&mut self, pool: &BufferPool, total: usize, wait: bool) -> Result<()> {
        if self.buffers.last().map_or(false, |b| b.remaining() >= total) {
            return Ok(());
        }

        let large = pool.block_size(SizeClass::Large);
        let wanted = self.expected.max(total).min(large);
        let acquire = |size: usize, must_fit: bool| {
            if wait {
                pool.acquire(size, must_fit)
            } else {
                pool.try_acquire(size, must_fit)
            }
        };

        let mut block = acquire(wanted, false)?;
        if block.capacity() < total {
            // Fallback class too small for this entry, trade up
            pool.release(block);
            block = acquire(total, true)?;
        }
        self.buffers.push(block);
        Ok(())
    }

    /// Append one entry given as consecutive parts; room must be ensured
    pub fn push_parts(&mut self, parts: &[&[u8]]) -> bool {
        let total: usize = parts.iter().map(|p| p.len()).sum();
        let Some(block) = self.buffers.last_mut() else {
            return false;
        };
        if block.remaining() < total {
            return false;
        }

        let spare = block.spare_mut();
        let mut at = 0;
        for part in parts {
            spare[at..at + part.len()].copy_from_slice(part);
            at += part.len();
        }
        block.advance(total);
        self.expected = self.expected.saturating_sub(total);
        true
    }

    pub fn len(&self) -> usize {
        self.buffers.iter().map(PooledBuffer::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.iter().all(PooledBuffer::is_empty)
    }

    pub fn into_buffers(self) -> Vec<PooledBuffer> {
        self.buffers
    }

    /// Return every block to the pool
    pub fn release(self, pool: &BufferPool) {
        for buffer in self.buffers {
            pool.release(buffer);
        }
    }
}

/// Secondary-form entries of one range collected during a round
#[derive(Debug)]
pub struct BufferNode {
    pub key: RangeKey,
    pub route: Route,
    pub entries: usize,
    chain: BufferChain,
}

impl BufferNode {
    pub fn new(key: RangeKey, route: Route, expected: usize) -> Self {
        Self {
            key,
            route,
            entries: 0,
            chain: BufferChain::new(expected),
        }
    }

    pub fn ensure(&mut self, pool: &BufferPool, total: usize, wait: bool) -> Result<()> {
        self.chain.ensure(pool, total, wait)
    }

    /// Append an entry in secondary form (payload may come in two parts)
    pub fn push(&mut self, header: &SecondaryHeader, first: &[u8], second: &[u8]) -> bool {
        let mut bytes = [0u8; SecondaryHeader::MAX_SIZE];
        let len = header.encode_into(&mut bytes);
        let pushed = self.chain.push_parts(&[&bytes[..len], first, second]);
        if pushed {
            self.entries += 1;
        }
        pushed
    }

    pub fn bytes(&self) -> usize {
        self.chain.len()
    }

    pub fn into_buffers(self) -> Vec<PooledBuffer> {
        self.chain.into_buffers()
    }

    pub fn release(self, pool: &BufferPool) {
        self.chain.release(pool);
    }
}
