//! Pooled Buffer
//!
//! A fixed-capacity block handed out by the buffer pool. The block is never
//! resized; `len` tracks how much of it is filled.

/// Size class of a pooled block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SizeClass {
    /// One segment
    Large,
    /// 1/8 segment
    Medium,
    /// 1/16 segment
    Small,
}

impl SizeClass {
    pub(crate) fn index(self) -> usize {
        match self {
            SizeClass::Large => 0,
            SizeClass::Medium => 1,
            SizeClass::Small => 2,
        }
    }
}

/// A block on loan from the buffer pool
///
/// Must be handed back with `BufferPool::release`; a dropped block still
/// counts against its class limit.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Box<[u8]>,
    len: usize,
    class: SizeClass,
}

impl PooledBuffer {
    pub(crate) fn new(data: Box<[u8]>, class: SizeClass) -> Self {
        Self { data, len: 0, class }
    }

    pub(crate) fn into_block(self) -> Box<[u8]> {
        self.data
    }

    pub fn class(&self) -> SizeClass {
        self.class
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes still free at the end of the block
    pub fn remaining(&self) -> usize {
        self.data.len() - self.len
    }

    /// Filled part of the block
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Append bytes; returns false (and copies nothing) if they do not fit
    pub fn extend_from_slice(&mut self, bytes: &[u8]) -> bool {
        if bytes.len() > self.remaining() {
            return false;
        }
        self.data[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
        true
    }

    /// Free tail of the block, to be filled before `advance`
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.len..]
    }

    /// Mark `n` bytes of the spare tail as filled
    pub fn advance(&mut self, n: usize) {
        debug_assert!(n <= self.remaining(), "advance past the end of a pooled block");
        self.len = (self.len + n).min(self.data.len());
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}
