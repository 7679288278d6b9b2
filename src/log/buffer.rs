//! Secondary Log Buffer
//!
//! Per-range accumulation of secondary-form entries whose full-form copy
//! went to the primary log. Flushed to the range's secondary log when it
//! fills up, before the primary log is reset, and whenever a caller needs
//! the range's data on disk (reorganization, recovery, shutdown).

use bytes::{Bytes, BytesMut};

/// Staged entries of one low-volume range
#[derive(Debug)]
pub struct SecondaryLogBuffer {
    data: BytesMut,
    capacity: usize,
}

impl SecondaryLogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether `len` more bytes fit without flushing
    pub fn fits(&self, len: usize) -> bool {
        self.data.len() + len <= self.capacity
    }

    /// Append staged entries
    ///
    /// If they do not fit, the current content is taken out first and
    /// returned so the caller can post it ahead of the new bytes.
    pub fn append(&mut self, entries: &[u8]) -> Option<Bytes> {
        let flushed = if !self.fits(entries.len()) && !self.is_empty() {
            Some(self.take())
        } else {
            None
        };
        self.data.extend_from_slice(entries);
        flushed
    }

    /// Take the whole content, leaving the buffer empty
    pub fn take(&mut self) -> Bytes {
        let content = self.data.split().freeze();
        self.data.reserve(self.capacity);
        content
    }
}
