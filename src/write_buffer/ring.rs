//! Raw ring storage
//!
//! Power-of-two byte ring addressed by absolute 64-bit positions
//! (`pos & mask`). The ring itself does no synchronization: callers must
//! own the byte range they touch, which the write buffer guarantees through
//! its reserve / commit / read-position counters.

use std::cell::UnsafeCell;
use std::io::{self, Read};

pub(crate) struct RingBuffer {
    storage: Box<[UnsafeCell<u8>]>,
    mask: u64,
}

// Access to disjoint byte ranges is coordinated by the write buffer
unsafe impl Send for RingBuffer {}
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// `capacity` must be a power of two
    pub(crate) fn new(capacity: usize) -> Self {
        debug_assert!(capacity.is_power_of_two());
        let storage: Box<[UnsafeCell<u8>]> = (0..capacity).map(|_| UnsafeCell::new(0)).collect();
        Self {
            storage,
            mask: capacity as u64 - 1,
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// Split `[pos, pos + len)` into at most two physical ranges
    fn split(&self, pos: u64, len: usize) -> (usize, usize, usize) {
        debug_assert!(len <= self.capacity());
        let start = (pos & self.mask) as usize;
        let first = len.min(self.capacity() - start);
        (start, first, len - first)
    }

    fn base(&self) -> *mut u8 {
        UnsafeCell::raw_get(self.storage.as_ptr())
    }

    /// Mutable view of `[pos, pos + len)` as two slices (second is empty
    /// unless the range wraps)
    ///
    /// # Safety
    /// The caller must have exclusive access to the range for the lifetime
    /// of the returned slices.
    #[allow(clippy::mut_from_ref)]
    pub(crate) unsafe fn slices_mut(&self, pos: u64, len: usize) -> (&mut [u8], &mut [u8]) {
        let (start, first, second) = self.split(pos, len);
        let base = self.base();
        (
            std::slice::from_raw_parts_mut(base.add(start), first),
            std::slice::from_raw_parts_mut(base, second),
        )
    }

    /// Shared view of `[pos, pos + len)` as two slices
    ///
    /// # Safety
    /// No other thread may write the range while the slices are alive.
    pub(crate) unsafe fn slices(&self, pos: u64, len: usize) -> (&[u8], &[u8]) {
        let (start, first, second) = self.split(pos, len);
        let base = self.base() as *const u8;
        (
            std::slice::from_raw_parts(base.add(start), first),
            std::slice::from_raw_parts(base, second),
        )
    }

    /// Copy `src` into the ring at `pos`
    ///
    /// # Safety
    /// Same as `slices_mut`.
    pub(crate) unsafe fn write(&self, pos: u64, src: &[u8]) {
        let (a, b) = self.slices_mut(pos, src.len());
        let split = a.len();
        a.copy_from_slice(&src[..split]);
        b.copy_from_slice(&src[split..]);
    }

    /// Fill `[pos, pos + len)` straight from a reader
    ///
    /// # Safety
    /// Same as `slices_mut`.
    pub(crate) unsafe fn fill_from<R: Read + ?Sized>(
        &self,
        pos: u64,
        len: usize,
        reader: &mut R,
    ) -> io::Result<()> {
        let (a, b) = self.slices_mut(pos, len);
        reader.read_exact(a)?;
        reader.read_exact(b)
    }

    /// Copy `[pos, pos + dst.len())` out of the ring
    ///
    /// # Safety
    /// Same as `slices`.
    pub(crate) unsafe fn read(&self, pos: u64, dst: &mut [u8]) {
        let (a, b) = self.slices(pos, dst.len());
        dst[..a.len()].copy_from_slice(a);
        dst[a.len()..].copy_from_slice(b);
    }
}
