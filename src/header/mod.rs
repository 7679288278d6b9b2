//! Log Entry Headers
//!
//! Every payload in the write buffer and in both logs is preceded by a header.
//! The header shrinks as the entry moves down the hierarchy:
//!
//! ```text
//!   write buffer / primary log            secondary log
//!   ┌──────────────────────────┐          ┌──────────────────────────┐
//!   │ PrimaryHeader (23..33 B) │  ──────► │SecondaryHeader (17..29 B)│
//!   │ owner + range + chunk id │          │ local id (or chunk id)   │
//!   └──────────────────────────┘          └──────────────────────────┘
//! ```
//!
//! ## Type Byte
//! ```text
//!   bit 0  always set (a zero byte terminates a segment)
//!   bit 1  migrated   (chunk created by another node than the range owner)
//!   bit 2  chained    (fragment of a larger payload)
//!   bit 3  checksum   (CRC32 of the payload present)
//!   bit 4  timestamp  (seconds since engine start present)
//!   bit 5  tombstone  (removal, no payload)
//!   bit 6  void       (write buffer only: reservation whose copy failed)
//! ```
//!
//! All integers are little endian. Optional fields appear in the order
//! timestamp, chain (id, count), checksum.

mod primary;
mod secondary;

pub use primary::{PrimaryEntries, PrimaryHeader};
pub use secondary::{SecondaryEntries, SecondaryHeader};

use crate::error::{LogError, Result};

/// Type byte flags
pub mod flags {
    pub const MARKER: u8 = 0x01;
    pub const MIGRATED: u8 = 0x02;
    pub const CHAINED: u8 = 0x04;
    pub const CHECKSUM: u8 = 0x08;
    pub const TIMESTAMP: u8 = 0x10;
    pub const TOMBSTONE: u8 = 0x20;
    pub const VOID: u8 = 0x40;

    pub(crate) const KNOWN: u8 = MARKER | MIGRATED | CHAINED | CHECKSUM | TIMESTAMP | TOMBSTONE | VOID;
}

/// Largest number of fragments one payload may be split into
pub const MAX_CHAIN_COUNT: usize = 127;

/// Size of the optional fields
pub const TIMESTAMP_SIZE: usize = 4;
pub const CHAIN_SIZE: usize = 2;
pub const CHECKSUM_SIZE: usize = 4;

/// Position of one fragment within a chained payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChainInfo {
    /// Index of this fragment (0-based)
    pub index: u8,
    /// Number of fragments of the payload
    pub count: u8,
}

/// Whether a type byte belongs to a reservation that carries no entry
pub fn is_void(type_byte: u8) -> bool {
    type_byte & flags::VOID != 0
}

/// CRC32 over a payload that may be split into two parts (ring wrap)
pub fn checksum_parts(first: &[u8], second: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(first);
    hasher.update(second);
    hasher.finalize()
}

// =============================================================================
// Layout and Fragmentation
// =============================================================================

/// Which optional header fields the engine writes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderLayout {
    pub checksums: bool,
    pub timestamps: bool,
}

impl HeaderLayout {
    /// Size of a primary header written with this layout
    pub fn primary_len(&self, chained: bool) -> usize {
        PrimaryHeader::BASE_SIZE + self.optional_len(chained)
    }

    fn optional_len(&self, chained: bool) -> usize {
        let mut len = 0;
        if self.timestamps {
            len += TIMESTAMP_SIZE;
        }
        if chained {
            len += CHAIN_SIZE;
        }
        if self.checksums {
            len += CHECKSUM_SIZE;
        }
        len
    }
}

/// How a payload is cut into header + fragment pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentPlan {
    /// Number of fragments (1 = not chained)
    pub count: usize,
    /// Payload bytes carried by every fragment but the last
    pub fragment_payload: usize,
    /// Primary header size of each fragment
    pub header_len: usize,
    /// Total payload length
    pub payload_len: usize,
}

impl FragmentPlan {
    /// Cut `payload_len` bytes into fragments of at most `max_fragment`
    /// bytes (header included)
    pub fn new(layout: HeaderLayout, payload_len: usize, max_fragment: usize) -> Result<Self> {
        let single = layout.primary_len(false);
        if single + payload_len <= max_fragment {
            return Ok(Self {
                count: 1,
                fragment_payload: payload_len,
                header_len: single,
                payload_len,
            });
        }

        let header_len = layout.primary_len(true);
        let fragment_payload = max_fragment.saturating_sub(header_len);
        if fragment_payload == 0 {
            return Err(LogError::CapacityExceeded(format!(
                "fragment size {} cannot hold a header",
                max_fragment
            )));
        }

        let count = payload_len.div_ceil(fragment_payload);
        if count > MAX_CHAIN_COUNT {
            return Err(LogError::CapacityExceeded(format!(
                "payload of {} bytes needs {} fragments (max {})",
                payload_len, count, MAX_CHAIN_COUNT
            )));
        }

        Ok(Self {
            count,
            fragment_payload,
            header_len,
            payload_len,
        })
    }

    pub fn is_chained(&self) -> bool {
        self.count > 1
    }

    /// Payload bytes of fragment `index`
    pub fn fragment_len(&self, index: usize) -> usize {
        let start = index * self.fragment_payload;
        self.payload_len.saturating_sub(start).min(self.fragment_payload)
    }

    /// Bytes occupied by all header + fragment pairs
    pub fn total_len(&self) -> usize {
        self.count * self.header_len + self.payload_len
    }

    /// Chain position of fragment `index`, `None` when not chained
    pub fn chain(&self, index: usize) -> Option<ChainInfo> {
        self.is_chained().then(|| ChainInfo {
            index: index as u8,
            count: self.count as u8,
        })
    }
}

// =============================================================================
// Byte Helpers
// =============================================================================

/// Little-endian field writer over a header-sized slice
pub(crate) struct FieldWriter<'a> {
    buf: &'a mut [u8],
    pos: usize,
}

impl<'a> FieldWriter<'a> {
    pub(crate) fn new(buf: &'a mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub(crate) fn put(&mut self, bytes: &[u8]) {
        self.buf[self.pos..self.pos + bytes.len()].copy_from_slice(bytes);
        self.pos += bytes.len();
    }

    pub(crate) fn put_u48(&mut self, value: u64) {
        let bytes = value.to_le_bytes();
        self.put(&bytes[..6]);
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Little-endian field reader that reports truncation as a corrupt entry
pub(crate) struct FieldReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FieldReader<'a> {
    pub(crate) fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(LogError::CorruptEntry(format!(
                "truncated header: need {} bytes at offset {}, have {}",
                n,
                self.pos,
                self.buf.len()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub(crate) fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn u48(&mut self) -> Result<u64> {
        let b = self.take(6)?;
        let mut raw = [0u8; 8];
        raw[..6].copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }
}

/// Read the optional trailer (timestamp, chain, checksum) selected by `type_byte`
pub(crate) fn read_optional(
    reader: &mut FieldReader<'_>,
    type_byte: u8,
) -> Result<(Option<u32>, Option<ChainInfo>, Option<u32>)> {
    let timestamp = if type_byte & flags::TIMESTAMP != 0 {
        Some(reader.u32()?)
    } else {
        None
    };

    let chain = if type_byte & flags::CHAINED != 0 {
        let index = reader.u8()?;
        let count = reader.u8()?;
        if count < 2 || count as usize > MAX_CHAIN_COUNT || index >= count {
            return Err(LogError::CorruptEntry(format!(
                "invalid chain position {}/{}",
                index, count
            )));
        }
        Some(ChainInfo { index, count })
    } else {
        None
    };

    let checksum = if type_byte & flags::CHECKSUM != 0 {
        Some(reader.u32()?)
    } else {
        None
    };

    Ok((timestamp, chain, checksum))
}

/// Write the optional trailer in wire order
pub(crate) fn write_optional(
    writer: &mut FieldWriter<'_>,
    timestamp: Option<u32>,
    chain: Option<ChainInfo>,
    checksum: Option<u32>,
) {
    if let Some(ts) = timestamp {
        writer.put(&ts.to_le_bytes());
    }
    if let Some(chain) = chain {
        writer.put(&[chain.index, chain.count]);
    }
    if let Some(crc) = checksum {
        writer.put(&crc.to_le_bytes());
    }
}

/// Size of the optional trailer
pub(crate) fn optional_len(timestamp: Option<u32>, chain: Option<ChainInfo>, checksum: Option<u32>) -> usize {
    timestamp.map_or(0, |_| TIMESTAMP_SIZE)
        + chain.map_or(0, |_| CHAIN_SIZE)
        + checksum.map_or(0, |_| CHECKSUM_SIZE)
}

/// Flags shared by both header variants
pub(crate) fn common_flags(
    migrated: bool,
    tombstone: bool,
    timestamp: Option<u32>,
    chain: Option<ChainInfo>,
    checksum: Option<u32>,
) -> u8 {
    let mut type_byte = flags::MARKER;
    if migrated {
        type_byte |= flags::MIGRATED;
    }
    if chain.is_some() {
        type_byte |= flags::CHAINED;
    }
    if checksum.is_some() {
        type_byte |= flags::CHECKSUM;
    }
    if timestamp.is_some() {
        type_byte |= flags::TIMESTAMP;
    }
    if tombstone {
        type_byte |= flags::TOMBSTONE;
    }
    type_byte
}

/// Validate the type byte of a stored header
pub(crate) fn check_type_byte(type_byte: u8) -> Result<()> {
    if type_byte & flags::MARKER == 0 || type_byte & !flags::KNOWN != 0 {
        return Err(LogError::CorruptEntry(format!(
            "invalid header type byte 0x{:02x}",
            type_byte
        )));
    }
    Ok(())
}
