//! Primary (full) header
//!
//! ## Format
//! ```text
//! ┌──────┬───────┬───────┬──────────┬────────┬───────┬─────────┬──────┬───────┬───────┐
//! │ Type │ Owner │ Range │ Chunk ID │ Length │ Epoch │ Version │ [TS] │[Chain]│ [CRC] │
//! │ (1)  │  (2)  │  (2)  │   (8)    │  (4)   │  (2)  │   (4)   │ (4)  │  (2)  │  (4)  │
//! └──────┴───────┴───────┴──────────┴────────┴───────┴─────────┴──────┴───────┴───────┘
//! ```

use crate::error::{LogError, Result};
use crate::types::{ChunkId, NodeId, RangeId, RangeKey};
use crate::version::Version;

use super::secondary::SecondaryHeader;
use super::{
    check_type_byte, common_flags, flags, optional_len, read_optional, write_optional, ChainInfo,
    FieldReader, FieldWriter, CHAIN_SIZE, CHECKSUM_SIZE, TIMESTAMP_SIZE,
};

/// Header used in the write buffer and the primary log
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrimaryHeader {
    pub owner: NodeId,
    pub range_id: RangeId,
    pub chunk_id: ChunkId,
    /// Payload bytes following this header
    pub length: u32,
    pub version: Version,
    pub timestamp: Option<u32>,
    pub chain: Option<ChainInfo>,
    pub checksum: Option<u32>,
}

impl PrimaryHeader {
    /// Size without optional fields
    pub const BASE_SIZE: usize = 1 + 2 + 2 + 8 + 4 + 2 + 4;

    /// Size with every optional field present
    pub const MAX_SIZE: usize = Self::BASE_SIZE + TIMESTAMP_SIZE + CHAIN_SIZE + CHECKSUM_SIZE;

    pub fn range_key(&self) -> RangeKey {
        RangeKey::new(self.owner, self.range_id)
    }

    pub fn is_migrated(&self) -> bool {
        self.chunk_id.creator() != self.owner
    }

    pub fn is_tombstone(&self) -> bool {
        self.version.is_tombstone()
    }

    pub fn encoded_len(&self) -> usize {
        Self::BASE_SIZE + optional_len(self.timestamp, self.chain, self.checksum)
    }

    /// Header size implied by a type byte (for streaming readers)
    pub fn len_for_type(type_byte: u8) -> usize {
        let mut len = Self::BASE_SIZE;
        if type_byte & flags::TIMESTAMP != 0 {
            len += TIMESTAMP_SIZE;
        }
        if type_byte & flags::CHAINED != 0 {
            len += CHAIN_SIZE;
        }
        if type_byte & flags::CHECKSUM != 0 {
            len += CHECKSUM_SIZE;
        }
        len
    }

    /// Full entry size (header + payload)
    pub fn entry_len(&self) -> usize {
        self.encoded_len() + self.length as usize
    }

    fn type_byte(&self) -> u8 {
        common_flags(
            self.is_migrated(),
            self.is_tombstone(),
            self.timestamp,
            self.chain,
            self.checksum,
        )
    }

    /// Write the header into `out`, returning the bytes written
    ///
    /// `out` must hold at least `encoded_len()` bytes.
    pub fn encode_into(&self, out: &mut [u8]) -> usize {
        let mut writer = FieldWriter::new(out);
        writer.put(&[self.type_byte()]);
        writer.put(&self.owner.to_le_bytes());
        writer.put(&self.range_id.to_le_bytes());
        writer.put(&self.chunk_id.raw().to_le_bytes());
        writer.put(&self.length.to_le_bytes());
        writer.put(&self.version.epoch.to_le_bytes());
        writer.put(&self.version.version.to_le_bytes());
        write_optional(&mut writer, self.timestamp, self.chain, self.checksum);
        writer.position()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = vec![0u8; self.encoded_len()];
        self.encode_into(&mut out);
        out
    }

    /// Decode a header from the start of `buf`
    ///
    /// Returns:
    /// - `Ok(Some((header, header_len)))` when a header was found
    /// - `Ok(None)` when `buf` is empty or starts with the terminator byte
    /// - `Err(CorruptEntry)` when the bytes are not a valid header
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>> {
        match buf.first() {
            None | Some(0) => return Ok(None),
            Some(_) => {}
        }

        let mut reader = FieldReader::new(buf);
        let type_byte = reader.u8()?;
        check_type_byte(type_byte)?;

        let owner = reader.u16()?;
        let range_id = reader.u16()?;
        let chunk_id = ChunkId(reader.u64()?);
        let length = reader.u32()?;
        let epoch = reader.u16()?;
        let version = Version::new(epoch, reader.u32()?);
        let (timestamp, chain, checksum) = read_optional(&mut reader, type_byte)?;

        let header = Self {
            owner,
            range_id,
            chunk_id,
            length,
            version,
            timestamp,
            chain,
            checksum,
        };

        if (type_byte & flags::MIGRATED != 0) != header.is_migrated() {
            return Err(LogError::CorruptEntry(format!(
                "migration flag disagrees with chunk {} in range {}",
                chunk_id,
                header.range_key()
            )));
        }
        if (type_byte & flags::TOMBSTONE != 0) != header.is_tombstone() {
            return Err(LogError::CorruptEntry(format!(
                "tombstone flag disagrees with version {} of chunk {}",
                version, chunk_id
            )));
        }

        Ok(Some((header, reader.position())))
    }

    /// Check the payload against the stored checksum (entries without one pass)
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.checksum
            .map_or(true, |crc| crc32fast::hash(payload) == crc)
    }

    /// Shrink to the secondary log form: the range is implied by the log,
    /// native chunks keep only their local id
    pub fn to_secondary(&self) -> SecondaryHeader {
        SecondaryHeader {
            chunk_id: self.chunk_id,
            migrated: self.is_migrated(),
            length: self.length,
            version: self.version,
            timestamp: self.timestamp,
            chain: self.chain,
            checksum: self.checksum,
        }
    }
}

impl From<&PrimaryHeader> for SecondaryHeader {
    fn from(header: &PrimaryHeader) -> Self {
        header.to_secondary()
    }
}

// =============================================================================
// Entry Iterator
// =============================================================================

/// Walks the primary-form entries of a contiguous byte region
///
/// Stops at the terminator byte or the end of the region. A corrupt header
/// or a payload running past the region yields one `Err` and ends the walk.
pub struct PrimaryEntries<'a> {
    data: &'a [u8],
    offset: usize,
    done: bool,
}

impl<'a> PrimaryEntries<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            offset: 0,
            done: false,
        }
    }

    /// Offset just past the last entry returned
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for PrimaryEntries<'a> {
    /// (offset of the header, header, payload)
    type Item = Result<(usize, PrimaryHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = self.offset;
        let (header, header_len) = match PrimaryHeader::decode(&self.data[start..]) {
            Ok(Some(found)) => found,
            Ok(None) => {
                self.done = true;
                return None;
            }
            Err(e) => {
                self.done = true;
                return Some(Err(e));
            }
        };

        let payload_start = start + header_len;
        let payload_end = payload_start + header.length as usize;
        if payload_end > self.data.len() {
            self.done = true;
            return Some(Err(LogError::CorruptEntry(format!(
                "payload of chunk {} runs past the end of the region ({} > {})",
                header.chunk_id,
                payload_end,
                self.data.len()
            ))));
        }

        self.offset = payload_end;
        Some(Ok((start, header, &self.data[payload_start..payload_end])))
    }
}
