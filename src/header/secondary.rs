//! Secondary (shrunk) header
//!
//! ## Format
//! ```text
//! ┌──────┬──────────────────┬────────┬───────┬─────────┬──────┬───────┬───────┐
//! │ Type │ Local ID (6)     │ Length │ Epoch │ Version │ [TS] │[Chain]│ [CRC] │
//! │ (1)  │ or Chunk ID (8)  │  (4)   │  (2)  │   (4)   │ (4)  │  (2)  │  (4)  │
//! └──────┴──────────────────┴────────┴───────┴─────────┴──────┴───────┴───────┘
//! ```
//! The full chunk id is only stored for migrated entries; native entries get
//! their creator back from the owner of the log they are read from.

use crate::error::{LogError, Result};
use crate::types::{ChunkId, NodeId};
use crate::version::Version;

use super::{
    check_type_byte, common_flags, flags, optional_len, read_optional, write_optional, ChainInfo,
    FieldReader, FieldWriter, CHAIN_SIZE, CHECKSUM_SIZE, TIMESTAMP_SIZE,
};

/// Header used inside secondary logs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SecondaryHeader {
    pub chunk_id: ChunkId,
    pub migrated: bool,
    pub length: u32,
    pub version: Version,
    pub timestamp: Option<u32>,
    pub chain: Option<ChainInfo>,
    pub checksum: Option<u32>,
}

impl SecondaryHeader {
    /// Size of a native header without optional fields
    pub const BASE_SIZE: usize = 1 + 6 + 4 + 2 + 4;

    /// Size with a full chunk id and every optional field present
    pub const MAX_SIZE: usize = Self::BASE_SIZE + 2 + TIMESTAMP_SIZE + CHAIN_SIZE + CHECKSUM_SIZE;

    pub fn is_tombstone(&self) -> bool {
        self.version.is_tombstone()
    }

    pub fn encoded_len(&self) -> usize {
        let id_extra = if self.migrated { 2 } else { 0 };
        Self::BASE_SIZE + id_extra + optional_len(self.timestamp, self.chain, self.checksum)
    }

    /// Full entry size (header + payload)
    pub fn entry_len(&self) -> usize {
        self.encoded_len() + self.length as usize
    }

    /// Write the header into `out` (at least `encoded_len()` bytes)
    pub fn encode_into(&self, out: &mut [u8]) -> usize {
        let mut writer = FieldWriter::new(out);
        let type_byte = common_flags(
            self.migrated,
            self.is_tombstone(),
            self.timestamp,
            self.chain,
            self.checksum,
        );
        writer.put(&[type_byte]);
        if self.migrated {
            writer.put(&self.chunk_id.raw().to_le_bytes());
        } else {
            writer.put_u48(self.chunk_id.local_id());
        }
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

    /// Decode a header stored in the log of `owner`
    ///
    /// Same contract as `PrimaryHeader::decode`.
    pub fn decode(buf: &[u8], owner: NodeId) -> Result<Option<(Self, usize)>> {
        match buf.first() {
            None | Some(0) => return Ok(None),
            Some(_) => {}
        }

        let mut reader = FieldReader::new(buf);
        let type_byte = reader.u8()?;
        check_type_byte(type_byte)?;
        if flags::VOID & type_byte != 0 {
            return Err(LogError::CorruptEntry(
                "void entry found in a secondary log".to_string(),
            ));
        }

        let migrated = type_byte & flags::MIGRATED != 0;
        let chunk_id = if migrated {
            ChunkId(reader.u64()?)
        } else {
            ChunkId::new(owner, reader.u48()?)
        };
        let length = reader.u32()?;
        let epoch = reader.u16()?;
        let version = Version::new(epoch, reader.u32()?);
        let (timestamp, chain, checksum) = read_optional(&mut reader, type_byte)?;

        if (type_byte & flags::TOMBSTONE != 0) != version.is_tombstone() {
            return Err(LogError::CorruptEntry(format!(
                "tombstone flag disagrees with version {} of chunk {}",
                version, chunk_id
            )));
        }

        Ok(Some((
            Self {
                chunk_id,
                migrated,
                length,
                version,
                timestamp,
                chain,
                checksum,
            },
            reader.position(),
        )))
    }

    /// Check the payload against the stored checksum (entries without one pass)
    pub fn verify(&self, payload: &[u8]) -> bool {
        self.checksum
            .map_or(true, |crc| crc32fast::hash(payload) == crc)
    }
}

// =============================================================================
// Entry Iterator
// =============================================================================

/// Walks the secondary-form entries of a segment or a staged buffer
pub struct SecondaryEntries<'a> {
    data: &'a [u8],
    owner: NodeId,
    offset: usize,
    done: bool,
}

impl<'a> SecondaryEntries<'a> {
    pub fn new(data: &'a [u8], owner: NodeId) -> Self {
        Self {
            data,
            owner,
            offset: 0,
            done: false,
        }
    }

    /// Offset just past the last entry returned
    pub fn offset(&self) -> usize {
        self.offset
    }
}

impl<'a> Iterator for SecondaryEntries<'a> {
    /// (offset of the header, header, payload)
    type Item = Result<(usize, SecondaryHeader, &'a [u8])>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let start = self.offset;
        let (header, header_len) = match SecondaryHeader::decode(&self.data[start..], self.owner) {
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
                "payload of chunk {} runs past the end of the segment ({} > {})",
                header.chunk_id,
                payload_end,
                self.data.len()
            ))));
        }

        self.offset = payload_end;
        Some(Ok((start, header, &self.data[payload_start..payload_end])))
    }
}
