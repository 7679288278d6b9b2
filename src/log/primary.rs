//! Primary Log
//!
//! Single bounded, sequential log shared by all low-volume ranges. It holds
//! full headers because many ranges share the file. Its content is only a
//! staging copy: the same entries sit in the ranges' secondary log buffers
//! and reach the secondary logs later. When the log would overflow, every
//! secondary log buffer is flushed and the log starts over at offset 0.
//!
//! ## Format
//! ```text
//! ┌───────────────┬─────────┬───────────────┬─────────┬───┬────────────┐
//! │ PrimaryHeader │ payload │ PrimaryHeader │ payload │ 0 │ (stale)    │
//! └───────────────┴─────────┴───────────────┴─────────┴───┴────────────┘
//! ```
//!
//! Space is reserved by the process thread when it posts a batch; the file
//! offset is advanced by the writer thread when the batch is written.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{LogError, Result};
use crate::header::PrimaryHeader;

/// File name of the primary log inside the backup directory
pub const PRIMARY_LOG_FILE: &str = "primary.log";

struct PrimaryFile {
    file: File,
    offset: u64,
}

/// Shared staging log
pub struct PrimaryLog {
    path: PathBuf,
    capacity: u64,
    file: Mutex<PrimaryFile>,
    reserved: AtomicU64,
}

impl PrimaryLog {
    /// Open (or create) the primary log; existing content is kept for replay
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        if file.metadata()?.len() != capacity as u64 {
            file.set_len(capacity as u64)?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            capacity: capacity as u64,
            file: Mutex::new(PrimaryFile { file, offset: 0 }),
            reserved: AtomicU64::new(0),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Bytes written since the last reset
    pub fn used(&self) -> u64 {
        self.file.lock().offset
    }

    // =========================================================================
    // Reservation (process thread)
    // =========================================================================

    /// Reserve room for a batch; false when the log must be reset first
    pub fn try_reserve(&self, len: usize) -> bool {
        let len = len as u64;
        let mut current = self.reserved.load(Ordering::Acquire);
        loop {
            if current + len > self.capacity {
                return false;
            }
            match self.reserved.compare_exchange_weak(
                current,
                current + len,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Forget all reservations; paired with a posted `reset`
    pub fn reset_reservation(&self) {
        self.reserved.store(0, Ordering::Release);
    }

    // =========================================================================
    // I/O (writer thread)
    // =========================================================================

    /// Append a batch of full-form entries
    pub fn append(&self, data: &[u8]) -> Result<()> {
        let mut inner = self.file.lock();
        let end = inner.offset + data.len() as u64;
        if end > self.capacity {
            return Err(LogError::LogFull(format!(
                "primary log ({} + {} > {} bytes)",
                inner.offset,
                data.len(),
                self.capacity
            )));
        }

        let offset = inner.offset;
        inner.file.seek(SeekFrom::Start(offset))?;
        inner.file.write_all(data)?;
        if end < self.capacity {
            inner.file.write_all(&[0u8])?;
        }
        inner.offset = end;
        Ok(())
    }

    /// Invalidate all content and start over at offset 0
    pub fn reset(&self) -> Result<()> {
        let mut inner = self.file.lock();
        inner.file.seek(SeekFrom::Start(0))?;
        inner.file.write_all(&[0u8])?;
        let previous = inner.offset;
        inner.offset = 0;
        debug!(previous_bytes = previous, "Primary log reset");
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.lock().file.sync_data()?;
        Ok(())
    }

    /// Read every valid entry from offset 0 up to the terminator
    ///
    /// Entries failing their checksum are skipped and counted; a malformed
    /// header ends the scan.
    pub fn read_entries(&self) -> Result<(Vec<(PrimaryHeader, Bytes)>, usize)> {
        let mut inner = self.file.lock();
        inner.file.seek(SeekFrom::Start(0))?;
        let mut reader = BufReader::new(&mut inner.file);

        let mut entries = Vec::new();
        let mut corrupt = 0;
        let mut pos = 0u64;
        let mut header_bytes = [0u8; PrimaryHeader::MAX_SIZE];

        while pos + PrimaryHeader::BASE_SIZE as u64 <= self.capacity {
            reader.read_exact(&mut header_bytes[..1])?;
            if header_bytes[0] == 0 {
                break;
            }

            let header_len = PrimaryHeader::len_for_type(header_bytes[0]);
            if pos + header_len as u64 > self.capacity {
                corrupt += 1;
                break;
            }
            reader.read_exact(&mut header_bytes[1..header_len])?;

            let header = match PrimaryHeader::decode(&header_bytes[..header_len]) {
                Ok(Some((header, _))) => header,
                Ok(None) => break,
                Err(e) => {
                    warn!(offset = pos, error = %e, "Corrupt primary log header, ending scan");
                    corrupt += 1;
                    break;
                }
            };

            let end = pos + header_len as u64 + header.length as u64;
            if end > self.capacity {
                warn!(offset = pos, "Primary log entry runs past the end of the log");
                corrupt += 1;
                break;
            }

            let mut payload = vec![0u8; header.length as usize];
            reader.read_exact(&mut payload)?;
            pos = end;

            if !header.verify(&payload) {
                warn!(chunk = %header.chunk_id, "Checksum mismatch in primary log, skipping entry");
                corrupt += 1;
                continue;
            }
            entries.push((header, Bytes::from(payload)));
        }

        Ok((entries, corrupt))
    }
}
