//! Log Writer
//!
//! Single thread performing every log write. The process thread, the engine
//! and the reorganizer post jobs over a crossbeam channel; the writer
//! executes them in order and hands pooled buffers back to the pool.
//!
//! ## Jobs
//! ```text
//!   Primary(buffer)              append a batch to the primary log
//!   Secondary { range, buffer }  append secondary-form entries to a range
//!   ResetPrimary                 start the primary log over
//!   Barrier(ack)                 sync dirty files, then acknowledge
//!   Shutdown                     sync and exit
//! ```
//!
//! A secondary log without a free segment gets one blocking urgent
//! reorganization and a single retry; if it is still full it is marked
//! degraded and the rest of the batch is dropped with an error.

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{LogError, Result};
use crate::log::{PrimaryLog, RangeLog};
use crate::pool::{BufferPool, PooledBuffer};
use crate::reorg::ReorgCoordinator;
use crate::types::RangeKey;

/// Bytes carried by a job
#[derive(Debug)]
pub enum JobBuffer {
    /// Block from the buffer pool, released after the write
    Pooled(PooledBuffer),
    /// Owned bytes (taken out of a secondary log buffer)
    Shared(Bytes),
}

impl JobBuffer {
    pub fn as_slice(&self) -> &[u8] {
        match self {
            JobBuffer::Pooled(buffer) => buffer.as_slice(),
            JobBuffer::Shared(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_slice().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Work item for the writer thread
pub enum WriteJob {
    Primary(JobBuffer),
    Secondary {
        range: Arc<RangeLog>,
        buffer: JobBuffer,
    },
    ResetPrimary,
    Barrier(Sender<()>),
    Shutdown,
}

/// Handle to the writer thread
pub struct LogWriter {
    sender: Sender<WriteJob>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl LogWriter {
    pub fn spawn(
        pool: Arc<BufferPool>,
        primary: Option<Arc<PrimaryLog>>,
        reorg: Arc<ReorgCoordinator>,
    ) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let worker = WriterThread {
            pool,
            primary,
            reorg,
            dirty: HashMap::new(),
            primary_dirty: false,
        };
        let handle = thread::Builder::new()
            .name("chunklog-writer".to_string())
            .spawn(move || worker.run(receiver))?;

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a job
    pub fn post(&self, job: WriteJob) -> Result<()> {
        self.sender.send(job).map_err(|_| LogError::ShuttingDown)
    }

    /// Queue the staged entries of a range, if any
    pub fn post_staged(&self, range: &Arc<RangeLog>) -> Result<()> {
        let mut staged = range.buffer.lock();
        if staged.is_empty() {
            return Ok(());
        }
        let content = staged.take();
        self.post(WriteJob::Secondary {
            range: Arc::clone(range),
            buffer: JobBuffer::Shared(content),
        })
    }

    /// Block until every job posted before this call is written and synced
    pub fn barrier(&self) -> Result<()> {
        let (ack, done) = channel::bounded(1);
        self.post(WriteJob::Barrier(ack))?;
        done.recv().map_err(|_| LogError::ShuttingDown)
    }

    /// Stop the thread after the queued jobs; waits at most `timeout`
    pub fn shutdown(&self, timeout: Duration) -> bool {
        let _ = self.sender.send(WriteJob::Shutdown);
        join_bounded(&self.handle, timeout, "writer")
    }

    /// Jobs waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.len()
    }
}

/// Join a background thread, giving up after `timeout`
pub(crate) fn join_bounded(handle: &Mutex<Option<JoinHandle<()>>>, timeout: Duration, name: &str) -> bool {
    let Some(handle) = handle.lock().take() else {
        return true;
    };

    let deadline = std::time::Instant::now() + timeout;
    while !handle.is_finished() {
        if std::time::Instant::now() >= deadline {
            warn!(thread = name, "Background thread did not stop in time, detaching it");
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }

    if handle.join().is_err() {
        error!(thread = name, "Background thread panicked");
        return false;
    }
    true
}

// =============================================================================
// Writer Thread
// =============================================================================

struct WriterThread {
    pool: Arc<BufferPool>,
    primary: Option<Arc<PrimaryLog>>,
    reorg: Arc<ReorgCoordinator>,
    dirty: HashMap<RangeKey, Arc<RangeLog>>,
    primary_dirty: bool,
}

impl WriterThread {
    fn run(mut self, receiver: Receiver<WriteJob>) {
        debug!("Writer thread started");

        for job in receiver.iter() {
            match job {
                WriteJob::Primary(buffer) => {
                    self.write_primary(buffer.as_slice());
                    self.recycle(buffer);
                }
                WriteJob::Secondary { range, buffer } => {
                    self.write_secondary(&range, buffer.as_slice());
                    self.dirty.insert(range.key, range);
                    self.recycle(buffer);
                }
                WriteJob::ResetPrimary => {
                    if let Some(primary) = &self.primary {
                        if let Err(e) = primary.reset() {
                            error!(error = %e, "Failed to reset the primary log");
                        }
                        self.primary_dirty = true;
                    }
                }
                WriteJob::Barrier(ack) => {
                    self.sync_dirty();
                    let _ = ack.send(());
                }
                WriteJob::Shutdown => {
                    self.sync_dirty();
                    break;
                }
            }
        }

        info!("Writer thread stopped");
    }

    fn write_primary(&mut self, data: &[u8]) {
        let Some(primary) = &self.primary else {
            return;
        };
        match primary.append(data) {
            Ok(()) => self.primary_dirty = true,
            Err(e) => error!(bytes = data.len(), error = %e, "Primary log write failed"),
        }
    }

    fn write_secondary(&self, range: &RangeLog, data: &[u8]) {
        let mut rest = data;
        let mut retried = false;

        while !rest.is_empty() {
            let appended = {
                let _access = range.log.begin_write();
                range.log.append(rest)
            };
            let outcome = match appended {
                Ok(outcome) => outcome,
                Err(LogError::Degraded(_)) => {
                    warn!(range = %range.key, bytes = rest.len(), "Dropping write to degraded secondary log");
                    return;
                }
                Err(e) => {
                    error!(range = %range.key, error = %e, "Secondary log write failed");
                    range.log.mark_degraded(&e.to_string());
                    return;
                }
            };

            if outcome.reorg_due {
                debug!(range = %range.key, "Secondary log crossed the reorganization threshold");
                self.reorg.request(range.key);
            }
            if !outcome.out_of_space {
                return;
            }

            rest = &rest[outcome.written..];
            if retried {
                let e = LogError::LogFull(range.key.to_string());
                error!(range = %range.key, bytes = rest.len(), error = %e, "No space left after urgent reorganization");
                range.log.mark_degraded(&e.to_string());
                return;
            }

            warn!(range = %range.key, "Secondary log out of free segments, reorganizing before retry");
            self.reorg.reorganize_blocking(range.key);
            retried = true;
        }
    }

    fn sync_dirty(&mut self) {
        if self.primary_dirty {
            if let Some(primary) = &self.primary {
                if let Err(e) = primary.sync() {
                    error!(error = %e, "Failed to sync the primary log");
                }
            }
            self.primary_dirty = false;
        }
        for (key, range) in self.dirty.drain() {
            if let Err(e) = range.log.sync() {
                error!(range = %key, error = %e, "Failed to sync secondary log");
            }
        }
    }

    fn recycle(&self, buffer: JobBuffer) {
        if let JobBuffer::Pooled(buffer) = buffer {
            self.pool.release(buffer);
        }
    }
}
