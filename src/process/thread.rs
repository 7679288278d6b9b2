//! Process thread
//!
//! Drains the write buffer in flush rounds and routes every entry.
//!
//! ## One Round
//! ```text
//!   begin_flush ─► walk headers ─► per-range BufferNode (secondary form)
//!                                   + primary batch (staged ranges only)
//!        │
//!        ▼
//!   staged:  append node to the range's secondary log buffer
//!            (a full buffer is posted to the writer first)
//!   primary: post the batch; on overflow flush every staged buffer,
//!            reset the primary log, then post
//!   direct:  post staged leftovers, then the node, to the writer
//!        │
//!        ▼
//!   finish_flush ─► grant a pending access request
//! ```
//!
//! Staged entries always reach their secondary log buffer before the batch
//! holding their primary copy is posted, so a primary reset never drops an
//! entry that exists nowhere else.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::error::{LogError, Result};
use crate::header::{is_void, PrimaryHeader};
use crate::log::{AccessFlag, LogCatalog, PrimaryLog, RangeLog};
use crate::pool::{BufferPool, PooledBuffer};
use crate::types::RangeKey;
use crate::write_buffer::{FlushSnapshot, WriteBuffer};
use crate::writer::{JobBuffer, LogWriter, WriteJob};

use super::buffer_node::{BufferChain, BufferNode, Route};

/// Everything the process thread works with
pub struct ProcessContext {
    pub config: Arc<Config>,
    pub write_buffer: Arc<WriteBuffer>,
    pub pool: Arc<BufferPool>,
    pub catalog: Arc<LogCatalog>,
    pub primary: Option<Arc<PrimaryLog>>,
    pub writer: Arc<LogWriter>,
    pub access: Arc<AccessFlag>,
    pub stop: Arc<AtomicBool>,
}

/// Output of one round, before it is posted
struct RoundOutput {
    nodes: Vec<BufferNode>,
    primary: BufferChain,
    entries: usize,
    voids: usize,
}

pub(crate) fn run(ctx: ProcessContext) {
    let timeout = Duration::from_millis(ctx.config.process_timeout_ms);
    debug!(timeout_ms = ctx.config.process_timeout_ms, "Process thread started");

    loop {
        ctx.write_buffer.wait_for_work(timeout);
        let stopping = ctx.stop.load(Ordering::Acquire);

        let snapshot = ctx.write_buffer.begin_flush();
        if !snapshot.is_empty() {
            if let Err(e) = distribute(&ctx, &snapshot) {
                error!(generation = snapshot.generation, error = %e, "Flush round failed");
            }
        }
        ctx.write_buffer.finish_flush(&snapshot);

        if ctx.access.grant() {
            trace!("Granted log access to the reorganizer");
        }

        if stopping && ctx.write_buffer.pending_bytes() == 0 {
            break;
        }
    }

    info!("Process thread stopped");
}

// =============================================================================
// Distribute
// =============================================================================

fn route_for(config: &Config, pending: u64) -> Route {
    if !config.two_level_logging || pending >= config.secondary_log_buffer_size as u64 {
        Route::Direct
    } else {
        Route::Staged
    }
}

impl RoundOutput {
    fn new(expected_primary: usize) -> Self {
        Self {
            nodes: Vec::new(),
            primary: BufferChain::new(expected_primary),
            entries: 0,
            voids: 0,
        }
    }
}

/// Distribute the round's region
///
/// Entries are collected into per-range nodes and the primary batch. When
/// the pool runs dry mid-round, what was collected so far is posted (which
/// lets the writer return blocks) and collection continues with fresh nodes.
fn distribute(ctx: &ProcessContext, snapshot: &FlushSnapshot) -> Result<()> {
    let staged_total: u64 = snapshot
        .pending
        .values()
        .copied()
        .filter(|pending| route_for(&ctx.config, *pending) == Route::Staged)
        .sum();

    let mut round = RoundOutput::new(staged_total as usize);
    let mut index: HashMap<RangeKey, usize> = HashMap::new();
    let mut header_bytes = [0u8; PrimaryHeader::MAX_SIZE];
    let mut pos = snapshot.start;

    while pos < snapshot.end {
        let available = ((snapshot.end - pos) as usize).min(PrimaryHeader::MAX_SIZE);
        ctx.write_buffer.copy_out(pos, &mut header_bytes[..available]);

        let (header, header_len) = match PrimaryHeader::decode(&header_bytes[..available]) {
            Ok(Some(decoded)) => decoded,
            Ok(None) | Err(_) => {
                post_round(ctx, round);
                return Err(LogError::CorruptEntry(format!(
                    "unreadable header at write buffer position {}",
                    pos
                )));
            }
        };
        let payload_len = header.length as usize;
        let entry_end = pos + (header_len + payload_len) as u64;

        if is_void(header_bytes[0]) {
            round.voids += 1;
            pos = entry_end;
            continue;
        }

        let key = header.range_key();
        let route = route_for(&ctx.config, snapshot.pending.get(&key).copied().unwrap_or(0));
        let secondary = header.to_secondary();
        let secondary_len = secondary.encoded_len() + payload_len;
        let full_len = header_len + payload_len;

        let mut wait = false;
        let slot = loop {
            let slot = *index.entry(key).or_insert_with(|| {
                let expected = snapshot.pending.get(&key).copied().unwrap_or(0) as usize;
                round.nodes.push(BufferNode::new(key, route, expected));
                round.nodes.len() - 1
            });

            let reserved = round.nodes[slot]
                .ensure(&ctx.pool, secondary_len, wait)
                .and_then(|()| match route {
                    Route::Staged => round.primary.ensure(&ctx.pool, full_len, wait),
                    Route::Direct => Ok(()),
                });
            match reserved {
                Ok(()) => break slot,
                Err(LogError::BufferPoolExhausted(_)) if !wait => {
                    trace!(position = pos, "Buffer pool exhausted mid-round, posting collected entries");
                    post_round(ctx, std::mem::replace(&mut round, RoundOutput::new(0)));
                    index.clear();
                    wait = true;
                }
                Err(e) => {
                    post_round(ctx, round);
                    return Err(e);
                }
            }
        };

        let node = &mut round.nodes[slot];
        let primary = &mut round.primary;
        let full_header = &header_bytes[..header_len];
        ctx.write_buffer
            .with_region(pos + header_len as u64, payload_len, |first, second| {
                if route == Route::Staged {
                    primary.push_parts(&[full_header, first, second]);
                }
                node.push(&secondary, first, second);
            });

        round.entries += 1;
        pos = entry_end;
    }

    post_round(ctx, round);
    Ok(())
}

// =============================================================================
// Post
// =============================================================================

fn post_round(ctx: &ProcessContext, round: RoundOutput) {
    trace!(
        entries = round.entries,
        voids = round.voids,
        ranges = round.nodes.len(),
        primary_bytes = round.primary.len(),
        "Distributing flush round"
    );

    let (staged, direct): (Vec<BufferNode>, Vec<BufferNode>) =
        round.nodes.into_iter().partition(|n| n.route == Route::Staged);

    for node in staged {
        stage_node(ctx, node);
    }
    post_primary(ctx, round.primary.into_buffers());
    for node in direct {
        post_direct(ctx, node);
    }
}

fn range_for(ctx: &ProcessContext, node: &BufferNode) -> Option<Arc<RangeLog>> {
    match ctx.catalog.get_or_create(node.key) {
        Ok(range) => Some(range),
        Err(e) => {
            error!(range = %node.key, entries = node.entries, error = %e, "Cannot open secondary log, dropping entries");
            None
        }
    }
}

/// Append a staged node to its range's secondary log buffer
fn stage_node(ctx: &ProcessContext, node: BufferNode) {
    let Some(range) = range_for(ctx, &node) else {
        node.release(&ctx.pool);
        return;
    };

    let mut staged = range.buffer.lock();
    for buffer in node.into_buffers() {
        if buffer.is_empty() {
            ctx.pool.release(buffer);
            continue;
        }
        if let Some(full) = staged.append(buffer.as_slice()) {
            post(ctx, WriteJob::Secondary {
                range: Arc::clone(&range),
                buffer: JobBuffer::Shared(full),
            });
        }
        ctx.pool.release(buffer);
    }
}

/// Post the primary batch, resetting the primary log when it is full
fn post_primary(ctx: &ProcessContext, buffers: Vec<PooledBuffer>) {
    let Some(primary) = &ctx.primary else {
        for buffer in buffers {
            ctx.pool.release(buffer);
        }
        return;
    };

    for buffer in buffers {
        if buffer.is_empty() {
            ctx.pool.release(buffer);
            continue;
        }
        if !primary.try_reserve(buffer.len()) {
            debug!(used = primary.used(), capacity = primary.capacity(), "Primary log full, flushing staged buffers");
            for range in ctx.catalog.ranges() {
                if let Err(e) = ctx.writer.post_staged(&range) {
                    warn!(range = %range.key, error = %e, "Could not post staged entries");
                }
            }
            post(ctx, WriteJob::ResetPrimary);
            primary.reset_reservation();
            if !primary.try_reserve(buffer.len()) {
                error!(bytes = buffer.len(), "Batch larger than the primary log, skipping primary copy");
                ctx.pool.release(buffer);
                continue;
            }
        }
        post(ctx, WriteJob::Primary(JobBuffer::Pooled(buffer)));
    }
}

/// Post a direct node, preceded by whatever its range still has staged
fn post_direct(ctx: &ProcessContext, node: BufferNode) {
    let Some(range) = range_for(ctx, &node) else {
        node.release(&ctx.pool);
        return;
    };

    let mut staged = range.buffer.lock();
    if !staged.is_empty() {
        post(ctx, WriteJob::Secondary {
            range: Arc::clone(&range),
            buffer: JobBuffer::Shared(staged.take()),
        });
    }
    for buffer in node.into_buffers() {
        if buffer.is_empty() {
            ctx.pool.release(buffer);
            continue;
        }
        post(ctx, WriteJob::Secondary {
            range: Arc::clone(&range),
            buffer: JobBuffer::Pooled(buffer),
        });
    }
}

fn post(ctx: &ProcessContext, job: WriteJob) {
    if let Err(e) = ctx.writer.post(job) {
        error!(error = %e, "Writer is gone, dropping job");
    }
}
