//! Process thread: the single consumer of the write buffer
//!
//! Decides per range and round whether entries are staged (primary log +
//! secondary log buffer) or written directly to the secondary log, and
//! hands the resulting buffers to the writer.

mod buffer_node;
mod thread;

pub use buffer_node::{BufferChain, BufferNode, Route};
pub use thread::ProcessContext;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;

use crate::error::Result;
use crate::writer::join_bounded;

/// Handle to the running process thread
pub struct ProcessThread {
    stop: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessThread {
    /// Start the thread; `ctx.stop` becomes the handle's stop flag
    pub fn spawn(ctx: ProcessContext) -> Result<Self> {
        let stop = Arc::clone(&ctx.stop);
        let handle = std::thread::Builder::new()
            .name("chunklog-process".to_string())
            .spawn(move || thread::run(ctx))?;
        Ok(Self {
            stop,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Finish the pending rounds and exit; waits at most `timeout`
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop.store(true, Ordering::Release);
        join_bounded(&self.handle, timeout, "process")
    }
}
