//! # chunklog
//!
//! Log-structured backup engine for the chunks of an in-memory key-value
//! store, with:
//! - A lock-free multi-producer write buffer
//! - Two-level logging: a shared primary log for low-volume ranges, one
//!   segmented secondary log per backup range
//! - Segment reorganization reclaiming space of superseded versions
//! - Recovery of the latest version of every chunk, in submission order
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 Producers (submit / remove)                  │
//! │              version table stamps every write                │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                       Write Buffer                           │
//! │            (CAS reservation, ordered publication)            │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │ process thread (buffer pool blocks)
//!          ┌────────────┴────────────┐
//!          │ staged                  │ direct
//!          ▼                         │
//!   ┌─────────────┐  ┌────────────┐  │
//!   │ Primary Log │  │ Sec. Log   │  │
//!   │   (copy)    │  │  Buffers   │  │
//!   └─────────────┘  └─────┬──────┘  │
//!                          ▼         ▼
//!                   ┌──────────────────────┐      ┌──────────────┐
//!                   │  Secondary Logs      │◄─────│ Reorganizer  │
//!                   │  (writer thread)     │      │  (cleaning)  │
//!                   └──────────────────────┘      └──────────────┘
//! ```

#![deny(unsafe_code)]

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod types;

pub mod header;
pub mod pool;
pub mod version;
pub mod write_buffer;
pub mod process;
pub mod log;
pub mod writer;
pub mod reorg;
pub mod report;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{LogError, Result};
pub use config::Config;
pub use engine::LogEngine;
pub use log::RecoveredEntry;
pub use report::{RangeUtilization, UtilizationReport};
pub use types::{ChunkId, NodeId, RangeId, RangeKey};
pub use version::Version;

// =============================================================================
// Version Info
// =============================================================================

/// Current version of chunklog
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
