//! Error types for chunklog
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using LogError
pub type Result<T> = std::result::Result<T, LogError>;

/// Unified error type for chunklog operations
#[derive(Debug, Error)]
pub enum LogError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Capacity Errors (rejected immediately, never retried)
    // -------------------------------------------------------------------------
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Buffer pool exhausted: no pooled buffer of at least {0} bytes")]
    BufferPoolExhausted(usize),

    #[error("Secondary log for range {0} is full")]
    LogFull(String),

    // -------------------------------------------------------------------------
    // Log Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt log entry: {0}")]
    CorruptEntry(String),

    #[error("Secondary log for range {0} is degraded (read-only)")]
    Degraded(String),

    #[error("Unknown backup range {0}")]
    UnknownRange(String),

    // -------------------------------------------------------------------------
    // Serialization Errors
    // -------------------------------------------------------------------------
    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Configuration / Argument Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // -------------------------------------------------------------------------
    // Lifecycle Errors
    // -------------------------------------------------------------------------
    #[error("Engine is shutting down")]
    ShuttingDown,
}

impl From<bincode::Error> for LogError {
    fn from(e: bincode::Error) -> Self {
        LogError::Serialization(e.to_string())
    }
}
