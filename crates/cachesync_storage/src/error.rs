//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A journal frame failed validation somewhere other than the tail.
    #[error("journal corrupted at offset {offset}: {reason}")]
    Corrupted {
        /// Byte offset of the offending frame.
        offset: u64,
        /// What was wrong with it.
        reason: String,
    },

    /// A frame payload is larger than the frame header can describe.
    #[error("frame too large: {len} bytes")]
    FrameTooLarge {
        /// Payload length in bytes.
        len: usize,
    },
}
