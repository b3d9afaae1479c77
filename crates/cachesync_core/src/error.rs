//! Error types for cachesync core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in core operations.
///
/// Storage and codec failures are fatal for the calling operation; they are
/// never retried here. A query with no match is not an error.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Journal backend error.
    #[error("storage error: {0}")]
    Storage(#[from] cachesync_storage::StorageError),

    /// CBOR encoding or decoding of a journal frame failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// JSON conversion of an entity failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The entity is not usable for the requested operation.
    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    /// The collection name cannot be used as a store file name.
    #[error("invalid collection name: {0:?}")]
    InvalidCollectionName(String),

    /// Another process holds the store directory.
    #[error("store directory is locked: {path}")]
    StoreLocked {
        /// Path of the locked directory.
        path: String,
    },

    /// The store directory does not exist and creation was not requested.
    #[error("store directory not found: {path}")]
    StoreNotFound {
        /// Path that was looked up.
        path: String,
    },
}

impl CoreError {
    /// Creates a codec error.
    pub fn codec(message: impl Into<String>) -> Self {
        Self::Codec(message.into())
    }

    /// Creates an invalid-entity error.
    pub fn invalid_entity(message: impl Into<String>) -> Self {
        Self::InvalidEntity(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::InvalidCollectionName("a/b".into());
        assert_eq!(err.to_string(), "invalid collection name: \"a/b\"");

        let err = CoreError::codec("truncated map");
        assert!(err.to_string().contains("truncated map"));
    }
}
