//! Error types for the sync engine.

use crate::policy::StoreType;
use cachesync_core::CoreError;
use cachesync_remote::RemoteError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The request did not complete in time.
    #[error("operation timed out")]
    Timeout,

    /// The server rejected the request.
    #[error("server error: {0}")]
    Server(RemoteError),

    /// Local cache or queue error.
    #[error("local store error: {0}")]
    Core(#[from] CoreError),

    /// I/O error outside the local store, such as spawning the dispatcher.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation is not available for this store type.
    #[error("{operation} is not available on a {store_type:?} store")]
    InvalidStoreType {
        /// Store type of the data store.
        store_type: StoreType,
        /// Rejected operation.
        operation: &'static str,
    },

    /// An argument was rejected before any I/O.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation cannot run in the current state.
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// A network operation was attempted without a signed-in user.
    #[error("no active user")]
    NoActiveUser,

    /// The request was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// A worker task failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<RemoteError> for SyncError {
    fn from(error: RemoteError) -> Self {
        match error {
            RemoteError::Transport { message, retryable } => Self::Transport { message, retryable },
            RemoteError::Timeout => Self::Timeout,
            other => Self::Server(other),
        }
    }
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// True for transport failures and timeouts.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout)
    }

    /// Returns true if this error can be retried.
    ///
    /// The engine never retries on its own; this tells the caller whether a
    /// retry may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Timeout => true,
            SyncError::Server(remote) => remote.is_retryable(),
            _ => false,
        }
    }
}
