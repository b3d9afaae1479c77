//! Error types for remote collection calls.

use thiserror::Error;

/// Result type for remote calls.
pub type RemoteResult<T> = Result<T, RemoteError>;

/// Errors reported by a remote collection.
///
/// Transport failures and timeouts say nothing about server state. Every
/// other variant is a structural answer from the server.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RemoteError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the request can be retried.
        retryable: bool,
    },

    /// The request did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// A multi-insert was attempted with no entities.
    #[error("Request body cannot be an empty array")]
    EmptyBatch,

    /// The server API version does not support the request.
    #[error("feature unavailable: {description}")]
    FeatureUnavailable {
        /// Server description.
        description: String,
    },

    /// The collection does not allow the request method.
    #[error("method not allowed: {description}")]
    MethodNotAllowed {
        /// Server description.
        description: String,
    },

    /// The addressed entity does not exist.
    #[error("entity not found: {description}")]
    EntityNotFound {
        /// Server description.
        description: String,
    },

    /// The request was malformed.
    #[error("bad request: {description}")]
    BadRequest {
        /// Server description.
        description: String,
    },

    /// Any other server error.
    #[error("server error {status} {error}: {}", .description.as_deref().unwrap_or(""))]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server error name.
        error: String,
        /// Human readable description.
        description: Option<String>,
        /// Debug detail.
        debug: Option<String>,
    },
}

impl RemoteError {
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

    /// Creates an entity-not-found error for `id`.
    pub fn not_found(id: &str) -> Self {
        Self::EntityNotFound {
            description: format!("This entity not found in the collection: {id}"),
        }
    }

    /// Creates a bad-request error.
    pub fn bad_request(description: impl Into<String>) -> Self {
        Self::BadRequest {
            description: description.into(),
        }
    }

    /// True for transport failures and timeouts.
    pub fn is_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Timeout)
    }

    /// True when the entity did not exist remotely.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::EntityNotFound { .. })
    }

    /// Returns true if a caller may retry the request unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Timeout => true,
            Self::Server { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// Short server error name, as used in item errors.
    pub fn name(&self) -> String {
        match self {
            Self::Transport { .. } => "TransportError".to_string(),
            Self::Timeout => "RequestTimeout".to_string(),
            Self::EmptyBatch => "BadRequest".to_string(),
            Self::FeatureUnavailable { .. } => "FeatureUnavailable".to_string(),
            Self::MethodNotAllowed { .. } => "MethodNotAllowed".to_string(),
            Self::EntityNotFound { .. } => "EntityNotFound".to_string(),
            Self::BadRequest { .. } => "BadRequest".to_string(),
            Self::Server { error, .. } => error.clone(),
        }
    }
}
