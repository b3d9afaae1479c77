//! JSON wire envelopes.
//!
//! Multi-insert response:
//!
//! ```json
//! {
//!   "entities": [ { "_id": "a", ... }, null ],
//!   "errors": [ { "index": 1, "code": 11000, "error": "duplicate key", "description": "...", "debug": "..." } ]
//! }
//! ```
//!
//! Error response:
//!
//! ```json
//! { "error": "EntityNotFound", "description": "...", "debug": "..." }
//! ```

use crate::error::{RemoteError, RemoteResult};
use cachesync_core::Entity;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Largest number of entities accepted by one multi-insert request.
pub const MAX_MULTI_INSERT: usize = 100;

/// A per-item failure of a multi-insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    /// Position of the item in the request.
    pub index: usize,
    /// Server error code, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<i64>,
    /// Error name or message.
    #[serde(rename = "error", alias = "errmsg")]
    pub message: String,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Debug detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl ItemError {
    /// Attributes a request-level failure to the item at `index`.
    pub fn from_remote(index: usize, error: &RemoteError) -> Self {
        let (description, debug) = match error {
            RemoteError::Server {
                description, debug, ..
            } => (description.clone(), debug.clone()),
            other => (Some(other.to_string()), None),
        };
        Self {
            index,
            code: None,
            message: error.name(),
            description,
            debug,
        }
    }

    /// The server error this item failure stands for.
    pub fn to_remote(&self) -> RemoteError {
        RemoteError::Server {
            status: 400,
            error: self.message.clone(),
            description: self.description.clone(),
            debug: self.debug.clone(),
        }
    }
}

/// Result of a multi-insert: one slot per input item plus per-item errors.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MultiSaveResult {
    /// Saved entities in input order; `None` where the item failed.
    pub entities: Vec<Option<Entity>>,
    /// Failures, indexed into `entities`.
    pub errors: Vec<ItemError>,
}

impl MultiSaveResult {
    /// A result where all `len` items failed with the same request error.
    pub fn failed(len: usize, error: &RemoteError) -> Self {
        Self {
            entities: vec![None; len],
            errors: (0..len).map(|i| ItemError::from_remote(i, error)).collect(),
        }
    }

    /// Appends a chunk result, shifting its error indices past the items
    /// already held.
    pub fn append(&mut self, chunk: MultiSaveResult) {
        let offset = self.entities.len();
        self.entities.extend(chunk.entities);
        self.errors.extend(chunk.errors.into_iter().map(|mut e| {
            e.index += offset;
            e
        }));
    }

    /// Number of items that were saved.
    pub fn saved_count(&self) -> usize {
        self.entities.iter().filter(|e| e.is_some()).count()
    }

    /// The error reported for `index`, if any.
    pub fn error_at(&self, index: usize) -> Option<&ItemError> {
        self.errors.iter().find(|e| e.index == index)
    }

    /// True when nothing failed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Multi-insert response body.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MultiInsertEnvelope {
    /// Saved entities, `null` for failed items.
    #[serde(default)]
    pub entities: Vec<Option<Value>>,
    /// Per-item errors.
    #[serde(default)]
    pub errors: Vec<ItemError>,
}

impl MultiInsertEnvelope {
    /// Builds an envelope from a result.
    ///
    /// # Errors
    ///
    /// Returns an error if an entity cannot be represented as JSON.
    pub fn from_result(result: &MultiSaveResult) -> RemoteResult<Self> {
        let entities = result
            .entities
            .iter()
            .map(|slot| match slot {
                Some(entity) => entity.to_value().map(Some).map_err(malformed),
                None => Ok(None),
            })
            .collect::<RemoteResult<Vec<_>>>()?;
        Ok(Self {
            entities,
            errors: result.errors.clone(),
        })
    }

    /// Validates the envelope against a request of `request_len` items.
    ///
    /// # Errors
    ///
    /// Returns a server error if the slot count differs from the request, an
    /// error index is out of range, or an entity is not an object.
    pub fn into_result(self, request_len: usize) -> RemoteResult<MultiSaveResult> {
        if self.entities.len() != request_len {
            return Err(malformed(format!(
                "expected {request_len} entities, got {}",
                self.entities.len()
            )));
        }
        if let Some(bad) = self.errors.iter().find(|e| e.index >= request_len) {
            return Err(malformed(format!("error index {} out of range", bad.index)));
        }
        let entities = self
            .entities
            .into_iter()
            .map(|slot| slot.map(Entity::from_value).transpose().map_err(malformed))
            .collect::<RemoteResult<Vec<_>>>()?;
        Ok(MultiSaveResult {
            entities,
            errors: self.errors,
        })
    }
}

/// Standard error response body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Error name.
    pub error: String,
    /// Human readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Debug detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug: Option<String>,
}

impl ErrorEnvelope {
    /// Maps an error response with HTTP `status` to a [`RemoteError`].
    pub fn into_error(self, status: u16) -> RemoteError {
        let description = self.description.clone().unwrap_or_default();
        match (status, self.error.as_str()) {
            (_, "FeatureUnavailable") => RemoteError::FeatureUnavailable { description },
            (405, _) | (_, "MethodNotAllowed") => RemoteError::MethodNotAllowed { description },
            (404, _) | (_, "EntityNotFound") => RemoteError::EntityNotFound { description },
            (400, "BadRequest") => RemoteError::BadRequest { description },
            _ => RemoteError::Server {
                status,
                error: self.error,
                description: self.description,
                debug: self.debug,
            },
        }
    }
}

fn malformed(detail: impl std::fmt::Display) -> RemoteError {
    RemoteError::Server {
        status: 500,
        error: "MalformedResponse".to_string(),
        description: Some(detail.to_string()),
        debug: None,
    }
}
