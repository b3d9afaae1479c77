//! Entity model.
//!
//! An [`Entity`] is the unit of data exchanged with the remote collection.
//! Its JSON form is the wire form:
//!
//! ```json
//! {
//!   "_id": "5f1d...",
//!   "_kmd": { "lmt": "2016-03-24T14:34:06.547Z", "ect": "2016-03-24T14:34:06.547Z" },
//!   "_acl": { "creator": "user-1", "gr": true },
//!   "title": "Dune"
//! }
//! ```

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Key of the entity identifier.
pub const ID_KEY: &str = "_id";
/// Key of the server metadata block.
pub const METADATA_KEY: &str = "_kmd";
/// Key of the access-control block.
pub const ACL_KEY: &str = "_acl";
/// Field path of the last-modified time.
pub const LMT_PATH: &str = "_kmd.lmt";

/// Server-maintained timestamps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    /// Last modified time, set by the server on every successful write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lmt: Option<DateTime<Utc>>,
    /// Entity creation time, set once.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ect: Option<DateTime<Utc>>,
}

impl Metadata {
    /// Metadata for a record created and last modified at `at`.
    pub fn created_at(at: DateTime<Utc>) -> Self {
        Self {
            lmt: Some(at),
            ect: Some(at),
        }
    }
}

/// Access-control descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acl {
    /// Identity of the creating user.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator: Option<String>,
    /// Public read flag.
    #[serde(rename = "gr", default, skip_serializing_if = "Option::is_none")]
    pub global_read: Option<bool>,
    /// Public write flag.
    #[serde(rename = "gw", default, skip_serializing_if = "Option::is_none")]
    pub global_write: Option<bool>,
}

/// A record of a collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Identifier. `None` until the entity has been created remotely.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server metadata.
    #[serde(rename = "_kmd", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Access control.
    #[serde(rename = "_acl", default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Acl>,
    /// Application fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Creates an empty entity without an id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty entity with the given id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            ..Self::default()
        }
    }

    /// Sets a field, builder style.
    #[must_use]
    pub fn field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Returns an application field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// True when the entity has never been created remotely.
    pub fn is_new(&self) -> bool {
        self.id.is_none()
    }

    /// Last-modified time, if the server reported one.
    pub fn lmt(&self) -> Option<DateTime<Utc>> {
        self.metadata.as_ref().and_then(|m| m.lmt)
    }

    /// Entity creation time, if the server reported one.
    pub fn ect(&self) -> Option<DateTime<Utc>> {
        self.metadata.as_ref().and_then(|m| m.ect)
    }

    /// Converts to the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if a field cannot be represented as JSON.
    pub fn to_value(&self) -> CoreResult<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Parses the JSON wire form.
    ///
    /// # Errors
    ///
    /// Returns an error if `value` is not an object or a reserved key has the
    /// wrong shape.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        if !value.is_object() {
            return Err(CoreError::invalid_entity(format!(
                "expected a JSON object, got {value}"
            )));
        }
        Ok(serde_json::from_value(value)?)
    }

    /// Resolves a dotted field path such as `_kmd.lmt` or `address.city`.
    pub fn lookup(&self, path: &str) -> Option<Value> {
        let (head, rest) = match path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (path, None),
        };

        let root = match head {
            ID_KEY => self.id.clone().map(Value::String)?,
            METADATA_KEY => serde_json::to_value(self.metadata.as_ref()?).ok()?,
            ACL_KEY => serde_json::to_value(self.acl.as_ref()?).ok()?,
            _ => self.fields.get(head)?.clone(),
        };

        match rest {
            None => Some(root),
            Some(rest) => {
                let mut current = &root;
                for segment in rest.split('.') {
                    current = current.as_object()?.get(segment)?;
                }
                Some(current.clone())
            }
        }
    }

    /// Keeps only the requested fields.
    ///
    /// The id is always kept. `_kmd.lmt` keeps only the last-modified time of
    /// the metadata block; `_kmd` keeps the whole block.
    #[must_use]
    pub fn project(&self, fields: &BTreeSet<String>) -> Self {
        let mut projected = Self {
            id: self.id.clone(),
            ..Self::default()
        };

        for path in fields {
            let (head, rest) = match path.split_once('.') {
                Some((head, rest)) => (head, Some(rest)),
                None => (path.as_str(), None),
            };
            match head {
                ID_KEY => {}
                METADATA_KEY => {
                    if let Some(source) = &self.metadata {
                        let target = projected.metadata.get_or_insert_with(Metadata::default);
                        match rest {
                            Some("lmt") => target.lmt = source.lmt,
                            Some("ect") => target.ect = source.ect,
                            _ => *target = source.clone(),
                        }
                    }
                }
                ACL_KEY => projected.acl = self.acl.clone(),
                _ => {
                    if let Some(value) = self.fields.get(head) {
                        projected.fields.insert(head.to_string(), value.clone());
                    }
                }
            }
        }

        projected
    }

    /// Merges server-returned state into this entity.
    ///
    /// The server copy wins for the id, metadata, ACL and every field it
    /// returned; fields the server did not echo back are kept.
    pub fn merge_from_server(&mut self, server: Entity) {
        if server.id.is_some() {
            self.id = server.id;
        }
        if server.metadata.is_some() {
            self.metadata = server.metadata;
        }
        if server.acl.is_some() {
            self.acl = server.acl;
        }
        self.fields.extend(server.fields);
    }
}
