//! Remote collection abstraction.

use crate::error::RemoteResult;
use crate::wire::MultiSaveResult;
use cachesync_core::{AggregateSpec, Entity, Query};
use serde_json::Value;
use std::sync::Arc;

/// A remote collection endpoint.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, in-process, mocks for testing). Calls are blocking;
/// the async layer runs them on a blocking pool. Implementations own the
/// translation of [`Query`] to their wire format.
pub trait RemoteCollection: Send + Sync {
    /// Collection name.
    fn name(&self) -> &str;

    /// Fetches the entities matching the query, honouring sort, paging and
    /// field selection.
    fn query(&self, query: &Query) -> RemoteResult<Vec<Entity>>;

    /// Fetches one entity. Fails with `EntityNotFound` when absent.
    fn get(&self, id: &str) -> RemoteResult<Entity>;

    /// Counts the entities matching the query predicate.
    fn count(&self, query: &Query) -> RemoteResult<usize>;

    /// Creates one entity and returns the server copy.
    fn create(&self, entity: &Entity) -> RemoteResult<Entity>;

    /// Creates up to [`crate::MAX_MULTI_INSERT`] entities in one request.
    ///
    /// The result has exactly one slot per input entity.
    fn create_many(&self, entities: &[Entity]) -> RemoteResult<MultiSaveResult>;

    /// Creates or replaces an entity by id and returns the server copy.
    fn update(&self, entity: &Entity) -> RemoteResult<Entity>;

    /// Deletes the entities matching the query and returns the count.
    fn delete(&self, query: &Query) -> RemoteResult<usize>;

    /// Evaluates a grouped reduction remotely.
    fn aggregate(&self, spec: &AggregateSpec) -> RemoteResult<Vec<Value>>;
}

impl<T: RemoteCollection + ?Sized> RemoteCollection for Arc<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn query(&self, query: &Query) -> RemoteResult<Vec<Entity>> {
        (**self).query(query)
    }

    fn get(&self, id: &str) -> RemoteResult<Entity> {
        (**self).get(id)
    }

    fn count(&self, query: &Query) -> RemoteResult<usize> {
        (**self).count(query)
    }

    fn create(&self, entity: &Entity) -> RemoteResult<Entity> {
        (**self).create(entity)
    }

    fn create_many(&self, entities: &[Entity]) -> RemoteResult<MultiSaveResult> {
        (**self).create_many(entities)
    }

    fn update(&self, entity: &Entity) -> RemoteResult<Entity> {
        (**self).update(entity)
    }

    fn delete(&self, query: &Query) -> RemoteResult<usize> {
        (**self).delete(query)
    }

    fn aggregate(&self, spec: &AggregateSpec) -> RemoteResult<Vec<Value>> {
        (**self).aggregate(spec)
    }
}
