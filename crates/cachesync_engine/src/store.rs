//! Data store facade.
//!
//! A [`DataStore`] routes each call to the local cache, the pending queue
//! and the [`SyncController`] according to a read or write policy. The
//! policies default to the ones implied by the store type and can be
//! overridden per call.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::controller::{PushResult, SyncController, SyncOutcome, SyncState, SyncStats};
use crate::error::{SyncError, SyncResult};
use crate::policy::{ReadPolicy, StoreType, WritePolicy};
use cachesync_core::{
    Acl, AggregateSpec, CacheBatch, CacheRecord, CoreError, Entity, LocalCache, Mutation,
    PendingOperation, Query, StoreDir, SyncQueue, SystemClock,
};
use cachesync_remote::{ItemError, MultiSaveResult, RemoteCollection, RemoteError, Session};
use cachesync_storage::FileBackend;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// Entry point for reading and writing one collection.
#[derive(Debug)]
pub struct DataStore {
    config: SyncConfig,
    session: Arc<Session>,
    controller: SyncController,
    cache: Arc<LocalCache>,
    queue: Arc<SyncQueue>,
}

impl DataStore {
    /// Creates a store whose cache and queue live in memory.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory journals cannot be opened.
    pub fn in_memory(
        config: SyncConfig,
        session: Arc<Session>,
        remote: Arc<dyn RemoteCollection>,
    ) -> SyncResult<Self> {
        let cache = LocalCache::in_memory(config.collection.clone(), config.cache.clone())?;
        let queue = SyncQueue::in_memory(config.collection.clone())?;
        Ok(Self::from_parts(
            config,
            session,
            remote,
            Arc::new(cache),
            Arc::new(queue),
        ))
    }

    /// Opens a store whose cache and queue are journals under `dir`.
    ///
    /// A network-only store keeps nothing on disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the collection name is invalid or a journal cannot
    /// be opened or replayed.
    pub fn open(
        dir: &StoreDir,
        config: SyncConfig,
        session: Arc<Session>,
        remote: Arc<dyn RemoteCollection>,
    ) -> SyncResult<Self> {
        if !config.store_type.has_cache() {
            return Self::in_memory(config, session, remote);
        }
        let collection = config.collection.clone();
        let cache_backend = FileBackend::open(&dir.cache_path(&collection)?)
            .map_err(CoreError::from)?;
        let queue_backend = FileBackend::open(&dir.queue_path(&collection)?)
            .map_err(CoreError::from)?;

        let cache = LocalCache::open(
            collection.clone(),
            Box::new(cache_backend),
            config.cache.clone(),
            Arc::new(SystemClock),
        )?;
        let queue = SyncQueue::open(collection, Box::new(queue_backend))?;
        debug!(
            collection = %config.collection,
            cached = cache.len(),
            pending = queue.pending_count(),
            "opened data store"
        );
        Ok(Self::from_parts(
            config,
            session,
            remote,
            Arc::new(cache),
            Arc::new(queue),
        ))
    }

    /// Assembles a store from an existing cache and queue.
    pub fn from_parts(
        config: SyncConfig,
        session: Arc<Session>,
        remote: Arc<dyn RemoteCollection>,
        cache: Arc<LocalCache>,
        queue: Arc<SyncQueue>,
    ) -> Self {
        let controller = SyncController::new(
            config.clone(),
            session.clone(),
            remote,
            cache.clone(),
            queue.clone(),
        );
        Self {
            config,
            session,
            controller,
            cache,
            queue,
        }
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// The store type.
    pub fn store_type(&self) -> StoreType {
        self.config.store_type
    }

    /// The session this store acts for.
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// State of the last push, pull, purge or sync.
    pub fn state(&self) -> SyncState {
        self.controller.state()
    }

    /// Sync statistics.
    pub fn stats(&self) -> SyncStats {
        self.controller.stats()
    }

    fn read_policy(&self, policy: Option<ReadPolicy>) -> ReadPolicy {
        policy.unwrap_or_else(|| self.config.store_type.read_policy())
    }

    fn write_policy(&self, policy: Option<WritePolicy>) -> WritePolicy {
        policy.unwrap_or_else(|| self.config.store_type.write_policy())
    }

    fn require_local(&self, operation: &'static str) -> SyncResult<()> {
        self.controller.require_cache(operation)
    }

    // ---- reads ----

    /// Finds the entities matching `query`.
    ///
    /// # Errors
    ///
    /// See [`ReadPolicy`] for where each policy reads from. A cache-only read
    /// on a network store fails with [`SyncError::InvalidStoreType`].
    pub fn find(&self, query: &Query, policy: Option<ReadPolicy>) -> SyncResult<Vec<Entity>> {
        self.find_with(query, self.read_policy(policy), &CancelToken::new())
    }

    pub(crate) fn find_with(
        &self,
        query: &Query,
        policy: ReadPolicy,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Entity>> {
        self.read(
            "find",
            policy,
            || Ok(self.cache.find(query)),
            || self.controller.find_network(query, cancel),
        )
    }

    /// Finds one entity by id.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::InvalidArgument`] for an empty id.
    pub fn find_by_id(&self, id: &str, policy: Option<ReadPolicy>) -> SyncResult<Option<Entity>> {
        self.find_by_id_with(id, self.read_policy(policy), &CancelToken::new())
    }

    pub(crate) fn find_by_id_with(
        &self,
        id: &str,
        policy: ReadPolicy,
        cancel: &CancelToken,
    ) -> SyncResult<Option<Entity>> {
        check_id(id)?;
        self.read(
            "find_by_id",
            policy,
            || Ok(self.cache.get(id)),
            || self.controller.get_network(id, cancel),
        )
    }

    /// Counts the entities matching `query`.
    pub fn count(&self, query: &Query, policy: Option<ReadPolicy>) -> SyncResult<usize> {
        self.count_with(query, self.read_policy(policy), &CancelToken::new())
    }

    pub(crate) fn count_with(
        &self,
        query: &Query,
        policy: ReadPolicy,
        cancel: &CancelToken,
    ) -> SyncResult<usize> {
        self.read(
            "count",
            policy,
            || Ok(self.cache.count(query)),
            || self.controller.count_network(query, cancel),
        )
    }

    /// Groups and reduces entities.
    pub fn aggregate(
        &self,
        spec: &AggregateSpec,
        policy: Option<ReadPolicy>,
    ) -> SyncResult<Vec<Value>> {
        self.aggregate_with(spec, self.read_policy(policy), &CancelToken::new())
    }

    pub(crate) fn aggregate_with(
        &self,
        spec: &AggregateSpec,
        policy: ReadPolicy,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Value>> {
        self.read(
            "aggregate",
            policy,
            || Ok(self.cache.aggregate(spec)),
            || self.controller.aggregate_network(spec, cancel),
        )
    }

    /// Cache-only read. Served for async `Both` reads before the network.
    pub(crate) fn read_local<T>(
        &self,
        operation: &'static str,
        local: impl FnOnce() -> SyncResult<T>,
    ) -> SyncResult<T> {
        self.require_local(operation)?;
        local()
    }

    fn read<T>(
        &self,
        operation: &'static str,
        policy: ReadPolicy,
        local: impl FnOnce() -> SyncResult<T>,
        network: impl FnOnce() -> SyncResult<T>,
    ) -> SyncResult<T> {
        match policy {
            ReadPolicy::ForceLocal => self.read_local(operation, local),
            ReadPolicy::ForceNetwork | ReadPolicy::Both => network(),
            ReadPolicy::NetworkOtherwiseLocal => match network() {
                Err(err) if err.is_transport() && self.config.store_type.has_cache() => {
                    debug!(
                        collection = %self.config.collection,
                        operation,
                        error = %err,
                        "network read failed, serving the cache"
                    );
                    local()
                }
                other => other,
            },
        }
    }

    // ---- writes ----

    /// Saves one entity and returns it as stored.
    ///
    /// A new entity saved locally keeps no id until it is pushed; use
    /// [`Self::records`] to find its temporary key.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::InvalidArgument`] for an empty id. A failed
    /// immediate push surfaces its error; the entity stays pending.
    pub fn save(&self, entity: Entity, policy: Option<WritePolicy>) -> SyncResult<Entity> {
        self.save_with(None, entity, self.write_policy(policy), &CancelToken::new())
    }

    /// Saves an entity that has not been pushed yet under its temporary key.
    ///
    /// # Errors
    ///
    /// Fails if `key` is neither the entity id nor a temporary key.
    pub fn save_under(
        &self,
        key: &str,
        entity: Entity,
        policy: Option<WritePolicy>,
    ) -> SyncResult<Entity> {
        check_id(key)?;
        self.save_with(
            Some(key.to_string()),
            entity,
            self.write_policy(policy),
            &CancelToken::new(),
        )
    }

    pub(crate) fn save_with(
        &self,
        key: Option<String>,
        entity: Entity,
        policy: WritePolicy,
        cancel: &CancelToken,
    ) -> SyncResult<Entity> {
        if let Some(id) = &entity.id {
            check_id(id)?;
        }
        let entity = self.stamp_creator(entity);
        match policy {
            WritePolicy::ForceNetwork => self.controller.save_network(&entity, cancel),
            WritePolicy::ForceLocal => {
                self.require_local("save")?;
                self.save_local(key, entity.clone())?;
                Ok(entity)
            }
            WritePolicy::LocalThenNetwork => {
                self.require_local("save")?;
                self.controller.require_user()?;
                let key = self.save_local(key, entity.clone())?;
                let (pushed, failure) = self
                    .controller
                    .push_keys(&BTreeSet::from([key.clone()]), cancel)?;
                if let Some(err) = failure {
                    return Err(err);
                }
                if let Some(rejected) = pushed.errors.first() {
                    return Err(SyncError::Server(rejected.error.to_remote()));
                }
                Ok(pushed.saved.get(&key).cloned().unwrap_or(entity))
            }
        }
    }

    /// Saves many entities.
    ///
    /// Locally saved entities are reported as saved; items an immediate or
    /// network push could not save are reported in
    /// [`MultiSaveResult::errors`] under their input index.
    ///
    /// # Errors
    ///
    /// An empty input fails with the server's empty-batch error without any
    /// I/O.
    pub fn save_many(
        &self,
        entities: Vec<Entity>,
        policy: Option<WritePolicy>,
    ) -> SyncResult<MultiSaveResult> {
        self.save_many_with(entities, self.write_policy(policy), &CancelToken::new())
    }

    pub(crate) fn save_many_with(
        &self,
        entities: Vec<Entity>,
        policy: WritePolicy,
        cancel: &CancelToken,
    ) -> SyncResult<MultiSaveResult> {
        if entities.is_empty() {
            return Err(SyncError::Server(RemoteError::EmptyBatch));
        }
        for id in entities.iter().filter_map(|e| e.id.as_deref()) {
            check_id(id)?;
        }
        let entities: Vec<Entity> = entities
            .into_iter()
            .map(|e| self.stamp_creator(e))
            .collect();

        match policy {
            WritePolicy::ForceNetwork => self.controller.save_many_network(&entities, cancel),
            WritePolicy::ForceLocal => {
                self.require_local("save_many")?;
                self.save_many_local(&entities)?;
                Ok(MultiSaveResult {
                    entities: entities.into_iter().map(Some).collect(),
                    errors: Vec::new(),
                })
            }
            WritePolicy::LocalThenNetwork => {
                self.require_local("save_many")?;
                self.controller.require_user()?;
                let keys = self.save_many_local(&entities)?;
                let positions: BTreeMap<&str, usize> = keys
                    .iter()
                    .enumerate()
                    .map(|(i, k)| (k.as_str(), i))
                    .collect();
                let wanted: BTreeSet<String> = keys.iter().cloned().collect();
                let (pushed, _) = self.controller.push_keys(&wanted, cancel)?;

                let mut result = MultiSaveResult {
                    entities: entities.into_iter().map(Some).collect(),
                    errors: Vec::new(),
                };
                for (key, saved) in pushed.saved {
                    if let Some(&index) = positions.get(key.as_str()) {
                        result.entities[index] = Some(saved);
                    }
                }
                for failed in pushed.errors {
                    if let Some(&index) = positions.get(failed.key.as_str()) {
                        result.entities[index] = None;
                        result.errors.push(ItemError {
                            index,
                            ..failed.error
                        });
                    }
                }
                result.errors.sort_by_key(|e| e.index);
                Ok(result)
            }
        }
    }

    fn stamp_creator(&self, mut entity: Entity) -> Entity {
        if entity.is_new() {
            if let Some(user) = self.session.active_user() {
                let acl = entity.acl.get_or_insert_with(Acl::default);
                if acl.creator.is_none() {
                    acl.creator = Some(user);
                }
            }
        }
        entity
    }

    fn save_local(&self, key: Option<String>, entity: Entity) -> SyncResult<String> {
        let created = key.is_none() && entity.is_new();
        let mut batch = CacheBatch::new();
        match key {
            Some(key) => batch.put(key, entity.clone()),
            None => batch.upsert(entity.clone()),
        };
        let key = self
            .cache
            .apply(&batch)?
            .pop()
            .ok_or_else(|| SyncError::Internal("cache returned no key".to_string()))?;
        if let Err(err) = self.queue.enqueue(Mutation::Save {
            key: key.clone(),
            entity,
        }) {
            if created {
                self.rollback_created(&[key.as_str()]);
            }
            return Err(err.into());
        }
        Ok(key)
    }

    fn save_many_local(&self, entities: &[Entity]) -> SyncResult<Vec<String>> {
        let keys = self.cache.upsert_many(entities.to_vec())?;
        let queued = self
            .queue
            .enqueue_all(keys.iter().zip(entities).map(|(key, entity)| Mutation::Save {
                key: key.clone(),
                entity: entity.clone(),
            }));
        if let Err(err) = queued {
            let created: Vec<&str> = keys
                .iter()
                .zip(entities)
                .filter(|(_, entity)| entity.is_new())
                .map(|(key, _)| key.as_str())
                .collect();
            self.rollback_created(&created);
            return Err(err.into());
        }
        Ok(keys)
    }

    /// Drops new records whose pending create could not be queued.
    fn rollback_created(&self, keys: &[&str]) {
        if let Err(err) = self.cache.delete_keys(keys) {
            warn!(collection = %self.config.collection, error = %err, "cache rollback failed");
        }
    }

    // ---- removes ----

    /// Removes one entity by id or temporary key.
    pub fn remove_by_id(&self, id: &str, policy: Option<WritePolicy>) -> SyncResult<usize> {
        check_id(id)?;
        self.remove_keys_with(vec![id.to_string()], self.write_policy(policy), &CancelToken::new())
    }

    /// Removes entities by id or temporary key.
    pub fn remove_by_ids<S: AsRef<str>>(
        &self,
        ids: &[S],
        policy: Option<WritePolicy>,
    ) -> SyncResult<usize> {
        let ids: Vec<String> = ids.iter().map(|id| id.as_ref().to_string()).collect();
        for id in &ids {
            check_id(id)?;
        }
        self.remove_keys_with(ids, self.write_policy(policy), &CancelToken::new())
    }

    /// Removes the entities matching `query`.
    pub fn remove(&self, query: &Query, policy: Option<WritePolicy>) -> SyncResult<usize> {
        self.remove_with(query, self.write_policy(policy), &CancelToken::new())
    }

    /// Removes every entity of the collection.
    pub fn remove_all(&self, policy: Option<WritePolicy>) -> SyncResult<usize> {
        self.remove(&Query::new(), policy)
    }

    pub(crate) fn remove_with(
        &self,
        query: &Query,
        policy: WritePolicy,
        cancel: &CancelToken,
    ) -> SyncResult<usize> {
        if policy == WritePolicy::ForceNetwork {
            return self.controller.remove_network(query, cancel);
        }
        self.require_local("remove")?;
        let keys: Vec<String> = self
            .cache
            .find_records(&query.scope())
            .into_iter()
            .map(|r| r.key)
            .collect();
        self.remove_keys_with(keys, policy, cancel)
    }

    pub(crate) fn remove_keys_with(
        &self,
        keys: Vec<String>,
        policy: WritePolicy,
        cancel: &CancelToken,
    ) -> SyncResult<usize> {
        match policy {
            WritePolicy::ForceNetwork => {
                self.controller
                    .remove_network(&Query::by_ids(keys.iter().cloned()), cancel)
            }
            WritePolicy::ForceLocal => {
                self.require_local("remove")?;
                self.remove_local(keys)
            }
            WritePolicy::LocalThenNetwork => {
                self.require_local("remove")?;
                self.controller.require_user()?;
                let wanted: BTreeSet<String> = keys.iter().cloned().collect();
                let removed = self.remove_local(keys)?;
                let (pushed, failure) = self.controller.push_keys(&wanted, cancel)?;
                if let Some(err) = failure {
                    return Err(err);
                }
                if let Some(rejected) = pushed.errors.first() {
                    return Err(SyncError::Server(rejected.error.to_remote()));
                }
                Ok(removed)
            }
        }
    }

    fn remove_local(&self, keys: Vec<String>) -> SyncResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let removed = self.cache.delete_keys(keys.as_slice())?;
        self.queue.enqueue(Mutation::Delete { keys })?;
        Ok(removed)
    }

    // ---- sync ----

    /// Pushes every pending operation.
    pub fn push(&self) -> SyncResult<PushResult> {
        self.controller.push(&CancelToken::new())
    }

    pub(crate) fn push_with(&self, cancel: &CancelToken) -> SyncResult<PushResult> {
        self.controller.push(cancel)
    }

    /// Pulls `query` into the cache. `delta_set` overrides the configured
    /// setting.
    pub fn pull(&self, query: &Query, delta_set: Option<bool>) -> SyncResult<Vec<Entity>> {
        self.controller.pull(query, delta_set, &CancelToken::new())
    }

    pub(crate) fn pull_with(
        &self,
        query: &Query,
        delta_set: Option<bool>,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Entity>> {
        self.controller.pull(query, delta_set, cancel)
    }

    /// Pushes, then pulls `query` if the push reported no errors.
    pub fn sync(&self, query: &Query) -> SyncResult<SyncOutcome> {
        self.controller.sync(query, &CancelToken::new())
    }

    pub(crate) fn sync_with(&self, query: &Query, cancel: &CancelToken) -> SyncResult<SyncOutcome> {
        self.controller.sync(query, cancel)
    }

    /// Discards pending operations and clears the cache scope of `query`.
    pub fn purge(&self, query: &Query) -> SyncResult<usize> {
        self.controller.purge(query, &CancelToken::new())
    }

    pub(crate) fn purge_with(&self, query: &Query, cancel: &CancelToken) -> SyncResult<usize> {
        self.controller.purge(query, cancel)
    }

    // ---- local state ----

    /// Number of pending entities.
    pub fn sync_count(&self) -> usize {
        self.queue
            .pending_operations()
            .iter()
            .map(PendingOperation::entity_count)
            .sum()
    }

    /// Pending operations in push order.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.queue.pending_operations()
    }

    /// Cached records matching `query`, with their keys.
    pub fn records(&self, query: &Query) -> Vec<CacheRecord> {
        self.cache.find_records(query)
    }

    /// Removes cached records matching `query`, or all of them. Pending
    /// operations are kept.
    ///
    /// # Errors
    ///
    /// Returns an error if the cache journal cannot be written.
    pub fn clear_cache(&self, query: Option<&Query>) -> SyncResult<usize> {
        self.require_local("clear_cache")?;
        Ok(self.cache.clear(query)?)
    }

    /// Physically removes expired cache records.
    pub fn evict_expired(&self) -> SyncResult<usize> {
        self.require_local("evict_expired")?;
        Ok(self.cache.evict_expired()?)
    }
}

fn check_id(id: &str) -> SyncResult<()> {
    if id.is_empty() {
        Err(SyncError::InvalidArgument("id must not be empty".to_string()))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesync_core::Predicate;
    use cachesync_remote::{MemoryRemote, RequestKind};

    fn store(store_type: StoreType) -> (Arc<MemoryRemote>, DataStore) {
        let remote = Arc::new(MemoryRemote::new("books"));
        let session = Arc::new(Session::signed_in("kid_app", "user-1", "token"));
        let store = DataStore::in_memory(
            SyncConfig::new("books").with_store_type(store_type),
            session,
            remote.clone(),
        )
        .unwrap();
        (remote, store)
    }

    #[test]
    fn local_save_stamps_creator_and_queues() {
        let (remote, store) = store(StoreType::Sync);
        let saved = store.save(Entity::new().field("title", "Dune"), None).unwrap();

        assert_eq!(saved.acl.unwrap().creator.as_deref(), Some("user-1"));
        assert_eq!(store.sync_count(), 1);
        assert_eq!(store.find(&Query::new(), None).unwrap().len(), 1);
        assert_eq!(remote.request_count(), 0);
    }

    #[test]
    fn save_under_updates_the_pending_record() {
        let (_, store) = store(StoreType::Sync);
        store.save(Entity::new().field("n", 1), None).unwrap();
        let key = store.records(&Query::new())[0].key.clone();

        store
            .save_under(&key, Entity::new().field("n", 2), None)
            .unwrap();
        assert_eq!(store.records(&Query::new()).len(), 1);
        assert_eq!(store.sync_count(), 1);
        match &store.pending_operations()[0] {
            PendingOperation::BatchCreate { entities, .. } => {
                assert_eq!(entities[0].get("n"), Some(&2.into()));
            }
            other => panic!("unexpected operation {other:?}"),
        }
    }

    #[test]
    fn empty_ids_are_rejected() {
        let (_, store) = store(StoreType::Sync);
        assert!(matches!(
            store.find_by_id("", None),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.remove_by_id("", None),
            Err(SyncError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.save(Entity::with_id(""), None),
            Err(SyncError::InvalidArgument(_))
        ));
    }

    #[test]
    fn empty_save_many_fails_without_io() {
        let (remote, store) = store(StoreType::Cache);
        let err = store.save_many(Vec::new(), None).unwrap_err();
        assert!(matches!(err, SyncError::Server(RemoteError::EmptyBatch)));
        assert_eq!(remote.request_count(), 0);
    }

    #[test]
    fn cache_store_pushes_immediately() {
        let (remote, store) = store(StoreType::Cache);
        let saved = store.save(Entity::new().field("title", "Dune"), None).unwrap();

        assert!(saved.id.is_some());
        assert_eq!(store.sync_count(), 0);
        assert_eq!(remote.count_of(RequestKind::CreateMany), 1);
        assert!(store
            .find_by_id(saved.id.as_deref().unwrap(), Some(ReadPolicy::ForceLocal))
            .unwrap()
            .is_some());
    }

    #[test]
    fn failed_immediate_push_keeps_the_entry() {
        let (remote, store) = store(StoreType::Cache);
        remote.fail_next(RemoteError::transport_retryable("offline"));

        let err = store.save(Entity::new().field("n", 1), None).unwrap_err();
        assert!(err.is_transport());
        assert_eq!(store.sync_count(), 1);
        assert_eq!(store.records(&Query::new()).len(), 1);
    }

    #[test]
    fn auto_store_falls_back_to_the_cache() {
        let (remote, store) = store(StoreType::Auto);
        remote.seed([Entity::with_id("a").field("n", 1)]);
        store.find(&Query::new(), None).unwrap();

        remote.fail_next(RemoteError::Timeout);
        let found = store.find(&Query::new(), None).unwrap();
        assert_eq!(found.len(), 1);

        remote.fail_next(RemoteError::bad_request("broken query"));
        assert!(store.find(&Query::new(), None).is_err());
    }

    #[test]
    fn network_store_rejects_local_reads() {
        let (_, store) = store(StoreType::Network);
        let err = store
            .find(&Query::new(), Some(ReadPolicy::ForceLocal))
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidStoreType { operation: "find", .. }));
    }

    #[test]
    fn network_writes_need_a_user() {
        let (remote, store) = store(StoreType::Network);
        store.session().sign_out();
        let err = store.save(Entity::new(), None).unwrap_err();
        assert!(matches!(err, SyncError::NoActiveUser));
        assert_eq!(remote.request_count(), 0);
    }

    #[test]
    fn local_remove_queues_a_delete() {
        let (_, store) = store(StoreType::Sync);
        store.save(Entity::with_id("a").field("n", 1), None).unwrap();
        store.save(Entity::with_id("b").field("n", 2), None).unwrap();

        let removed = store
            .remove(&Query::filter(Predicate::eq("n", 1)), None)
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.sync_count(), 2);
        assert!(store.find_by_id("a", None).unwrap().is_none());
    }

    /// Reads fine, refuses every write.
    struct ReadOnlyBackend;

    impl cachesync_storage::JournalBackend for ReadOnlyBackend {
        fn load(&self) -> cachesync_storage::StorageResult<Vec<u8>> {
            Ok(Vec::new())
        }

        fn append(&mut self, _data: &[u8]) -> cachesync_storage::StorageResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "read-only").into())
        }

        fn replace(&mut self, _data: &[u8]) -> cachesync_storage::StorageResult<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "read-only").into())
        }

        fn sync(&mut self) -> cachesync_storage::StorageResult<()> {
            Ok(())
        }

        fn size(&self) -> cachesync_storage::StorageResult<u64> {
            Ok(0)
        }
    }

    #[test]
    fn unqueued_saves_leave_no_new_records() {
        let store = DataStore::from_parts(
            SyncConfig::new("books").with_store_type(StoreType::Sync),
            Arc::new(Session::signed_in("kid_app", "user-1", "token")),
            Arc::new(MemoryRemote::new("books")),
            Arc::new(LocalCache::in_memory("books", Default::default()).unwrap()),
            Arc::new(SyncQueue::open("books", Box::new(ReadOnlyBackend)).unwrap()),
        );

        assert!(matches!(
            store.save(Entity::new().field("n", 1), None),
            Err(SyncError::Core(_))
        ));
        assert!(matches!(
            store.save_many(vec![Entity::new(), Entity::new()], None),
            Err(SyncError::Core(_))
        ));
        assert!(store.records(&Query::new()).is_empty());
        assert_eq!(store.sync_count(), 0);
    }

    #[test]
    fn removing_an_unpushed_entity_leaves_nothing_pending() {
        let (_, store) = store(StoreType::Sync);
        store.save(Entity::new().field("n", 1), None).unwrap();
        let key = store.records(&Query::new())[0].key.clone();

        assert_eq!(store.remove_by_id(&key, None).unwrap(), 1);
        assert_eq!(store.sync_count(), 0);
    }
}
