//! Remote reconciliation controller.
//!
//! The controller owns the conversation with the remote collection for one
//! data store: it drains the pending queue (push), refreshes the cache from
//! the remote (pull, optionally through a delta-set manifest), reverts
//! pending work (purge) and serves the network side of reads and writes.
//!
//! Push, pull, purge and sync run through a small state machine so that only
//! one of them is active at a time. Every remote request is preceded by a
//! cancellation check; work acknowledged before a cancellation stays
//! committed.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use cachesync_core::{
    compute_delta_set, AggregateSpec, CacheBatch, Entity, LocalCache, ManifestEntry, Mutation,
    PendingOperation, Query, SyncQueue, Verb, ID_KEY, LMT_PATH,
};
use cachesync_remote::{ItemError, MultiSaveResult, RemoteCollection, RemoteError, Session};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Message of the error returned when a pull would overwrite pending work.
pub const PULL_GUARD_MESSAGE: &str = "You must push all pending sync items before new data is pulled. \
Call push() on the data store instance to push pending items, or purge() to remove them.";

/// The current state of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Nothing has run yet.
    Idle,
    /// Pending operations are being pushed.
    Pushing,
    /// Remote state is being pulled into the cache.
    Pulling,
    /// Pending operations are being discarded.
    Purging,
    /// The last operation completed.
    Synced,
    /// The last operation failed.
    Error,
}

impl SyncState {
    /// Returns true while an operation is running.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncState::Pushing | SyncState::Pulling | SyncState::Purging
        )
    }

    /// Returns true if a new operation can start.
    pub fn can_start(&self) -> bool {
        matches!(self, SyncState::Idle | SyncState::Synced | SyncState::Error)
    }
}

/// Statistics about sync operations.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Completed pushes.
    pub pushes_completed: u64,
    /// Completed pulls.
    pub pulls_completed: u64,
    /// Entities confirmed by the remote during pushes.
    pub entities_pushed: u64,
    /// Entities returned by pulls.
    pub entities_pulled: u64,
    /// Per-item push failures.
    pub push_errors: u64,
    /// Pulls that went through a delta-set manifest.
    pub delta_set_pulls: u64,
    /// Entities discarded by purges.
    pub entities_purged: u64,
    /// Last successful operation.
    pub last_sync_time: Option<Instant>,
    /// Last error message.
    pub last_error: Option<String>,
}

/// A pending item the remote did not confirm.
#[derive(Debug, Clone, PartialEq)]
pub struct PushError {
    /// Operation the item belongs to.
    pub op_id: Uuid,
    /// Remote verb of the operation.
    pub verb: Verb,
    /// Cache key or id of the item.
    pub key: String,
    /// Failure reported for the item. The index is the item's position in
    /// its operation.
    pub error: ItemError,
}

/// Result of a push.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushResult {
    /// Items confirmed by the remote and removed from the queue.
    pub confirmed: usize,
    /// Server copies of confirmed saves, by the key they were pending under.
    pub saved: BTreeMap<String, Entity>,
    /// Items that stay pending.
    pub errors: Vec<PushError>,
}

impl PushResult {
    /// True when every pushed item was confirmed.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Result of a sync.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SyncOutcome {
    /// Items confirmed by the push.
    pub pushed: usize,
    /// Entities returned by the pull. Empty when the push reported errors.
    pub pulled: Vec<Entity>,
    /// Items the push could not confirm.
    pub errors: Vec<PushError>,
}

/// A push plus the first request-level failure it absorbed.
pub(crate) type PushAttempt = (PushResult, Option<SyncError>);

/// Reconciles one collection's cache and queue with its remote.
pub struct SyncController {
    config: SyncConfig,
    session: Arc<Session>,
    remote: Arc<dyn RemoteCollection>,
    cache: Arc<LocalCache>,
    queue: Arc<SyncQueue>,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    push_lock: Mutex<()>,
}

impl std::fmt::Debug for SyncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncController")
            .field("collection", &self.config.collection)
            .field("remote", &self.remote.name())
            .field("state", &self.state())
            .finish()
    }
}

impl SyncController {
    /// Creates a controller.
    pub fn new(
        config: SyncConfig,
        session: Arc<Session>,
        remote: Arc<dyn RemoteCollection>,
        cache: Arc<LocalCache>,
        queue: Arc<SyncQueue>,
    ) -> Self {
        Self {
            config,
            session,
            remote,
            cache,
            queue,
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            push_lock: Mutex::new(()),
        }
    }

    /// Gets the current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Gets the current stats.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// The configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    fn set_state(&self, state: SyncState) {
        *self.state.write() = state;
    }

    fn begin(&self, next: SyncState) -> SyncResult<()> {
        let mut state = self.state.write();
        if !state.can_start() {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{next:?}"),
            });
        }
        *state = next;
        Ok(())
    }

    fn finish<T>(
        &self,
        result: SyncResult<T>,
        record: impl FnOnce(&mut SyncStats, &T),
    ) -> SyncResult<T> {
        match &result {
            Ok(value) => {
                let mut stats = self.stats.write();
                record(&mut stats, value);
                stats.last_sync_time = Some(Instant::now());
                stats.last_error = None;
                drop(stats);
                self.set_state(SyncState::Synced);
            }
            Err(error) => {
                self.stats.write().last_error = Some(error.to_string());
                self.set_state(SyncState::Error);
            }
        }
        result
    }

    pub(crate) fn require_user(&self) -> SyncResult<()> {
        if self.session.is_authenticated() {
            Ok(())
        } else {
            Err(SyncError::NoActiveUser)
        }
    }

    pub(crate) fn require_cache(&self, operation: &'static str) -> SyncResult<()> {
        if self.config.store_type.has_cache() {
            Ok(())
        } else {
            Err(SyncError::InvalidStoreType {
                store_type: self.config.store_type,
                operation,
            })
        }
    }

    // ---- push ----

    /// Pushes every pending operation in FIFO order.
    ///
    /// Items the remote rejects stay pending and are reported in
    /// [`PushResult::errors`]; the push goes on with the next item.
    ///
    /// # Errors
    ///
    /// Fails before any request on a network-only store, without a signed-in
    /// user or while another operation runs. Fails with
    /// [`SyncError::Cancelled`] when cancelled between requests.
    pub fn push(&self, cancel: &CancelToken) -> SyncResult<PushResult> {
        self.require_cache("push")?;
        self.require_user()?;
        self.begin(SyncState::Pushing)?;
        let result = self.push_inner(None, cancel).map(|(result, _)| result);
        self.finish(result, |stats, pushed| {
            stats.pushes_completed += 1;
            stats.entities_pushed += pushed.confirmed as u64;
            stats.push_errors += pushed.errors.len() as u64;
        })
    }

    /// Pushes the pending items stored under `keys`, leaving everything else
    /// queued. Used for the immediate push of a local-then-network write.
    pub(crate) fn push_keys(
        &self,
        keys: &BTreeSet<String>,
        cancel: &CancelToken,
    ) -> SyncResult<PushAttempt> {
        let attempt = self.push_inner(Some(keys), cancel)?;
        let mut stats = self.stats.write();
        stats.entities_pushed += attempt.0.confirmed as u64;
        stats.push_errors += attempt.0.errors.len() as u64;
        Ok(attempt)
    }

    fn push_inner(
        &self,
        only: Option<&BTreeSet<String>>,
        cancel: &CancelToken,
    ) -> SyncResult<PushAttempt> {
        let _guard = self.push_lock.lock();
        let mut result = PushResult::default();
        let mut failure = None;

        for op in self.queue.pending_operations() {
            if let Some(only) = only {
                if !op.keys().iter().any(|k| only.contains(k)) {
                    continue;
                }
            }
            match op {
                PendingOperation::BatchCreate {
                    op_id,
                    keys,
                    entities,
                } => {
                    let items: Vec<(usize, String, Entity)> = keys
                        .into_iter()
                        .zip(entities)
                        .enumerate()
                        .filter(|(_, (key, _))| only.map_or(true, |only| only.contains(key)))
                        .map(|(position, (key, entity))| (position, key, entity))
                        .collect();
                    self.push_creates(op_id, &items, cancel, &mut result, &mut failure)?;
                }
                PendingOperation::UpsertById { op_id, id, entity } => {
                    cancel.check()?;
                    match self.remote.update(&entity) {
                        Ok(server) => {
                            let mut merged = entity;
                            merged.merge_from_server(server);
                            if self.queue.operation(op_id).is_some() {
                                self.cache.upsert(merged.clone())?;
                            }
                            self.queue.acknowledge(op_id, &[id.as_str()])?;
                            result.confirmed += 1;
                            result.saved.insert(id, merged);
                        }
                        Err(err) => {
                            warn!(collection = %self.config.collection, %op_id, error = %err, "update not confirmed");
                            result.errors.push(PushError {
                                op_id,
                                verb: Verb::Update,
                                key: id,
                                error: ItemError::from_remote(0, &err),
                            });
                            failure.get_or_insert_with(|| SyncError::from(err));
                        }
                    }
                }
                PendingOperation::Delete { op_id, ids, query } => {
                    cancel.check()?;
                    match self.remote.delete(&query) {
                        Ok(_) => {}
                        Err(err) if err.is_not_found() => {
                            debug!(collection = %self.config.collection, %op_id, "delete target already gone");
                        }
                        Err(err) => {
                            warn!(collection = %self.config.collection, %op_id, error = %err, "delete not confirmed");
                            result.errors.extend(ids.into_iter().enumerate().map(|(i, key)| {
                                PushError {
                                    op_id,
                                    verb: Verb::Delete,
                                    key,
                                    error: ItemError::from_remote(i, &err),
                                }
                            }));
                            failure.get_or_insert_with(|| SyncError::from(err));
                            continue;
                        }
                    }
                    result.confirmed += self.queue.acknowledge(op_id, ids.as_slice())?;
                }
            }
        }

        info!(
            collection = %self.config.collection,
            confirmed = result.confirmed,
            errors = result.errors.len(),
            remaining = self.queue.pending_count(),
            "push finished"
        );
        Ok((result, failure))
    }

    fn push_creates(
        &self,
        op_id: Uuid,
        items: &[(usize, String, Entity)],
        cancel: &CancelToken,
        result: &mut PushResult,
        failure: &mut Option<SyncError>,
    ) -> SyncResult<()> {
        let chunk_size = self.config.effective_batch_size();
        for (chunk_index, chunk) in items.chunks(chunk_size).enumerate() {
            cancel.check()?;
            let offset = chunk_index * chunk_size;
            let bodies: Vec<Entity> = chunk.iter().map(|(_, _, e)| e.clone()).collect();
            let outcome = match self.remote.create_many(&bodies) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        collection = %self.config.collection,
                        %op_id,
                        offset,
                        size = chunk.len(),
                        error = %err,
                        "multi-insert chunk failed"
                    );
                    let failed = MultiSaveResult::failed(chunk.len(), &err);
                    failure.get_or_insert_with(|| SyncError::from(err));
                    failed
                }
            };

            // Entities as currently pending; a save during the push may have
            // replaced the snapshot that was sent.
            let current: BTreeMap<String, Entity> = match self.queue.operation(op_id) {
                Some(PendingOperation::BatchCreate { keys, entities, .. }) => {
                    keys.into_iter().zip(entities).collect()
                }
                _ => BTreeMap::new(),
            };

            let mut batch = CacheBatch::new();
            let mut confirmed = Vec::new();
            let mut resaves = Vec::new();
            for (i, (position, key, sent)) in chunk.iter().enumerate() {
                match outcome.entities.get(i).cloned().flatten() {
                    Some(server) => {
                        let mut merged = sent.clone();
                        merged.merge_from_server(server.clone());
                        if let Some(pending) = current.get(key) {
                            if pending == sent {
                                batch.remove(key.clone()).upsert(merged.clone());
                            } else {
                                let mut newer = pending.clone();
                                newer.merge_from_server(server);
                                batch.remove(key.clone()).upsert(newer.clone());
                                resaves.push(newer);
                            }
                        }
                        confirmed.push(key.clone());
                        result.saved.insert(key.clone(), merged);
                    }
                    None => {
                        let mut error = outcome
                            .error_at(i)
                            .cloned()
                            .unwrap_or_else(|| missing_entity_error(i));
                        error.index = *position;
                        result.errors.push(PushError {
                            op_id,
                            verb: Verb::Create,
                            key: key.clone(),
                            error,
                        });
                    }
                }
            }

            self.cache.apply(&batch)?;
            result.confirmed += self.queue.acknowledge(op_id, confirmed.as_slice())?;
            for entity in resaves {
                if let Some(id) = entity.id.clone() {
                    self.queue.enqueue(Mutation::Save { key: id, entity })?;
                }
            }
            debug!(
                collection = %self.config.collection,
                %op_id,
                offset,
                confirmed = confirmed.len(),
                "multi-insert chunk pushed"
            );
        }
        Ok(())
    }

    // ---- pull ----

    /// Pulls the remote records matching `query` into the cache and returns
    /// the cached entities matching it.
    ///
    /// `delta_set` overrides the configured delta-set setting.
    ///
    /// # Errors
    ///
    /// Fails with [`SyncError::InvalidOperation`] without contacting the
    /// remote while operations are pending.
    pub fn pull(
        &self,
        query: &Query,
        delta_set: Option<bool>,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Entity>> {
        self.require_cache("pull")?;
        self.require_user()?;
        self.begin(SyncState::Pulling)?;
        let result = self.pull_inner(query, delta_set.unwrap_or(self.config.delta_set), cancel);
        self.finish(result, |stats, pulled| {
            stats.pulls_completed += 1;
            stats.entities_pulled += pulled.len() as u64;
        })
    }

    fn pull_inner(
        &self,
        query: &Query,
        delta_set: bool,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Entity>> {
        let pending = self.queue.pending_count();
        if pending > 0 {
            warn!(collection = %self.config.collection, pending, "pull refused");
            return Err(SyncError::InvalidOperation(PULL_GUARD_MESSAGE.to_string()));
        }
        self.fetch(query, delta_set, cancel)
    }

    /// Fetches `query` from the remote and merges the result into the cache.
    ///
    /// Records with pending operations are never overwritten or removed. A
    /// projected query is returned as fetched and not cached. A paged query
    /// only upserts what it fetched; an unpaged one replaces its scope.
    pub(crate) fn fetch(
        &self,
        query: &Query,
        delta_set: bool,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Entity>> {
        let scope = query.scope();
        if delta_set && !query.is_paged() && query.fields.is_none() {
            let cached = self.cache.lmt_index(&scope);
            if !cached.is_empty() {
                return self.delta_fetch(query, &scope, &cached, cancel);
            }
        }

        cancel.check()?;
        let fetched = self.remote.query(query)?;
        if query.fields.is_some() {
            return Ok(fetched);
        }

        let protected = self.queue.pending_keys();
        let mut batch = CacheBatch::new();
        if !query.is_paged() {
            for record in self.cache.find_records(&scope) {
                if !record.is_temporary() && !protected.contains(&record.key) {
                    batch.remove(record.key);
                }
            }
        }
        for entity in &fetched {
            if entity.id.as_ref().is_some_and(|id| !protected.contains(id)) {
                batch.upsert(entity.clone());
            }
        }
        self.cache.apply(&batch)?;
        debug!(collection = %self.config.collection, fetched = fetched.len(), "query merged into cache");

        if query.is_paged() {
            Ok(fetched)
        } else {
            Ok(self.cache.find(query))
        }
    }

    fn delta_fetch(
        &self,
        query: &Query,
        scope: &Query,
        cached: &BTreeMap<String, Option<DateTime<Utc>>>,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Entity>> {
        cancel.check()?;
        let manifest_query = scope.clone().select([ID_KEY, LMT_PATH]);
        let manifest: Vec<ManifestEntry> = self
            .remote
            .query(&manifest_query)?
            .iter()
            .filter_map(ManifestEntry::from_entity)
            .collect();
        let delta = compute_delta_set(cached, &manifest);
        self.stats.write().delta_set_pulls += 1;
        debug!(
            collection = %self.config.collection,
            created = delta.created.len(),
            updated = delta.updated.len(),
            deleted = delta.deleted.len(),
            unchanged = delta.unchanged,
            "delta set computed"
        );
        if delta.is_empty() {
            return Ok(self.cache.find(query));
        }

        let protected = self.queue.pending_keys();
        let mut batch = CacheBatch::new();
        for id in &delta.deleted {
            if !protected.contains(id) {
                batch.remove(id.clone());
            }
        }
        for page in delta.fetch_chunks(self.config.effective_page_size()) {
            cancel.check()?;
            let fetched = self.remote.query(&Query::by_ids(page.iter().cloned()))?;
            let returned: BTreeSet<&str> = fetched.iter().filter_map(|e| e.id.as_deref()).collect();
            // Removed remotely between the manifest and this fetch.
            for id in &page {
                if !returned.contains(id.as_str()) && !protected.contains(id) {
                    batch.remove(id.clone());
                }
            }
            for entity in &fetched {
                if entity.id.as_ref().is_some_and(|id| !protected.contains(id)) {
                    batch.upsert(entity.clone());
                }
            }
        }
        self.cache.apply(&batch)?;
        Ok(self.cache.find(query))
    }

    // ---- purge ----

    /// Discards every pending operation and clears the cache scope of
    /// `query`. Returns the number of discarded entities.
    ///
    /// Updates are reverted to the server copy, local creates are dropped and
    /// deletes are forgotten. Each operation leaves the queue as soon as it is
    /// reverted.
    ///
    /// # Errors
    ///
    /// Stops at the first failed request, leaving the operations not yet
    /// reverted in the queue.
    pub fn purge(&self, query: &Query, cancel: &CancelToken) -> SyncResult<usize> {
        self.require_cache("purge")?;
        self.begin(SyncState::Purging)?;
        let result = self.purge_inner(query, cancel);
        self.finish(result, |stats, discarded| {
            stats.entities_purged += *discarded as u64;
        })
    }

    fn purge_inner(&self, query: &Query, cancel: &CancelToken) -> SyncResult<usize> {
        let _guard = self.push_lock.lock();
        let mut discarded = 0;
        for op in self.queue.pending_operations() {
            match &op {
                PendingOperation::UpsertById { id, .. } => {
                    self.require_user()?;
                    cancel.check()?;
                    match self.remote.get(id) {
                        Ok(server) => {
                            self.cache.upsert(server)?;
                        }
                        Err(err) if err.is_not_found() => {
                            self.cache.delete_keys(&[id.as_str()])?;
                        }
                        Err(err) => {
                            warn!(collection = %self.config.collection, op_id = %op.op_id(), error = %err, "purge stopped");
                            return Err(err.into());
                        }
                    }
                }
                PendingOperation::BatchCreate { keys, .. } => {
                    self.cache.delete_keys(keys.as_slice())?;
                }
                PendingOperation::Delete { .. } => {}
            }
            discarded += op.entity_count();
            self.queue.remove(op.op_id())?;
        }
        let cleared = self.cache.clear(Some(query))?;
        info!(collection = %self.config.collection, discarded, cleared, "purge finished");
        Ok(discarded)
    }

    // ---- sync ----

    /// Pushes, then pulls `query` when the push reported no errors.
    pub fn sync(&self, query: &Query, cancel: &CancelToken) -> SyncResult<SyncOutcome> {
        self.require_cache("sync")?;
        self.require_user()?;
        self.begin(SyncState::Pushing)?;

        let result = self.push_inner(None, cancel).and_then(|(pushed, _)| {
            {
                let mut stats = self.stats.write();
                stats.pushes_completed += 1;
                stats.entities_pushed += pushed.confirmed as u64;
                stats.push_errors += pushed.errors.len() as u64;
            }
            if !pushed.errors.is_empty() {
                return Ok(SyncOutcome {
                    pushed: pushed.confirmed,
                    pulled: Vec::new(),
                    errors: pushed.errors,
                });
            }
            self.set_state(SyncState::Pulling);
            let pulled = self.pull_inner(query, self.config.delta_set, cancel)?;
            Ok(SyncOutcome {
                pushed: pushed.confirmed,
                pulled,
                errors: Vec::new(),
            })
        });

        self.finish(result, |stats, outcome| {
            if outcome.errors.is_empty() {
                stats.pulls_completed += 1;
                stats.entities_pulled += outcome.pulled.len() as u64;
            }
        })
    }

    // ---- network reads and writes ----

    /// Creates or updates one entity remotely and caches the server copy.
    pub(crate) fn save_network(&self, entity: &Entity, cancel: &CancelToken) -> SyncResult<Entity> {
        self.require_user()?;
        cancel.check()?;
        let server = match entity.id {
            Some(_) => self.remote.update(entity)?,
            None => self.remote.create(entity)?,
        };
        let mut saved = entity.clone();
        saved.merge_from_server(server);
        if self.config.store_type.has_cache() {
            self.cache.upsert(saved.clone())?;
        }
        Ok(saved)
    }

    /// Saves many entities remotely. New entities go through chunked
    /// multi-inserts, existing ones through individual updates; results come
    /// back in input order.
    ///
    /// # Errors
    ///
    /// An empty input fails with [`RemoteError::EmptyBatch`] without a
    /// request. A failed multi-insert request is reported for every item of
    /// its chunk and the remaining chunks are still sent.
    pub(crate) fn save_many_network(
        &self,
        entities: &[Entity],
        cancel: &CancelToken,
    ) -> SyncResult<MultiSaveResult> {
        if entities.is_empty() {
            return Err(SyncError::Server(RemoteError::EmptyBatch));
        }
        self.require_user()?;

        let mut slots: Vec<Option<Entity>> = vec![None; entities.len()];
        let mut errors: Vec<ItemError> = Vec::new();
        let (new, existing): (Vec<usize>, Vec<usize>) =
            (0..entities.len()).partition(|&i| entities[i].is_new());
        let has_cache = self.config.store_type.has_cache();

        for indices in new.chunks(self.config.effective_batch_size()) {
            cancel.check()?;
            let bodies: Vec<Entity> = indices.iter().map(|&i| entities[i].clone()).collect();
            let outcome = match self.remote.create_many(&bodies) {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(
                        collection = %self.config.collection,
                        first = indices.first().copied().unwrap_or_default(),
                        size = indices.len(),
                        error = %err,
                        "multi-insert chunk failed"
                    );
                    MultiSaveResult::failed(indices.len(), &err)
                }
            };
            let mut batch = CacheBatch::new();
            for (pos, &index) in indices.iter().enumerate() {
                match outcome.entities.get(pos).cloned().flatten() {
                    Some(server) => {
                        let mut saved = entities[index].clone();
                        saved.merge_from_server(server);
                        batch.upsert(saved.clone());
                        slots[index] = Some(saved);
                    }
                    None => {
                        let error = outcome
                            .error_at(pos)
                            .cloned()
                            .unwrap_or_else(|| missing_entity_error(pos));
                        errors.push(ItemError { index, ..error });
                    }
                }
            }
            if has_cache {
                self.cache.apply(&batch)?;
            }
        }

        for index in existing {
            cancel.check()?;
            match self.remote.update(&entities[index]) {
                Ok(server) => {
                    let mut saved = entities[index].clone();
                    saved.merge_from_server(server);
                    if has_cache {
                        self.cache.upsert(saved.clone())?;
                    }
                    slots[index] = Some(saved);
                }
                Err(err) => errors.push(ItemError::from_remote(index, &err)),
            }
        }

        errors.sort_by_key(|e| e.index);
        debug!(
            collection = %self.config.collection,
            requested = entities.len(),
            errors = errors.len(),
            "network save finished"
        );
        Ok(MultiSaveResult {
            entities: slots,
            errors,
        })
    }

    /// Deletes the records matching `query` remotely and from the cache.
    pub(crate) fn remove_network(&self, query: &Query, cancel: &CancelToken) -> SyncResult<usize> {
        self.require_user()?;
        cancel.check()?;
        let removed = self.remote.delete(query)?;
        if self.config.store_type.has_cache() {
            self.cache.delete(query)?;
        }
        Ok(removed)
    }

    /// Reads `query` from the network, refreshing the cache when the store
    /// has one.
    pub(crate) fn find_network(&self, query: &Query, cancel: &CancelToken) -> SyncResult<Vec<Entity>> {
        self.require_user()?;
        if self.config.store_type.has_cache() {
            self.fetch(query, self.config.delta_set, cancel)
        } else {
            cancel.check()?;
            Ok(self.remote.query(query)?)
        }
    }

    /// Reads one entity from the network. A missing entity is `None`.
    pub(crate) fn get_network(&self, id: &str, cancel: &CancelToken) -> SyncResult<Option<Entity>> {
        self.require_user()?;
        cancel.check()?;
        match self.remote.get(id) {
            Ok(entity) => {
                if self.config.store_type.has_cache() && !self.queue.pending_keys().contains(id) {
                    self.cache.upsert(entity.clone())?;
                }
                Ok(Some(entity))
            }
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Counts remotely.
    pub(crate) fn count_network(&self, query: &Query, cancel: &CancelToken) -> SyncResult<usize> {
        self.require_user()?;
        cancel.check()?;
        Ok(self.remote.count(query)?)
    }

    /// Aggregates remotely.
    pub(crate) fn aggregate_network(
        &self,
        spec: &AggregateSpec,
        cancel: &CancelToken,
    ) -> SyncResult<Vec<Value>> {
        self.require_user()?;
        cancel.check()?;
        Ok(self.remote.aggregate(spec)?)
    }
}

/// Error for an item the remote neither saved nor reported.
fn missing_entity_error(index: usize) -> ItemError {
    ItemError::from_remote(
        index,
        &RemoteError::Server {
            status: 500,
            error: "MissingEntity".to_string(),
            description: Some("no entity returned for item".to_string()),
            debug: None,
        },
    )
}
