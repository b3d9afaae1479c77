//! Local cache of entities.
//!
//! The cache is an in-memory ordered map of [`CacheRecord`]s backed by a
//! [`Journal`]. Every mutating call writes exactly one frame before memory
//! is touched, while the write lock is held, so a crash never leaves a
//! half-applied call behind. Opening a cache replays the journal.
//!
//! ```text
//! frame := Batch { remove: [key], upsert: [CacheRecord] } | Clear
//! ```
//!
//! When the journal grows past [`CacheConfig::compact_after_frames`] it is
//! rewritten as a single snapshot frame.

use crate::aggregate::{aggregate, AggregateSpec};
use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::CacheConfig;
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::query::Query;
use cachesync_storage::{InMemoryBackend, Journal, JournalBackend};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Prefix of keys assigned to entities that have no id yet.
pub const TEMP_KEY_PREFIX: &str = "tmp_";

fn temporary_key() -> String {
    format!("{TEMP_KEY_PREFIX}{}", Uuid::new_v4().simple())
}

/// A cached entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The entity id, or a temporary key for entities not yet created remotely.
    pub key: String,
    /// The cached entity.
    pub entity: Entity,
    /// When the record was last written to the cache.
    pub cached_at: DateTime<Utc>,
}

impl CacheRecord {
    /// True when the record is keyed by a temporary key.
    pub fn is_temporary(&self) -> bool {
        self.entity.id.is_none()
    }
}

#[derive(Debug, Serialize, Deserialize)]
enum JournalEntry {
    Batch {
        remove: Vec<String>,
        upsert: Vec<CacheRecord>,
    },
    Clear,
}

/// A set of removals and upserts applied atomically by [`LocalCache::apply`].
///
/// Removals are applied before upserts.
#[derive(Debug, Default, Clone)]
pub struct CacheBatch {
    remove: Vec<String>,
    upsert: Vec<(Option<String>, Entity)>,
}

impl CacheBatch {
    /// Creates an empty batch.
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the record stored under `key`.
    pub fn remove(&mut self, key: impl Into<String>) -> &mut Self {
        self.remove.push(key.into());
        self
    }

    /// Inserts or replaces an entity under its id, or under a fresh
    /// temporary key when it has none.
    pub fn upsert(&mut self, entity: Entity) -> &mut Self {
        self.upsert.push((None, entity));
        self
    }

    /// Inserts or replaces an entity under an explicit key.
    ///
    /// The key must be the entity id, or a temporary key when the entity has
    /// no id.
    pub fn put(&mut self, key: impl Into<String>, entity: Entity) -> &mut Self {
        self.upsert.push((Some(key.into()), entity));
        self
    }

    /// True when the batch does nothing.
    pub fn is_empty(&self) -> bool {
        self.remove.is_empty() && self.upsert.is_empty()
    }
}

/// The on-device cache of one collection.
pub struct LocalCache {
    collection: String,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    records: RwLock<BTreeMap<String, CacheRecord>>,
    journal: Mutex<Journal>,
}

impl std::fmt::Debug for LocalCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCache")
            .field("collection", &self.collection)
            .field("records", &self.records.read().len())
            .field("config", &self.config)
            .finish()
    }
}

impl LocalCache {
    /// Opens a cache over `backend`, replaying its journal.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is corrupted or a frame cannot be
    /// decoded.
    pub fn open(
        collection: impl Into<String>,
        backend: Box<dyn JournalBackend>,
        config: CacheConfig,
        clock: Arc<dyn Clock>,
    ) -> CoreResult<Self> {
        let collection = collection.into();
        let (mut journal, replay) = Journal::open(backend)?;
        journal.set_sync_on_append(config.sync_on_write);

        if replay.discarded_bytes > 0 {
            warn!(
                collection = %collection,
                discarded_bytes = replay.discarded_bytes,
                "discarded torn cache journal tail"
            );
        }

        let mut records = BTreeMap::new();
        for frame in &replay.frames {
            let entry: JournalEntry = codec::decode(frame)?;
            replay_entry(&mut records, entry);
        }
        debug!(
            collection = %collection,
            frames = replay.frames.len(),
            records = records.len(),
            "opened local cache"
        );

        Ok(Self {
            collection,
            config,
            clock,
            records: RwLock::new(records),
            journal: Mutex::new(journal),
        })
    }

    /// Opens an empty, non-durable cache using the system clock.
    pub fn in_memory(collection: impl Into<String>, config: CacheConfig) -> CoreResult<Self> {
        Self::open(
            collection,
            Box::new(InMemoryBackend::new()),
            config,
            Arc::new(SystemClock),
        )
    }

    /// Name of the cached collection.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    /// The cache configuration.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The clock used for `cached_at` stamps and expiry.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Number of stored records, expired ones included.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    fn is_expired(&self, record: &CacheRecord, now: DateTime<Utc>) -> bool {
        let Some(ttl) = self.config.ttl else {
            return false;
        };
        match chrono::Duration::from_std(ttl) {
            Ok(ttl) => now - record.cached_at > ttl,
            Err(_) => false,
        }
    }

    /// Inserts or replaces one entity and returns its key.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn upsert(&self, entity: Entity) -> CoreResult<String> {
        let mut batch = CacheBatch::new();
        batch.upsert(entity);
        let mut keys = self.apply(&batch)?;
        keys.pop()
            .ok_or_else(|| CoreError::invalid_entity("upsert produced no key"))
    }

    /// Inserts or replaces entities and returns their keys in input order.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn upsert_many(&self, entities: Vec<Entity>) -> CoreResult<Vec<String>> {
        let mut batch = CacheBatch::new();
        for entity in entities {
            batch.upsert(entity);
        }
        self.apply(&batch)
    }

    /// Applies a batch under one write lock and one journal frame.
    ///
    /// Returns the keys of the upserted records in batch order.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicit key does not fit its entity, or if the
    /// journal write fails. Nothing is applied on error.
    pub fn apply(&self, batch: &CacheBatch) -> CoreResult<Vec<String>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let mut upsert = Vec::with_capacity(batch.upsert.len());
        for (key, entity) in &batch.upsert {
            let key = match (key, &entity.id) {
                (Some(key), Some(id)) if key != id => {
                    return Err(CoreError::invalid_entity(format!(
                        "key {key:?} does not match entity id {id:?}"
                    )));
                }
                (Some(key), None) if !key.starts_with(TEMP_KEY_PREFIX) => {
                    return Err(CoreError::invalid_entity(format!(
                        "entity without id stored under non-temporary key {key:?}"
                    )));
                }
                (Some(key), _) => key.clone(),
                (None, Some(id)) => id.clone(),
                (None, None) => temporary_key(),
            };
            upsert.push(CacheRecord {
                key,
                entity: entity.clone(),
                cached_at: now,
            });
        }
        let keys = upsert.iter().map(|r| r.key.clone()).collect();

        self.commit(JournalEntry::Batch {
            remove: batch.remove.clone(),
            upsert,
        })?;
        Ok(keys)
    }

    fn commit(&self, entry: JournalEntry) -> CoreResult<()> {
        let mut records = self.records.write();
        let mut journal = self.journal.lock();

        journal.append(&codec::encode(&entry)?)?;
        replay_entry(&mut records, entry);

        if journal.frame_count() > self.config.compact_after_frames {
            let snapshot = JournalEntry::Batch {
                remove: Vec::new(),
                upsert: records.values().cloned().collect(),
            };
            // The entry is already durable; a failed compaction is retried on
            // the next commit.
            let compacted = codec::encode(&snapshot)
                .and_then(|frame| journal.rewrite(&[frame]).map_err(CoreError::from));
            match compacted {
                Ok(()) => debug!(
                    collection = %self.collection,
                    records = records.len(),
                    "compacted cache journal"
                ),
                Err(err) => warn!(
                    collection = %self.collection,
                    error = %err,
                    "cache journal compaction failed"
                ),
            }
        }
        Ok(())
    }

    /// Returns the entity stored under `key` unless it has expired.
    pub fn get(&self, key: &str) -> Option<Entity> {
        let now = self.clock.now();
        self.records
            .read()
            .get(key)
            .filter(|r| !self.is_expired(r, now))
            .map(|r| r.entity.clone())
    }

    /// Returns the unexpired records matching the query predicate, in key
    /// order.
    pub fn find_records(&self, query: &Query) -> Vec<CacheRecord> {
        let now = self.clock.now();
        self.records
            .read()
            .values()
            .filter(|r| !self.is_expired(r, now) && query.matches(&r.entity))
            .cloned()
            .collect()
    }

    /// Evaluates the query against unexpired records.
    pub fn find(&self, query: &Query) -> Vec<Entity> {
        let matched = self.find_records(&query.scope());
        query.apply(matched.into_iter().map(|r| r.entity))
    }

    /// Number of unexpired records matching the query predicate.
    pub fn count(&self, query: &Query) -> usize {
        let now = self.clock.now();
        self.records
            .read()
            .values()
            .filter(|r| !self.is_expired(r, now) && query.matches(&r.entity))
            .count()
    }

    /// Removes every record matching the query predicate, expired or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn delete(&self, query: &Query) -> CoreResult<usize> {
        let keys: Vec<String> = self
            .records
            .read()
            .values()
            .filter(|r| query.matches(&r.entity))
            .map(|r| r.key.clone())
            .collect();
        self.delete_keys(&keys)
    }

    /// Removes the records stored under `keys`. Unknown keys are ignored.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn delete_keys<S: AsRef<str>>(&self, keys: &[S]) -> CoreResult<usize> {
        let present: Vec<String> = {
            let records = self.records.read();
            keys.iter()
                .map(AsRef::as_ref)
                .filter(|k| records.contains_key(*k))
                .map(str::to_string)
                .collect()
        };
        if present.is_empty() {
            return Ok(0);
        }
        let removed = present.len();
        self.commit(JournalEntry::Batch {
            remove: present,
            upsert: Vec::new(),
        })?;
        Ok(removed)
    }

    /// Removes the records matching `query`, or everything when `query` is
    /// `None` or has no predicate.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn clear(&self, query: Option<&Query>) -> CoreResult<usize> {
        match query {
            Some(query) if query.predicate.is_some() => self.delete(query),
            _ => {
                let removed = self.len();
                self.commit(JournalEntry::Clear)?;
                Ok(removed)
            }
        }
    }

    /// Physically removes expired records.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal write fails.
    pub fn evict_expired(&self) -> CoreResult<usize> {
        let now = self.clock.now();
        let expired: Vec<String> = self
            .records
            .read()
            .values()
            .filter(|r| self.is_expired(r, now))
            .map(|r| r.key.clone())
            .collect();
        let evicted = self.delete_keys(&expired)?;
        if evicted > 0 {
            debug!(collection = %self.collection, evicted, "evicted expired records");
        }
        Ok(evicted)
    }

    /// Maps id to last-modified time for unexpired, non-temporary records
    /// matching the query predicate.
    pub fn lmt_index(&self, query: &Query) -> BTreeMap<String, Option<DateTime<Utc>>> {
        self.find_records(query)
            .into_iter()
            .filter(|r| !r.is_temporary())
            .map(|r| (r.key, r.entity.lmt()))
            .collect()
    }

    /// Evaluates an aggregation over unexpired records.
    pub fn aggregate(&self, spec: &AggregateSpec) -> Vec<Value> {
        let entities: Vec<Entity> = self
            .find_records(&Query::new())
            .into_iter()
            .map(|r| r.entity)
            .collect();
        aggregate(spec, &entities)
    }
}

fn replay_entry(records: &mut BTreeMap<String, CacheRecord>, entry: JournalEntry) {
    match entry {
        JournalEntry::Batch { remove, upsert } => {
            for key in remove {
                records.remove(&key);
            }
            for record in upsert {
                records.insert(record.key.clone(), record);
            }
        }
        JournalEntry::Clear => records.clear(),
    }
}
