//! In-process reference collection.
//!
//! [`MemoryRemote`] behaves like a backend collection endpoint: it assigns
//! ids, stamps `_kmd.lmt` / `_kmd.ect` on every write, enforces the
//! multi-insert limits and records every request it serves. Faults can be
//! injected to exercise the failure paths of the reconciliation controller.

use crate::client::RemoteCollection;
use crate::error::{RemoteError, RemoteResult};
use crate::wire::{ItemError, MultiSaveResult, MAX_MULTI_INSERT};
use cachesync_core::{aggregate, AggregateSpec, Clock, Entity, Metadata, Predicate, Query, SystemClock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// Lowest API version that accepts multi-insert requests.
pub const MIN_MULTI_INSERT_API_VERSION: u32 = 5;

/// Duplicate key error code reported for conflicting creates.
const DUPLICATE_KEY: i64 = 11000;

/// Kind of request served by a [`MemoryRemote`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// `query`
    Query,
    /// `get`
    Get,
    /// `count`
    Count,
    /// `create`
    Create,
    /// `create_many`
    CreateMany,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `aggregate`
    Aggregate,
}

/// One served request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestRecord {
    /// Request kind.
    pub kind: RequestKind,
    /// Query of query, count and delete requests.
    pub query: Option<Query>,
    /// Ids addressed by get and update requests.
    pub id: Option<String>,
    /// Number of entities in a create or multi-insert body.
    pub batch_size: usize,
}

#[derive(Debug)]
struct Faults {
    queued: VecDeque<RemoteError>,
    on_request: BTreeMap<usize, RemoteError>,
    rejections: Vec<(Predicate, String)>,
    strip_metadata: bool,
    latency: Option<Duration>,
    api_version: u32,
}

impl Default for Faults {
    fn default() -> Self {
        Self {
            queued: VecDeque::new(),
            on_request: BTreeMap::new(),
            rejections: Vec::new(),
            strip_metadata: false,
            latency: None,
            api_version: MIN_MULTI_INSERT_API_VERSION,
        }
    }
}

/// An in-memory [`RemoteCollection`].
pub struct MemoryRemote {
    name: String,
    clock: Arc<dyn Clock>,
    records: RwLock<BTreeMap<String, Entity>>,
    requests: RwLock<Vec<RequestRecord>>,
    faults: Mutex<Faults>,
    last_stamp: Mutex<Option<DateTime<Utc>>>,
}

impl std::fmt::Debug for MemoryRemote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRemote")
            .field("name", &self.name)
            .field("records", &self.records.read().len())
            .field("requests", &self.requests.read().len())
            .finish()
    }
}

impl MemoryRemote {
    /// Creates an empty collection using the system clock.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_clock(name, Arc::new(SystemClock))
    }

    /// Creates an empty collection stamping writes with `clock`.
    pub fn with_clock(name: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            clock,
            records: RwLock::new(BTreeMap::new()),
            requests: RwLock::new(Vec::new()),
            faults: Mutex::new(Faults::default()),
            last_stamp: Mutex::new(None),
        }
    }

    // Server-side state, not visible in the request log.

    /// Stores entities as if another client had created them. Entities
    /// without an id get one; all get fresh timestamps.
    pub fn seed(&self, entities: impl IntoIterator<Item = Entity>) -> Vec<String> {
        let mut records = self.records.write();
        entities
            .into_iter()
            .map(|mut entity| {
                let id = entity.id.clone().unwrap_or_else(new_id);
                entity.id = Some(id.clone());
                entity.metadata = Some(Metadata::created_at(self.stamp()));
                records.insert(id.clone(), entity);
                id
            })
            .collect()
    }

    /// Modifies a stored entity as if another client had updated it.
    /// Returns false when the id is unknown.
    pub fn touch(&self, id: &str, field: &str, value: impl Into<Value>) -> bool {
        let mut records = self.records.write();
        let Some(entity) = records.get_mut(id) else {
            return false;
        };
        entity.set(field, value);
        let stamp = self.stamp();
        entity.metadata.get_or_insert_with(Metadata::default).lmt = Some(stamp);
        true
    }

    /// Removes a stored entity as if another client had deleted it.
    pub fn remove_raw(&self, id: &str) -> bool {
        self.records.write().remove(id).is_some()
    }

    /// The stored copy of an entity.
    pub fn stored(&self, id: &str) -> Option<Entity> {
        self.records.read().get(id).cloned()
    }

    /// Number of stored entities.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// True when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    // Request log.

    /// Every request served so far.
    pub fn requests(&self) -> Vec<RequestRecord> {
        self.requests.read().clone()
    }

    /// Number of requests served so far.
    pub fn request_count(&self) -> usize {
        self.requests.read().len()
    }

    /// Number of requests of one kind.
    pub fn count_of(&self, kind: RequestKind) -> usize {
        self.requests.read().iter().filter(|r| r.kind == kind).count()
    }

    /// Forgets the request log.
    pub fn clear_requests(&self) {
        self.requests.write().clear();
    }

    // Fault injection.

    /// Fails the next request with `error`. Calls queue up.
    pub fn fail_next(&self, error: RemoteError) {
        self.faults.lock().queued.push_back(error);
    }

    /// Fails the `n`-th request from now (1-based) with `error`.
    pub fn fail_request(&self, n: usize, error: RemoteError) {
        let served = self.request_count();
        self.faults.lock().on_request.insert(served + n, error);
    }

    /// Rejects multi-insert items matching `predicate` with `message`.
    pub fn reject_where(&self, predicate: Predicate, message: impl Into<String>) {
        self.faults.lock().rejections.push((predicate, message.into()));
    }

    /// Omits `_kmd` from every returned entity.
    pub fn set_strip_metadata(&self, value: bool) {
        self.faults.lock().strip_metadata = value;
    }

    /// Delays every request.
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Sets the API version; multi-insert requires
    /// [`MIN_MULTI_INSERT_API_VERSION`].
    pub fn set_api_version(&self, version: u32) {
        self.faults.lock().api_version = version;
    }

    /// Clears every injected fault.
    pub fn reset_faults(&self) {
        *self.faults.lock() = Faults::default();
    }

    fn begin(
        &self,
        kind: RequestKind,
        query: Option<&Query>,
        id: Option<&str>,
        batch_size: usize,
    ) -> RemoteResult<()> {
        let number = {
            let mut requests = self.requests.write();
            requests.push(RequestRecord {
                kind,
                query: query.cloned(),
                id: id.map(str::to_string),
                batch_size,
            });
            requests.len()
        };
        debug!(collection = %self.name, ?kind, number, batch_size, "remote request");

        let (latency, fault) = {
            let mut faults = self.faults.lock();
            let fault = faults
                .on_request
                .remove(&number)
                .or_else(|| faults.queued.pop_front());
            (faults.latency, fault)
        };
        if let Some(latency) = latency {
            std::thread::sleep(latency);
        }
        match fault {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn stamp(&self) -> DateTime<Utc> {
        let mut last = self.last_stamp.lock();
        let mut now = self.clock.now();
        if let Some(previous) = *last {
            if now <= previous {
                now = previous + ChronoDuration::milliseconds(1);
            }
        }
        *last = Some(now);
        now
    }

    fn respond(&self, mut entity: Entity) -> Entity {
        if self.faults.lock().strip_metadata {
            entity.metadata = None;
        }
        entity
    }

    fn insert_new(&self, records: &mut BTreeMap<String, Entity>, entity: &Entity) -> Result<Entity, String> {
        let id = entity.id.clone().unwrap_or_else(new_id);
        if records.contains_key(&id) {
            return Err(format!("E11000 duplicate key error: _id {id}"));
        }
        let mut stored = entity.clone();
        stored.id = Some(id.clone());
        stored.metadata = Some(Metadata::created_at(self.stamp()));
        records.insert(id, stored.clone());
        Ok(stored)
    }
}

fn new_id() -> String {
    Uuid::new_v4().simple().to_string()
}

impl RemoteCollection for MemoryRemote {
    fn name(&self) -> &str {
        &self.name
    }

    fn query(&self, query: &Query) -> RemoteResult<Vec<Entity>> {
        self.begin(RequestKind::Query, Some(query), None, 0)?;
        let all: Vec<Entity> = self.records.read().values().cloned().collect();
        Ok(query
            .apply(all)
            .into_iter()
            .map(|e| self.respond(e))
            .collect())
    }

    fn get(&self, id: &str) -> RemoteResult<Entity> {
        self.begin(RequestKind::Get, None, Some(id), 0)?;
        let found = self.records.read().get(id).cloned();
        found
            .map(|e| self.respond(e))
            .ok_or_else(|| RemoteError::not_found(id))
    }

    fn count(&self, query: &Query) -> RemoteResult<usize> {
        self.begin(RequestKind::Count, Some(query), None, 0)?;
        Ok(self
            .records
            .read()
            .values()
            .filter(|e| query.matches(e))
            .count())
    }

    fn create(&self, entity: &Entity) -> RemoteResult<Entity> {
        self.begin(RequestKind::Create, None, entity.id.as_deref(), 1)?;
        let mut records = self.records.write();
        let stored = self
            .insert_new(&mut records, entity)
            .map_err(|message| RemoteError::Server {
                status: 409,
                error: "DuplicateKey".to_string(),
                description: Some(message),
                debug: None,
            })?;
        Ok(self.respond(stored))
    }

    fn create_many(&self, entities: &[Entity]) -> RemoteResult<MultiSaveResult> {
        self.begin(RequestKind::CreateMany, None, None, entities.len())?;
        if entities.is_empty() {
            return Err(RemoteError::EmptyBatch);
        }
        let (api_version, rejections) = {
            let faults = self.faults.lock();
            (faults.api_version, faults.rejections.clone())
        };
        if api_version < MIN_MULTI_INSERT_API_VERSION {
            return Err(RemoteError::FeatureUnavailable {
                description: "Requested functionality is unavailable in this API version."
                    .to_string(),
            });
        }
        if entities.len() > MAX_MULTI_INSERT {
            return Err(RemoteError::bad_request(format!(
                "a multi-insert accepts at most {MAX_MULTI_INSERT} entities, got {}",
                entities.len()
            )));
        }

        let mut result = MultiSaveResult::default();
        let mut records = self.records.write();
        for (index, entity) in entities.iter().enumerate() {
            if let Some((_, message)) = rejections.iter().find(|(p, _)| p.matches(entity)) {
                result.entities.push(None);
                result.errors.push(ItemError {
                    index,
                    code: None,
                    message: message.clone(),
                    description: None,
                    debug: None,
                });
                continue;
            }
            match self.insert_new(&mut records, entity) {
                Ok(stored) => result.entities.push(Some(stored)),
                Err(message) => {
                    result.entities.push(None);
                    result.errors.push(ItemError {
                        index,
                        code: Some(DUPLICATE_KEY),
                        message,
                        description: None,
                        debug: None,
                    });
                }
            }
        }
        drop(records);

        result.entities = result
            .entities
            .into_iter()
            .map(|slot| slot.map(|e| self.respond(e)))
            .collect();
        Ok(result)
    }

    fn update(&self, entity: &Entity) -> RemoteResult<Entity> {
        self.begin(RequestKind::Update, None, entity.id.as_deref(), 1)?;
        let Some(id) = entity.id.clone() else {
            return Err(RemoteError::bad_request("update requires an _id"));
        };
        let mut records = self.records.write();
        let ect = records.get(&id).and_then(Entity::ect);
        let lmt = self.stamp();

        let mut stored = entity.clone();
        stored.metadata = Some(Metadata {
            lmt: Some(lmt),
            ect: Some(ect.unwrap_or(lmt)),
        });
        records.insert(id, stored.clone());
        Ok(self.respond(stored))
    }

    fn delete(&self, query: &Query) -> RemoteResult<usize> {
        self.begin(RequestKind::Delete, Some(query), None, 0)?;
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|_, e| !query.matches(e));
        Ok(before - records.len())
    }

    fn aggregate(&self, spec: &AggregateSpec) -> RemoteResult<Vec<Value>> {
        self.begin(RequestKind::Aggregate, None, None, 0)?;
        let all: Vec<Entity> = self.records.read().values().cloned().collect();
        Ok(aggregate(spec, &all))
    }
}
