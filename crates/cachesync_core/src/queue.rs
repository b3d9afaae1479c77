//! Pending-operation log.
//!
//! Local mutations become [`PendingOperation`]s through the pure coalescing
//! function [`append_mutation`]. [`SyncQueue`] holds the result in FIFO order
//! and persists a full snapshot on every change.
//!
//! Coalescing rules:
//!
//! | Mutation | Effect |
//! |----------|--------|
//! | save, no id, key already batched | snapshot replaced in place |
//! | save, no id | appended to the trailing `BatchCreate`, or a new one |
//! | save with id | earlier `UpsertById` for the id dropped, new one appended |
//! | delete | batched temporary keys dropped, `UpsertById`s for the ids dropped, remaining ids appended as one `Delete` |

use crate::cache::TEMP_KEY_PREFIX;
use crate::codec;
use crate::entity::Entity;
use crate::error::CoreResult;
use crate::query::Query;
use cachesync_storage::{InMemoryBackend, Journal, JournalBackend};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::{debug, warn};
use uuid::Uuid;

/// Remote verb a pending operation maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verb {
    /// Multi-insert of new entities.
    Create,
    /// Create or replace by id.
    Update,
    /// Delete by predicate.
    Delete,
}

/// An outstanding local mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PendingOperation {
    /// Entities without an id, created together.
    BatchCreate {
        /// Operation id.
        op_id: Uuid,
        /// Temporary cache keys, parallel to `entities`.
        keys: Vec<String>,
        /// Entity snapshots.
        entities: Vec<Entity>,
    },
    /// Create or update of an entity with a known id.
    UpsertById {
        /// Operation id.
        op_id: Uuid,
        /// Entity id.
        id: String,
        /// Entity snapshot.
        entity: Entity,
    },
    /// Remote delete of known ids.
    Delete {
        /// Operation id.
        op_id: Uuid,
        /// Ids to delete.
        ids: Vec<String>,
        /// Predicate sent to the remote.
        query: Query,
    },
}

impl PendingOperation {
    /// The operation id.
    pub fn op_id(&self) -> Uuid {
        match self {
            Self::BatchCreate { op_id, .. }
            | Self::UpsertById { op_id, .. }
            | Self::Delete { op_id, .. } => *op_id,
        }
    }

    /// The remote verb.
    pub fn verb(&self) -> Verb {
        match self {
            Self::BatchCreate { .. } => Verb::Create,
            Self::UpsertById { .. } => Verb::Update,
            Self::Delete { .. } => Verb::Delete,
        }
    }

    /// Number of entities the operation still covers.
    pub fn entity_count(&self) -> usize {
        match self {
            Self::BatchCreate { keys, .. } => keys.len(),
            Self::UpsertById { .. } => 1,
            Self::Delete { ids, .. } => ids.len(),
        }
    }

    /// Cache keys or ids the operation covers.
    pub fn keys(&self) -> Vec<String> {
        match self {
            Self::BatchCreate { keys, .. } => keys.clone(),
            Self::UpsertById { id, .. } => vec![id.clone()],
            Self::Delete { ids, .. } => ids.clone(),
        }
    }

    fn is_empty(&self) -> bool {
        self.entity_count() == 0
    }
}

/// A local mutation to record.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// An entity was saved under `key` (its id or a temporary key).
    Save {
        /// Cache key.
        key: String,
        /// Saved snapshot.
        entity: Entity,
    },
    /// Records were removed.
    Delete {
        /// Cache keys (ids or temporary keys).
        keys: Vec<String>,
    },
}

/// Folds one mutation into the pending operations.
pub fn append_mutation(mut ops: Vec<PendingOperation>, mutation: Mutation) -> Vec<PendingOperation> {
    match mutation {
        Mutation::Save { key, entity } => match entity.id.clone() {
            Some(id) => {
                ops.retain(|op| !matches!(op, PendingOperation::UpsertById { id: pending, .. } if *pending == id));
                ops.push(PendingOperation::UpsertById {
                    op_id: Uuid::new_v4(),
                    id,
                    entity,
                });
            }
            None => {
                let batched = ops.iter_mut().find_map(|op| match op {
                    PendingOperation::BatchCreate { keys, entities, .. } => keys
                        .iter()
                        .position(|k| *k == key)
                        .map(|i| &mut entities[i]),
                    _ => None,
                });
                if let Some(slot) = batched {
                    *slot = entity;
                } else if let Some(PendingOperation::BatchCreate { keys, entities, .. }) =
                    ops.last_mut()
                {
                    keys.push(key);
                    entities.push(entity);
                } else {
                    ops.push(PendingOperation::BatchCreate {
                        op_id: Uuid::new_v4(),
                        keys: vec![key],
                        entities: vec![entity],
                    });
                }
            }
        },
        Mutation::Delete { keys } => {
            let (temporary, ids): (Vec<String>, Vec<String>) =
                keys.into_iter().partition(|k| k.starts_with(TEMP_KEY_PREFIX));

            for op in &mut ops {
                match op {
                    PendingOperation::BatchCreate { keys, entities, .. } => {
                        let mut i = 0;
                        while i < keys.len() {
                            if temporary.contains(&keys[i]) {
                                keys.remove(i);
                                entities.remove(i);
                            } else {
                                i += 1;
                            }
                        }
                    }
                    PendingOperation::UpsertById { .. } | PendingOperation::Delete { .. } => {}
                }
            }
            ops.retain(|op| match op {
                PendingOperation::UpsertById { id, .. } => !ids.contains(id),
                other => !other.is_empty(),
            });

            let mut unique = Vec::with_capacity(ids.len());
            for id in ids {
                if !unique.contains(&id) {
                    unique.push(id);
                }
            }
            if !unique.is_empty() {
                ops.push(PendingOperation::Delete {
                    op_id: Uuid::new_v4(),
                    query: Query::by_ids(unique.iter().cloned()),
                    ids: unique,
                });
            }
        }
    }
    ops
}

/// Durable FIFO of pending operations for one collection.
pub struct SyncQueue {
    collection: String,
    ops: RwLock<Vec<PendingOperation>>,
    journal: Mutex<Journal>,
}

impl std::fmt::Debug for SyncQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncQueue")
            .field("collection", &self.collection)
            .field("operations", &self.ops.read().len())
            .finish()
    }
}

impl SyncQueue {
    /// Opens a queue over `backend`, restoring the last snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the journal is corrupted or the snapshot cannot be
    /// decoded.
    pub fn open(collection: impl Into<String>, backend: Box<dyn JournalBackend>) -> CoreResult<Self> {
        let collection = collection.into();
        let (journal, replay) = Journal::open(backend)?;
        if replay.discarded_bytes > 0 {
            warn!(
                collection = %collection,
                discarded_bytes = replay.discarded_bytes,
                "discarded torn queue journal tail"
            );
        }

        let ops: Vec<PendingOperation> = match replay.frames.last() {
            Some(frame) => codec::decode(frame)?,
            None => Vec::new(),
        };
        debug!(collection = %collection, operations = ops.len(), "opened sync queue");

        Ok(Self {
            collection,
            ops: RwLock::new(ops),
            journal: Mutex::new(journal),
        })
    }

    /// Opens an empty, non-durable queue.
    pub fn in_memory(collection: impl Into<String>) -> CoreResult<Self> {
        Self::open(collection, Box::new(InMemoryBackend::new()))
    }

    /// Name of the collection.
    pub fn collection(&self) -> &str {
        &self.collection
    }

    fn update<R>(&self, f: impl FnOnce(&mut Vec<PendingOperation>) -> R) -> CoreResult<R> {
        let mut ops = self.ops.write();
        let mut next = ops.clone();
        let result = f(&mut next);
        if next != *ops {
            self.journal.lock().rewrite(&[codec::encode(&next)?])?;
            *ops = next;
        }
        Ok(result)
    }

    /// Records a mutation.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn enqueue(&self, mutation: Mutation) -> CoreResult<()> {
        let pending = self.update(|ops| {
            *ops = append_mutation(std::mem::take(ops), mutation);
            ops.len()
        })?;
        debug!(collection = %self.collection, operations = pending, "enqueued mutation");
        Ok(())
    }

    /// Records several mutations with one snapshot write.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written; none of the
    /// mutations is recorded then.
    pub fn enqueue_all(&self, mutations: impl IntoIterator<Item = Mutation>) -> CoreResult<()> {
        let pending = self.update(|ops| {
            *ops = mutations.into_iter().fold(std::mem::take(ops), append_mutation);
            ops.len()
        })?;
        debug!(collection = %self.collection, operations = pending, "enqueued mutations");
        Ok(())
    }

    /// Number of outstanding entities. A batch of five counts five.
    pub fn pending_count(&self) -> usize {
        self.ops.read().iter().map(PendingOperation::entity_count).sum()
    }

    /// Snapshot of the operations in FIFO order.
    pub fn pending_operations(&self) -> Vec<PendingOperation> {
        self.ops.read().clone()
    }

    /// The operation with the given id, if still pending.
    pub fn operation(&self, op_id: Uuid) -> Option<PendingOperation> {
        self.ops.read().iter().find(|op| op.op_id() == op_id).cloned()
    }

    /// True when nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.ops.read().is_empty()
    }

    /// Keys and ids with pending operations.
    pub fn pending_keys(&self) -> BTreeSet<String> {
        self.ops.read().iter().flat_map(PendingOperation::keys).collect()
    }

    /// Removes the confirmed items of an operation and returns how many were
    /// removed. The operation disappears once empty; unconfirmed items stay.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn acknowledge<S: AsRef<str>>(&self, op_id: Uuid, confirmed: &[S]) -> CoreResult<usize> {
        let confirmed: BTreeSet<&str> = confirmed.iter().map(AsRef::as_ref).collect();
        self.update(|ops| {
            let Some(op) = ops.iter_mut().find(|op| op.op_id() == op_id) else {
                return 0;
            };
            let before = op.entity_count();
            let removed = match op {
                PendingOperation::BatchCreate { keys, entities, .. } => {
                    let pairs: Vec<(String, Entity)> = keys
                        .drain(..)
                        .zip(entities.drain(..))
                        .filter(|(k, _)| !confirmed.contains(k.as_str()))
                        .collect();
                    for (key, entity) in pairs {
                        keys.push(key);
                        entities.push(entity);
                    }
                    before - keys.len()
                }
                PendingOperation::UpsertById { id, .. } => usize::from(confirmed.contains(id.as_str())),
                PendingOperation::Delete { ids, query, .. } => {
                    ids.retain(|id| !confirmed.contains(id.as_str()));
                    *query = Query::by_ids(ids.iter().cloned());
                    before - ids.len()
                }
            };
            if removed == before {
                ops.retain(|op| op.op_id() != op_id);
            }
            removed
        })
    }

    /// Drops an operation. Returns whether it was pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn remove(&self, op_id: Uuid) -> CoreResult<bool> {
        self.update(|ops| {
            let before = ops.len();
            ops.retain(|op| op.op_id() != op_id);
            ops.len() != before
        })
    }

    /// Drops everything and returns the number of entities discarded.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be written.
    pub fn clear(&self) -> CoreResult<usize> {
        self.update(|ops| {
            let dropped = ops.iter().map(PendingOperation::entity_count).sum();
            ops.clear();
            dropped
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tmp(n: usize) -> String {
        format!("{TEMP_KEY_PREFIX}{n}")
    }

    fn save_new(ops: Vec<PendingOperation>, n: usize) -> Vec<PendingOperation> {
        append_mutation(
            ops,
            Mutation::Save {
                key: tmp(n),
                entity: Entity::new().field("n", n),
            },
        )
    }

    fn save_id(ops: Vec<PendingOperation>, id: &str, v: i64) -> Vec<PendingOperation> {
        append_mutation(
            ops,
            Mutation::Save {
                key: id.to_string(),
                entity: Entity::with_id(id).field("v", v),
            },
        )
    }

    fn delete(ops: Vec<PendingOperation>, keys: &[&str]) -> Vec<PendingOperation> {
        append_mutation(
            ops,
            Mutation::Delete {
                keys: keys.iter().map(|k| k.to_string()).collect(),
            },
        )
    }

    #[test]
    fn creates_coalesce_into_trailing_batch() {
        let ops = save_new(save_new(Vec::new(), 1), 2);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].keys(), vec![tmp(1), tmp(2)]);

        let ops = save_new(save_id(ops, "a", 1), 3);
        assert_eq!(ops.len(), 3);
        assert_eq!(ops[2].verb(), Verb::Create);
    }

    #[test]
    fn updating_a_batched_entity_replaces_in_place() {
        let ops = save_id(save_new(save_new(Vec::new(), 1), 2), "a", 1);
        let ops = append_mutation(
            ops,
            Mutation::Save {
                key: tmp(1),
                entity: Entity::new().field("n", 100),
            },
        );
        assert_eq!(ops.len(), 2);
        match &ops[0] {
            PendingOperation::BatchCreate { entities, .. } => {
                assert_eq!(entities[0].get("n"), Some(&serde_json::json!(100)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn upsert_replaces_older_upsert_and_moves_to_end() {
        let ops = save_id(save_id(save_id(Vec::new(), "a", 1), "b", 1), "a", 2);
        assert_eq!(ops.len(), 2);
        assert_eq!(ops[0].keys(), vec!["b".to_string()]);
        match &ops[1] {
            PendingOperation::UpsertById { id, entity, .. } => {
                assert_eq!(id, "a");
                assert_eq!(entity.get("v"), Some(&serde_json::json!(2)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn delete_of_unpushed_create_needs_no_remote_delete() {
        let ops = save_new(save_new(Vec::new(), 1), 2);
        let first = tmp(1);
        let ops = delete(ops, &[first.as_str()]);
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].keys(), vec![tmp(2)]);

        let second = tmp(2);
        let ops = delete(ops, &[second.as_str()]);
        assert!(ops.is_empty());
    }

    #[test]
    fn delete_drops_upserts_and_queues_remote_delete() {
        let ops = save_id(Vec::new(), "a", 1);
        let ops = delete(ops, &["a", "b", "a"]);
        assert_eq!(ops.len(), 1);
        match &ops[0] {
            PendingOperation::Delete { ids, query, .. } => {
                assert_eq!(ids, &vec!["a".to_string(), "b".to_string()]);
                assert!(query.matches(&Entity::with_id("b")));
                assert!(!query.matches(&Entity::with_id("c")));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn acknowledge_removes_confirmed_items_only() {
        let queue = SyncQueue::in_memory("books").unwrap();
        for n in 0..5 {
            queue
                .enqueue(Mutation::Save {
                    key: tmp(n),
                    entity: Entity::new(),
                })
                .unwrap();
        }
        let op_id = queue.pending_operations()[0].op_id();
        assert_eq!(queue.pending_count(), 5);

        let removed = queue.acknowledge(op_id, &[tmp(0), tmp(3), tmp(9)]).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(queue.pending_count(), 3);
        assert_eq!(
            queue.pending_keys().into_iter().collect::<Vec<_>>(),
            vec![tmp(1), tmp(2), tmp(4)]
        );

        queue.acknowledge(op_id, &[tmp(1), tmp(2), tmp(4)]).unwrap();
        assert!(queue.is_empty());
        assert!(queue.operation(op_id).is_none());
    }

    #[test]
    fn acknowledge_upsert_and_delete() {
        let queue = SyncQueue::in_memory("books").unwrap();
        queue
            .enqueue(Mutation::Save {
                key: "a".into(),
                entity: Entity::with_id("a"),
            })
            .unwrap();
        queue
            .enqueue(Mutation::Delete {
                keys: vec!["x".into(), "y".into()],
            })
            .unwrap();

        let ops = queue.pending_operations();
        assert_eq!(queue.acknowledge(ops[0].op_id(), &["a"]).unwrap(), 1);
        assert_eq!(queue.acknowledge(ops[1].op_id(), &["x"]).unwrap(), 1);
        assert_eq!(queue.pending_keys().into_iter().collect::<Vec<_>>(), vec!["y"]);
        assert!(queue.remove(ops[1].op_id()).unwrap());
        assert!(!queue.remove(ops[1].op_id()).unwrap());
        assert!(queue.is_empty());
    }

    #[test]
    fn queue_survives_reopen() {
        let backend = InMemoryBackend::new();
        {
            let queue = SyncQueue::open("books", Box::new(backend.clone())).unwrap();
            queue
                .enqueue(Mutation::Save {
                    key: tmp(1),
                    entity: Entity::new().field("title", "Dune"),
                })
                .unwrap();
            queue
                .enqueue(Mutation::Delete {
                    keys: vec!["gone".into()],
                })
                .unwrap();
        }

        let queue = SyncQueue::open("books", Box::new(backend.clone())).unwrap();
        assert_eq!(queue.pending_count(), 2);
        assert_eq!(queue.pending_operations()[1].verb(), Verb::Delete);

        assert_eq!(queue.clear().unwrap(), 2);
        let queue = SyncQueue::open("books", Box::new(backend)).unwrap();
        assert!(queue.is_empty());
    }

    #[test]
    fn enqueue_all_matches_one_by_one() {
        let mutations = vec![
            Mutation::Save { key: tmp(1), entity: Entity::new().field("n", 1) },
            Mutation::Save { key: tmp(2), entity: Entity::new().field("n", 2) },
            Mutation::Save { key: "a".into(), entity: Entity::with_id("a") },
            Mutation::Delete { keys: vec![tmp(1)] },
        ];
        let single = SyncQueue::in_memory("books").unwrap();
        for mutation in mutations.clone() {
            single.enqueue(mutation).unwrap();
        }
        let batched = SyncQueue::in_memory("books").unwrap();
        batched.enqueue_all(mutations).unwrap();

        let strip = |ops: Vec<PendingOperation>| -> Vec<Vec<String>> {
            ops.iter().map(PendingOperation::keys).collect()
        };
        assert_eq!(strip(batched.pending_operations()), strip(single.pending_operations()));
        assert_eq!(batched.pending_count(), 2);
    }

    proptest! {
        #[test]
        fn pending_count_is_conserved(n in 1usize..40, acked in proptest::collection::vec(any::<bool>(), 40)) {
            let queue = SyncQueue::in_memory("books").unwrap();
            for i in 0..n {
                queue.enqueue(Mutation::Save { key: tmp(i), entity: Entity::new() }).unwrap();
            }
            prop_assert_eq!(queue.pending_count(), n);

            let confirmed: Vec<String> = (0..n).filter(|i| acked[*i]).map(tmp).collect();
            let op_id = queue.pending_operations()[0].op_id();
            queue.acknowledge(op_id, &confirmed).unwrap();
            prop_assert_eq!(queue.pending_count(), n - confirmed.len());
        }
    }
}
