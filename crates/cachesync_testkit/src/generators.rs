//! Property-based test generators using proptest.
//!
//! Provides strategies for entities, local mutation sequences and delta-set
//! inputs.

use cachesync_core::{Entity, ManifestEntry};
use chrono::{DateTime, TimeZone, Utc};
use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeMap;

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}").expect("Invalid regex")
}

/// Strategy for scalar field values.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        Just(Value::Null),
        any::<bool>().prop_map(Value::from),
        any::<i64>().prop_map(Value::from),
        "[a-zA-Z0-9 ]{0,16}".prop_map(Value::from),
    ]
}

/// Strategy for entities without an id. Field names never start with `_`.
pub fn entity_strategy() -> impl Strategy<Value = Entity> {
    prop::collection::btree_map("[a-z][a-z0-9]{0,7}", field_value_strategy(), 1..5).prop_map(
        |fields| {
            fields
                .into_iter()
                .fold(Entity::new(), |entity, (name, value)| entity.field(name, value))
        },
    )
}

/// Strategy for entities with an id.
pub fn identified_entity_strategy() -> impl Strategy<Value = Entity> {
    ("[a-z0-9]{8}", entity_strategy()).prop_map(|(id, mut entity)| {
        entity.id = Some(id);
        entity
    })
}

fn timestamp(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000 + seconds, 0)
        .single()
        .unwrap_or_default()
}

/// Strategy for delta-set inputs: cached last-modified times and a remote
/// manifest drawn from an overlapping id pool. Either side may miss an lmt.
pub fn delta_input_strategy(
) -> impl Strategy<Value = (BTreeMap<String, Option<DateTime<Utc>>>, Vec<ManifestEntry>)> {
    let id = (0u8..40).prop_map(|n| format!("id-{n:02}"));
    let lmt = prop::option::weighted(0.9, (0i64..100).prop_map(timestamp));
    (
        prop::collection::btree_map(id.clone(), lmt.clone(), 0..30),
        prop::collection::vec(
            (id, lmt).prop_map(|(id, lmt)| ManifestEntry::new(id, lmt)),
            0..30,
        ),
    )
}

/// A local mutation applied through a data store.
#[derive(Debug, Clone)]
pub enum LocalOp {
    /// Save a new entity.
    SaveNew(Entity),
    /// Save again the n-th known record (modulo the number of records).
    Update {
        /// Record selector.
        index: usize,
        /// Value written to the `rev` field.
        rev: i64,
    },
    /// Remove the n-th known record (modulo the number of records).
    Remove {
        /// Record selector.
        index: usize,
    },
}

/// Strategy for local mutations.
pub fn local_op_strategy() -> impl Strategy<Value = LocalOp> {
    prop_oneof![
        3 => entity_strategy().prop_map(LocalOp::SaveNew),
        2 => (any::<usize>(), any::<i64>()).prop_map(|(index, rev)| LocalOp::Update { index, rev }),
        1 => any::<usize>().prop_map(|index| LocalOp::Remove { index }),
    ]
}

/// Strategy for a sequence of local mutations.
pub fn local_op_sequence_strategy(
    min_ops: usize,
    max_ops: usize,
) -> impl Strategy<Value = Vec<LocalOp>> {
    prop::collection::vec(local_op_strategy(), min_ops..max_ops)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
