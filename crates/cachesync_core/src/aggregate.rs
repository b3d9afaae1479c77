//! Grouped reductions over entities.

use crate::entity::Entity;
use crate::query::{compare_values, Predicate};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;

/// Name of the output field holding the reduced value.
pub const RESULT_KEY: &str = "result";

/// Reduce function applied to each group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reduce {
    /// Number of entities in the group.
    Count,
    /// Sum of a numeric field.
    Sum(String),
    /// Smallest value of a field.
    Min(String),
    /// Largest value of a field.
    Max(String),
    /// Mean of a numeric field.
    Average(String),
}

/// A grouping request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateSpec {
    /// Fields whose values form the group key.
    pub keys: Vec<String>,
    /// Reduce function.
    pub reduce: Reduce,
    /// Only entities matching the condition take part.
    pub condition: Option<Predicate>,
}

impl AggregateSpec {
    /// Groups by `keys` and applies `reduce`.
    pub fn new<I, S>(keys: I, reduce: Reduce) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            keys: keys.into_iter().map(Into::into).collect(),
            reduce,
            condition: None,
        }
    }

    /// Restricts the input set.
    #[must_use]
    pub fn with_condition(mut self, condition: Predicate) -> Self {
        self.condition = Some(condition);
        self
    }
}

#[derive(Default)]
struct Accumulator {
    count: u64,
    sum: f64,
    numeric: u64,
    extreme: Option<Value>,
}

/// Evaluates `spec` over `entities`.
///
/// Each output object carries the group key fields plus [`RESULT_KEY`].
/// Groups appear in order of first appearance. Entities missing a group key
/// are grouped under `null` for that key.
pub fn aggregate(spec: &AggregateSpec, entities: &[Entity]) -> Vec<Value> {
    let mut groups: Vec<(Vec<Value>, Accumulator)> = Vec::new();

    for entity in entities {
        if let Some(condition) = &spec.condition {
            if !condition.matches(entity) {
                continue;
            }
        }

        let key: Vec<Value> = spec
            .keys
            .iter()
            .map(|k| entity.lookup(k).unwrap_or(Value::Null))
            .collect();

        let slot = match groups.iter().position(|(k, _)| *k == key) {
            Some(i) => i,
            None => {
                groups.push((key, Accumulator::default()));
                groups.len() - 1
            }
        };
        let acc = &mut groups[slot].1;
        acc.count += 1;

        match &spec.reduce {
            Reduce::Count => {}
            Reduce::Sum(field) | Reduce::Average(field) => {
                if let Some(n) = entity.lookup(field).as_ref().and_then(Value::as_f64) {
                    acc.sum += n;
                    acc.numeric += 1;
                }
            }
            Reduce::Min(field) | Reduce::Max(field) => {
                let Some(value) = entity.lookup(field) else {
                    continue;
                };
                let wanted = if matches!(spec.reduce, Reduce::Min(_)) {
                    Ordering::Less
                } else {
                    Ordering::Greater
                };
                let replace = acc
                    .extreme
                    .as_ref()
                    .map_or(true, |current| compare_values(&value, current) == wanted);
                if replace {
                    acc.extreme = Some(value);
                }
            }
        }
    }

    groups
        .into_iter()
        .map(|(key, acc)| {
            let mut out = Map::new();
            for (name, value) in spec.keys.iter().zip(key) {
                out.insert(name.clone(), value);
            }
            let result = match &spec.reduce {
                Reduce::Count => Value::from(acc.count),
                Reduce::Sum(_) => number(acc.sum),
                Reduce::Average(_) if acc.numeric == 0 => Value::Null,
                Reduce::Average(_) => number(acc.sum / acc.numeric as f64),
                Reduce::Min(_) | Reduce::Max(_) => acc.extreme.unwrap_or(Value::Null),
            };
            out.insert(RESULT_KEY.to_string(), result);
            Value::Object(out)
        })
        .collect()
}

fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        Number::from_f64(n).map_or(Value::Null, Value::Number)
    }
}
