//! Query model.
//!
//! A [`Query`] is a predicate plus sort / skip / limit / field selection. The
//! same value is evaluated against the local cache and handed to the remote
//! collection client, which owns its translation to a wire format.

use crate::entity::{Entity, ID_KEY};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// A boolean condition over entity fields.
///
/// Field names are dotted paths resolved by [`Entity::lookup`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Predicate {
    /// Field equals the value. An array field matches when it contains it.
    Eq(String, Value),
    /// Field does not equal the value (missing fields match).
    Ne(String, Value),
    /// Field is strictly greater than the value.
    Gt(String, Value),
    /// Field is greater than or equal to the value.
    Gte(String, Value),
    /// Field is strictly less than the value.
    Lt(String, Value),
    /// Field is less than or equal to the value.
    Lte(String, Value),
    /// Field equals one of the values.
    In(String, Vec<Value>),
    /// Field is present (`true`) or absent (`false`).
    Exists(String, bool),
    /// All conditions hold.
    And(Vec<Predicate>),
    /// At least one condition holds.
    Or(Vec<Predicate>),
    /// The condition does not hold.
    Not(Box<Predicate>),
}

impl Predicate {
    /// `field == value`
    pub fn eq(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Eq(field.into(), value.into())
    }

    /// `field != value`
    pub fn ne(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Ne(field.into(), value.into())
    }

    /// `field > value`
    pub fn gt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gt(field.into(), value.into())
    }

    /// `field >= value`
    pub fn gte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Gte(field.into(), value.into())
    }

    /// `field < value`
    pub fn lt(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lt(field.into(), value.into())
    }

    /// `field <= value`
    pub fn lte(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::Lte(field.into(), value.into())
    }

    /// `field IN values`
    pub fn is_in<I, V>(field: impl Into<String>, values: I) -> Self
    where
        I: IntoIterator<Item = V>,
        V: Into<Value>,
    {
        Self::In(field.into(), values.into_iter().map(Into::into).collect())
    }

    /// Conjunction of `self` and `other`.
    #[must_use]
    pub fn and(self, other: Predicate) -> Self {
        match self {
            Self::And(mut all) => {
                all.push(other);
                Self::And(all)
            }
            first => Self::And(vec![first, other]),
        }
    }

    /// Disjunction of `self` and `other`.
    #[must_use]
    pub fn or(self, other: Predicate) -> Self {
        match self {
            Self::Or(mut any) => {
                any.push(other);
                Self::Or(any)
            }
            first => Self::Or(vec![first, other]),
        }
    }

    /// Negation.
    #[must_use]
    pub fn negate(self) -> Self {
        Self::Not(Box::new(self))
    }

    /// Evaluates the predicate against an entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        match self {
            Self::Eq(field, expected) => match entity.lookup(field) {
                Some(Value::Array(items)) if !expected.is_array() => {
                    items.iter().any(|item| values_equal(item, expected))
                }
                Some(actual) => values_equal(&actual, expected),
                None => expected.is_null(),
            },
            Self::Ne(field, expected) => !Self::Eq(field.clone(), expected.clone()).matches(entity),
            Self::Gt(field, bound) => compare_field(entity, field, bound) == Some(Ordering::Greater),
            Self::Gte(field, bound) => matches!(
                compare_field(entity, field, bound),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            Self::Lt(field, bound) => compare_field(entity, field, bound) == Some(Ordering::Less),
            Self::Lte(field, bound) => matches!(
                compare_field(entity, field, bound),
                Some(Ordering::Less | Ordering::Equal)
            ),
            Self::In(field, candidates) => match entity.lookup(field) {
                Some(Value::Array(items)) => items
                    .iter()
                    .any(|item| candidates.iter().any(|c| values_equal(item, c))),
                Some(actual) => candidates.iter().any(|c| values_equal(&actual, c)),
                None => false,
            },
            Self::Exists(field, should_exist) => entity.lookup(field).is_some() == *should_exist,
            Self::And(all) => all.iter().all(|p| p.matches(entity)),
            Self::Or(any) => any.iter().any(|p| p.matches(entity)),
            Self::Not(inner) => !inner.matches(entity),
        }
    }
}

fn compare_field(entity: &Entity, field: &str, bound: &Value) -> Option<Ordering> {
    let actual = entity.lookup(field)?;
    if type_rank(&actual) != type_rank(bound) {
        return None;
    }
    Some(compare_values(&actual, bound))
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values used for sorting.
///
/// Values of different types order by type: null, bool, number, string,
/// array, object. RFC 3339 timestamps in the same format order correctly as
/// strings.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (left, right) in x.iter().zip(y) {
                let ord = compare_values(left, right);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => x.len().cmp(&y.len()),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortOrder {
    /// Smallest first; missing values first.
    Ascending,
    /// Largest first; missing values last.
    Descending,
}

/// One sort criterion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    /// Dotted field path.
    pub field: String,
    /// Direction.
    pub order: SortOrder,
}

/// A predicate with sort, paging and field selection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Query {
    /// Filter; `None` matches everything.
    pub predicate: Option<Predicate>,
    /// Sort criteria, most significant first.
    pub sort: Vec<SortKey>,
    /// Number of matches to skip.
    pub skip: Option<usize>,
    /// Maximum number of results.
    pub limit: Option<usize>,
    /// Fields to return; `None` returns whole entities.
    pub fields: Option<BTreeSet<String>>,
}

impl Query {
    /// A query matching every entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// A query with the given predicate.
    pub fn filter(predicate: Predicate) -> Self {
        Self {
            predicate: Some(predicate),
            ..Self::default()
        }
    }

    /// Matches a single id.
    pub fn by_id(id: impl Into<String>) -> Self {
        Self::filter(Predicate::eq(ID_KEY, id.into()))
    }

    /// Matches any of the ids.
    pub fn by_ids<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::filter(Predicate::is_in(
            ID_KEY,
            ids.into_iter().map(|id| Value::String(id.into())),
        ))
    }

    /// Adds an ascending sort key.
    #[must_use]
    pub fn ascending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order: SortOrder::Ascending,
        });
        self
    }

    /// Adds a descending sort key.
    #[must_use]
    pub fn descending(mut self, field: impl Into<String>) -> Self {
        self.sort.push(SortKey {
            field: field.into(),
            order: SortOrder::Descending,
        });
        self
    }

    /// Sets the number of matches to skip.
    #[must_use]
    pub fn with_skip(mut self, skip: usize) -> Self {
        self.skip = Some(skip);
        self
    }

    /// Sets the maximum number of results.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Restricts the returned fields.
    #[must_use]
    pub fn select<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.fields = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// True when skip or limit is set.
    pub fn is_paged(&self) -> bool {
        self.skip.is_some() || self.limit.is_some()
    }

    /// The same filter without sort, paging or field selection.
    ///
    /// This is the set of records a pull over this query is responsible for.
    #[must_use]
    pub fn scope(&self) -> Self {
        Self {
            predicate: self.predicate.clone(),
            ..Self::default()
        }
    }

    /// True when the predicate matches the entity.
    pub fn matches(&self, entity: &Entity) -> bool {
        self.predicate.as_ref().map_or(true, |p| p.matches(entity))
    }

    /// Sorts entities in place by the sort keys.
    pub fn sort_entities(&self, entities: &mut [Entity]) {
        if self.sort.is_empty() {
            return;
        }
        entities.sort_by(|a, b| {
            for key in &self.sort {
                let ord = match (a.lookup(&key.field), b.lookup(&key.field)) {
                    (Some(x), Some(y)) => compare_values(&x, &y),
                    (None, Some(_)) => Ordering::Less,
                    (Some(_), None) => Ordering::Greater,
                    (None, None) => Ordering::Equal,
                };
                let ord = match key.order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    /// Filters, sorts, pages and projects a set of entities.
    pub fn apply<I>(&self, entities: I) -> Vec<Entity>
    where
        I: IntoIterator<Item = Entity>,
    {
        let mut matched: Vec<Entity> = entities.into_iter().filter(|e| self.matches(e)).collect();
        self.sort_entities(&mut matched);

        let skip = self.skip.unwrap_or(0);
        let limit = self.limit.unwrap_or(usize::MAX);
        let paged = matched.into_iter().skip(skip).take(limit);

        match &self.fields {
            Some(fields) => paged.map(|e| e.project(fields)).collect(),
            None => paged.collect(),
        }
    }
}
