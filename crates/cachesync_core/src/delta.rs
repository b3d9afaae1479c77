//! Delta-set computation.
//!
//! A pull with delta-set enabled first fetches a manifest: every remote
//! record of the query scope projected to `_id` and `_kmd.lmt`. Comparing it
//! with the cached last-modified times tells which records must be fetched in
//! full and which cached records no longer exist remotely.

use crate::entity::Entity;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashSet};

/// One row of a remote manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// Record id.
    pub id: String,
    /// Remote last-modified time, when reported.
    pub lmt: Option<DateTime<Utc>>,
}

impl ManifestEntry {
    /// Creates an entry.
    pub fn new(id: impl Into<String>, lmt: Option<DateTime<Utc>>) -> Self {
        Self { id: id.into(), lmt }
    }

    /// Reads an entry from a projected entity. Entities without an id are
    /// skipped.
    pub fn from_entity(entity: &Entity) -> Option<Self> {
        Some(Self {
            id: entity.id.clone()?,
            lmt: entity.lmt(),
        })
    }
}

/// Classification of a manifest against the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaSet {
    /// Remote ids missing from the cache, in manifest order.
    pub created: Vec<String>,
    /// Remote ids newer than the cached copy, in manifest order.
    pub updated: Vec<String>,
    /// Cached ids absent from the manifest, sorted.
    pub deleted: Vec<String>,
    /// Number of manifest entries that need no fetch.
    pub unchanged: usize,
}

impl DeltaSet {
    /// True when nothing has to be fetched or removed.
    pub fn is_empty(&self) -> bool {
        self.created.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    /// Ids whose full payload must be fetched, in manifest order.
    pub fn fetch_ids(&self) -> Vec<String> {
        self.created.iter().chain(&self.updated).cloned().collect()
    }

    /// [`Self::fetch_ids`] split into pages of at most `page_size` ids.
    ///
    /// A page size of zero is treated as one.
    pub fn fetch_chunks(&self, page_size: usize) -> Vec<Vec<String>> {
        self.fetch_ids()
            .chunks(page_size.max(1))
            .map(<[String]>::to_vec)
            .collect()
    }
}

/// Classifies `manifest` against cached last-modified times.
///
/// - id absent from the cache: created
/// - remote lmt strictly newer than the cached one: updated
/// - lmt missing on either side: fetched again (created or updated)
/// - cached id absent from the manifest: deleted
///
/// Duplicate manifest ids are ignored after the first. `created` and
/// `updated` together with `fetch_ids` preserve manifest order, so callers
/// can reassemble fetched pages in that order.
pub fn compute_delta_set(
    cached: &BTreeMap<String, Option<DateTime<Utc>>>,
    manifest: &[ManifestEntry],
) -> DeltaSet {
    let mut delta = DeltaSet::default();
    let mut seen: HashSet<&str> = HashSet::with_capacity(manifest.len());

    for entry in manifest {
        if !seen.insert(entry.id.as_str()) {
            continue;
        }
        match cached.get(&entry.id) {
            None => delta.created.push(entry.id.clone()),
            Some(cached_lmt) => match (entry.lmt, cached_lmt) {
                (Some(remote), Some(local)) if remote <= *local => delta.unchanged += 1,
                _ => delta.updated.push(entry.id.clone()),
            },
        }
    }

    delta.deleted = cached
        .keys()
        .filter(|id| !seen.contains(id.as_str()))
        .cloned()
        .collect();
    delta
}
