//! Benchmark utilities.

use cachesync_core::{Entity, ManifestEntry};
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;

/// Generate random payload bytes of the specified size.
pub fn random_data(size: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    (0..size).map(|_| rng.gen()).collect()
}

/// Generate new entities with a text field of roughly `payload_size` bytes.
pub fn generate_entities(count: usize, payload_size: usize) -> Vec<Entity> {
    let mut rng = rand::thread_rng();
    (0..count)
        .map(|i| {
            let text: String = (0..payload_size)
                .map(|_| rng.gen_range(b'a'..=b'z') as char)
                .collect();
            Entity::new().field("index", i).field("text", text)
        })
        .collect()
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
        .single()
        .unwrap_or_default()
}

/// A cached lmt index of `count` ids and a remote manifest in which
/// `changed` of them are newer, `deleted` are gone and `created` are new.
pub fn delta_fixture(
    count: usize,
    changed: usize,
    deleted: usize,
    created: usize,
) -> (BTreeMap<String, Option<DateTime<Utc>>>, Vec<ManifestEntry>) {
    let base = base_time();
    let ids: Vec<String> = (0..count).map(|i| format!("id-{i:08}")).collect();
    let cached = ids.iter().map(|id| (id.clone(), Some(base))).collect();

    let mut shuffled = ids.clone();
    shuffled.shuffle(&mut rand::thread_rng());
    let (touched, rest) = shuffled.split_at(changed.min(count));
    let gone = deleted.min(rest.len());
    let kept = &rest[gone..];

    let newer = base + Duration::seconds(60);
    let mut manifest: Vec<ManifestEntry> = touched
        .iter()
        .map(|id| ManifestEntry::new(id.clone(), Some(newer)))
        .chain(kept.iter().map(|id| ManifestEntry::new(id.clone(), Some(base))))
        .chain((0..created).map(|i| ManifestEntry::new(format!("new-{i:08}"), Some(newer))))
        .collect();
    manifest.sort_by(|a, b| a.id.cmp(&b.id));
    (cached, manifest)
}
