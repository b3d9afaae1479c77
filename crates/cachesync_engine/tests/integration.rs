//! Integration tests for data stores against an in-process remote.

use cachesync_core::{CacheConfig, Entity, LocalCache, Predicate, Query, SyncQueue};
use cachesync_engine::{
    AsyncDataStore, DataStore, ReadPolicy, StoreType, SyncConfig, SyncError, WritePolicy,
    PULL_GUARD_MESSAGE,
};
use cachesync_remote::{MemoryRemote, RemoteError, RequestKind, Session};
use cachesync_testkit::prelude::*;
use cachesync_testkit::generators::{local_op_sequence_strategy, LocalOp, PropTestConfig};
use cachesync_testkit::stress::cache_matches_remote;
use proptest::prelude::*;
use serde_json::json;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn delta_store(count: usize) -> TestStore {
    let test_store = TestStore::with_config(
        SyncConfig::new(TEST_COLLECTION)
            .with_store_type(StoreType::Sync)
            .with_delta_set(true),
    );
    test_store.remote.seed((0..count).map(|i| {
        let mut entity = book(i);
        entity.id = Some(format!("book-{i}"));
        entity
    }));
    test_store
}

fn batch_sizes(remote: &MemoryRemote, kind: RequestKind) -> Vec<usize> {
    remote
        .requests()
        .into_iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.batch_size)
        .collect()
}

// ---- push ----

#[test]
fn two_new_entities_push_as_one_multi_insert() {
    let t = TestStore::new(StoreType::Sync);
    t.save(book(1), None).unwrap();
    t.save(book(2), None).unwrap();
    assert_eq!(t.sync_count(), 2);
    assert_eq!(t.remote.request_count(), 0);

    let result = t.push().unwrap();

    assert!(result.is_success());
    assert_eq!(result.confirmed, 2);
    assert_eq!(batch_sizes(&t.remote, RequestKind::CreateMany), vec![2]);
    assert_eq!(t.sync_count(), 0);

    let records = t.records(&Query::new());
    assert_eq!(records.len(), 2);
    for record in records {
        assert!(!record.is_temporary());
        let id = record.entity.id.clone().unwrap();
        assert_eq!(record.key, id);
        assert!(t.remote.stored(&id).is_some());
    }
}

#[test]
fn large_batch_is_chunked_and_rejections_keep_their_index() {
    init_tracing();
    let t = TestStore::new(StoreType::Sync);
    t.remote
        .reject_where(Predicate::is_in("index", [10, 120]), "ValidationFailed");
    t.save_many(books(150), None).unwrap();

    let result = t.push().unwrap();

    assert_eq!(batch_sizes(&t.remote, RequestKind::CreateMany), vec![100, 50]);
    assert_eq!(result.confirmed, 148);
    let indices: Vec<usize> = result.errors.iter().map(|e| e.error.index).collect();
    assert_eq!(indices, vec![10, 120]);
    assert!(result
        .errors
        .iter()
        .all(|e| e.error.message == "ValidationFailed"));

    assert_eq!(t.remote.len(), 148);
    assert_eq!(t.sync_count(), 2);
    let pending: Vec<_> = t
        .records(&Query::new())
        .into_iter()
        .filter(|r| r.is_temporary())
        .map(|r| r.entity.get("index").cloned())
        .collect();
    assert_eq!(pending.len(), 2);
    assert!(pending.contains(&Some(json!(10))));
    assert!(pending.contains(&Some(json!(120))));
}

#[test]
fn failed_chunk_leaves_its_items_pending() {
    let t = TestStore::new(StoreType::Sync);
    t.save_many(books(150), None).unwrap();
    t.remote
        .fail_request(2, RemoteError::transport_retryable("connection reset"));

    let result = t.push().unwrap();

    assert_eq!(result.confirmed, 100);
    assert_eq!(result.errors.len(), 50);
    assert_eq!(result.errors[0].error.index, 100);
    assert_eq!(t.sync_count(), 50);

    let retry = t.push().unwrap();
    assert!(retry.is_success());
    assert_eq!(t.remote.len(), 150);
    assert_eq!(t.sync_count(), 0);
}

#[test]
fn local_save_many_writes_one_queue_snapshot() {
    let queue_journal = CountingBackend::new();
    let queue = Arc::new(SyncQueue::open(TEST_COLLECTION, Box::new(queue_journal.clone())).unwrap());
    let cache = Arc::new(LocalCache::in_memory(TEST_COLLECTION, CacheConfig::default()).unwrap());
    let store = DataStore::from_parts(
        SyncConfig::new(TEST_COLLECTION).with_store_type(StoreType::Sync),
        Arc::new(Session::signed_in(TEST_APP_KEY, TEST_USER, "token")),
        Arc::new(MemoryRemote::new(TEST_COLLECTION)),
        cache,
        queue,
    );
    let before = queue_journal.replaces();

    store.save_many(books(150), None).unwrap();

    assert_eq!(queue_journal.replaces() - before, 1);
    assert_eq!(store.sync_count(), 150);
    assert_eq!(store.pending_operations().len(), 1);
}

#[test]
fn network_save_many_reports_a_failed_chunk_per_item() {
    let t = TestStore::new(StoreType::Network);
    t.remote
        .fail_request(2, RemoteError::transport_retryable("reset"));

    let result = t.save_many(books(150), None).unwrap();

    assert_eq!(result.entities.len(), 150);
    assert_eq!(result.saved_count(), 100);
    assert!(result.entities[..100].iter().all(Option::is_some));
    let indices: Vec<usize> = result.errors.iter().map(|e| e.index).collect();
    assert_eq!(indices, (100..150).collect::<Vec<_>>());
    assert_eq!(t.remote.len(), 100);
}

#[test]
fn cached_network_save_many_caches_the_saved_chunks() {
    let t = TestStore::new(StoreType::Cache);
    t.remote
        .fail_request(1, RemoteError::transport_retryable("reset"));

    let result = t
        .save_many(books(150), Some(WritePolicy::ForceNetwork))
        .unwrap();

    assert_eq!(result.errors.len(), 100);
    assert_eq!(result.errors[0].index, 0);
    assert_eq!(result.saved_count(), 50);
    assert_eq!(t.records(&Query::new()).len(), 50);
    assert_eq!(t.sync_count(), 0);
}

#[test]
fn old_api_version_rejects_multi_insert() {
    let t = TestStore::new(StoreType::Sync);
    t.remote.set_api_version(4);
    t.save(book(1), None).unwrap();

    let result = t.push().unwrap();

    assert_eq!(result.errors.len(), 1);
    assert_eq!(t.sync_count(), 1);
    assert!(t.remote.is_empty());
}

#[test]
fn update_and_delete_push_after_pull() {
    let t = scenarios::seeded_store(StoreType::Sync, 3);
    t.pull(&Query::new(), None).unwrap();

    let mut first = t.find_by_id("book-0", None).unwrap().unwrap();
    first.set("title", "Revised");
    t.save(first, None).unwrap();
    t.remove_by_id("book-1", None).unwrap();
    assert_eq!(t.sync_count(), 2);

    let result = t.push().unwrap();

    assert!(result.is_success());
    assert_eq!(t.remote.count_of(RequestKind::Update), 1);
    assert_eq!(t.remote.count_of(RequestKind::Delete), 1);
    assert_eq!(
        t.remote.stored("book-0").unwrap().get("title"),
        Some(&json!("Revised"))
    );
    assert!(t.remote.stored("book-1").is_none());
    assert_eq!(t.sync_count(), 0);
}

#[test]
fn removing_an_unpushed_entity_sends_nothing() {
    let t = TestStore::new(StoreType::Sync);
    t.save(book(1), None).unwrap();
    let key = t.records(&Query::new())[0].key.clone();

    t.remove_by_id(&key, None).unwrap();
    assert_eq!(t.sync_count(), 0);

    let result = t.push().unwrap();
    assert_eq!(result.confirmed, 0);
    assert_eq!(t.remote.request_count(), 0);
}

// ---- pull ----

#[test]
fn pull_refuses_while_operations_are_pending() {
    let t = scenarios::seeded_store(StoreType::Sync, 2);
    t.save(book(9), None).unwrap();

    let err = t.pull(&Query::new(), None).unwrap_err();

    assert!(matches!(err, SyncError::InvalidOperation(ref m) if m == PULL_GUARD_MESSAGE));
    assert_eq!(t.remote.request_count(), 0);
    assert_eq!(t.sync_count(), 1);
}

#[test]
fn delta_pull_of_unchanged_data_fetches_only_the_manifest() {
    let t = delta_store(5);
    assert_eq!(t.pull(&Query::new(), None).unwrap().len(), 5);
    t.remote.clear_requests();

    let pulled = t.pull(&Query::new(), None).unwrap();

    assert_eq!(pulled.len(), 5);
    let requests = t.remote.requests();
    assert_eq!(requests.len(), 1);
    let manifest = requests[0].query.clone().unwrap();
    assert!(manifest.fields.is_some());
    assert_eq!(t.stats().delta_set_pulls, 1);
}

#[test]
fn delta_pull_fetches_only_changed_records() {
    init_tracing();
    let t = delta_store(5);
    t.pull(&Query::new(), None).unwrap();
    t.remote.clear_requests();
    assert!(t.remote.touch("book-2", "title", "Changed elsewhere"));

    t.pull(&Query::new(), None).unwrap();

    let requests = t.remote.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].query,
        Some(Query::by_ids(["book-2".to_string()]))
    );
    assert_eq!(
        t.find_by_id("book-2", None).unwrap().unwrap().get("title"),
        Some(&json!("Changed elsewhere"))
    );
}

#[test]
fn delta_pull_drops_records_deleted_remotely() {
    let t = delta_store(4);
    t.pull(&Query::new(), None).unwrap();
    assert!(t.remote.remove_raw("book-3"));

    let pulled = t.pull(&Query::new(), None).unwrap();

    assert_eq!(pulled.len(), 3);
    assert!(t.find_by_id("book-3", None).unwrap().is_none());
}

#[test]
fn failed_delta_page_leaves_the_cache_untouched() {
    let t = TestStore::with_config(
        SyncConfig::new(TEST_COLLECTION)
            .with_store_type(StoreType::Sync)
            .with_delta_set(true)
            .with_manifest_page_size(2),
    );
    t.remote.seed((0..6).map(|i| {
        let mut entity = book(i);
        entity.id = Some(format!("book-{i}"));
        entity
    }));
    t.pull(&Query::new(), None).unwrap();
    for i in 0..5 {
        assert!(t.remote.touch(&format!("book-{i}"), "title", "Changed"));
    }
    t.remote.clear_requests();
    t.remote
        .fail_request(3, RemoteError::transport_retryable("reset"));

    let err = t.pull(&Query::new(), None).unwrap_err();

    assert!(err.is_transport());
    assert_eq!(t.remote.request_count(), 3);
    for i in 0..6 {
        let cached = t
            .find_by_id(&format!("book-{i}"), Some(ReadPolicy::ForceLocal))
            .unwrap()
            .unwrap();
        assert_eq!(cached.get("title"), Some(&json!(format!("Book {i}"))));
    }
}

#[test]
fn manifest_without_lmt_refetches_every_record() {
    let t = delta_store(3);
    t.pull(&Query::new(), None).unwrap();
    t.remote.set_strip_metadata(true);
    t.remote.clear_requests();

    let pulled = t.pull(&Query::new(), None).unwrap();

    assert_eq!(pulled.len(), 3);
    let requests = t.remote.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1].query.as_ref().map(|q| q.fields.is_none()), Some(true));
    assert_eq!(t.stats().delta_set_pulls, 1);
}

#[test]
fn cached_record_without_lmt_is_refetched_alone() {
    let t = delta_store(3);
    t.pull(&Query::new(), None).unwrap();
    t.remote.set_strip_metadata(true);
    t.save(
        Entity::with_id("book-9").field("title", "Stripped"),
        Some(WritePolicy::ForceNetwork),
    )
    .unwrap();
    t.remote.set_strip_metadata(false);
    assert!(t
        .find_by_id("book-9", Some(ReadPolicy::ForceLocal))
        .unwrap()
        .unwrap()
        .lmt()
        .is_none());
    t.remote.clear_requests();

    let pulled = t.pull(&Query::new(), None).unwrap();

    assert_eq!(pulled.len(), 4);
    let requests = t.remote.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(
        requests[1].query,
        Some(Query::by_ids(["book-9".to_string()]))
    );
}

#[test]
fn full_pull_replaces_the_scope() {
    let t = scenarios::seeded_store(StoreType::Sync, 3);
    t.pull(&Query::new(), None).unwrap();
    t.remote.remove_raw("book-0");

    let pulled = t.pull(&Query::new(), Some(false)).unwrap();

    assert_eq!(pulled.len(), 2);
    assert_eq!(t.count(&Query::new(), None).unwrap(), 2);
}

#[test]
fn sync_pushes_then_pulls() {
    let t = scenarios::seeded_store(StoreType::Sync, 2);
    t.save(book(7), None).unwrap();

    let outcome = t.sync(&Query::new()).unwrap();

    assert_eq!(outcome.pushed, 1);
    assert!(outcome.errors.is_empty());
    assert_eq!(outcome.pulled.len(), 3);
    assert_eq!(t.sync_count(), 0);
}

#[test]
fn sync_skips_the_pull_when_the_push_had_errors() {
    let t = scenarios::seeded_store(StoreType::Sync, 2);
    t.remote.reject_where(Predicate::eq("index", 7), "ValidationFailed");
    t.save(book(7), None).unwrap();

    let outcome = t.sync(&Query::new()).unwrap();

    assert_eq!(outcome.errors.len(), 1);
    assert!(outcome.pulled.is_empty());
    assert_eq!(t.remote.count_of(RequestKind::Query), 0);
}

// ---- purge ----

#[test]
fn purge_reverts_updates_and_drops_creates() {
    let t = scenarios::seeded_store(StoreType::Sync, 2);
    t.pull(&Query::new(), None).unwrap();
    let mut first = t.find_by_id("book-0", None).unwrap().unwrap();
    first.set("title", "Local edit");
    t.save(first, None).unwrap();
    t.save(book(5), None).unwrap();

    let discarded = t.purge(&Query::new()).unwrap();

    assert_eq!(discarded, 2);
    assert_eq!(t.sync_count(), 0);
    assert_eq!(t.remote.count_of(RequestKind::Get), 1);
    assert!(t.records(&Query::new()).is_empty());
}

#[test]
fn purge_stops_at_the_first_failed_request() {
    init_tracing();
    let t = scenarios::seeded_store(StoreType::Sync, 2);
    t.pull(&Query::new(), None).unwrap();
    for id in ["book-0", "book-1"] {
        let mut entity = t.find_by_id(id, None).unwrap().unwrap();
        entity.set("title", "Local edit");
        t.save(entity, None).unwrap();
    }
    t.remote
        .fail_request(2, RemoteError::transport_retryable("offline"));

    let err = t.purge(&Query::new()).unwrap_err();

    assert!(err.is_transport());
    assert_eq!(t.sync_count(), 1);
    assert_eq!(
        t.find_by_id("book-0", None).unwrap().unwrap().get("title"),
        Some(&json!("Book 0"))
    );
    assert_eq!(
        t.find_by_id("book-1", None).unwrap().unwrap().get("title"),
        Some(&json!("Local edit"))
    );
}

// ---- policies ----

#[test]
fn cache_store_pushes_each_save_immediately() {
    let t = TestStore::new(StoreType::Cache);

    let saved = t.save(book(1), None).unwrap();

    assert!(saved.id.is_some());
    assert_eq!(t.sync_count(), 0);
    assert_eq!(t.remote.len(), 1);
}

#[test]
fn failed_immediate_push_keeps_the_entity_pending() {
    let t = TestStore::new(StoreType::Cache);
    t.remote
        .fail_next(RemoteError::transport_retryable("connection refused"));

    let err = t.save(book(1), None).unwrap_err();

    assert!(err.is_transport());
    assert_eq!(t.sync_count(), 1);
    assert_eq!(t.find(&Query::new(), Some(ReadPolicy::ForceLocal)).unwrap().len(), 1);

    assert!(t.push().unwrap().is_success());
    assert_eq!(t.remote.len(), 1);
}

#[test]
fn auto_store_reads_local_data_when_offline() {
    let t = scenarios::seeded_store(StoreType::Auto, 3);
    assert_eq!(t.find(&Query::new(), None).unwrap().len(), 3);

    t.remote
        .fail_next(RemoteError::transport_retryable("network unreachable"));
    let offline = t.find(&Query::new(), None).unwrap();

    assert_eq!(offline.len(), 3);
}

#[test]
fn network_store_has_no_local_state() {
    let t = TestStore::new(StoreType::Network);

    let saved = t.save(book(1), None).unwrap();
    assert!(saved.id.is_some());

    assert!(matches!(
        t.push().unwrap_err(),
        SyncError::InvalidStoreType { .. }
    ));
    assert!(matches!(
        t.find(&Query::new(), Some(ReadPolicy::ForceLocal)).unwrap_err(),
        SyncError::InvalidStoreType { .. }
    ));
}

#[test]
fn network_operations_need_a_user() {
    let t = TestStore::new(StoreType::Sync);
    t.session.sign_out();

    t.save(book(1), None).unwrap();
    assert!(matches!(t.push().unwrap_err(), SyncError::NoActiveUser));
    assert!(matches!(
        t.save(book(2), Some(WritePolicy::ForceNetwork)).unwrap_err(),
        SyncError::NoActiveUser
    ));
    assert_eq!(t.remote.request_count(), 0);
}

#[test]
fn expired_records_are_hidden_then_evicted() {
    let t = TestStore::with_config(
        SyncConfig::new(TEST_COLLECTION)
            .with_store_type(StoreType::Sync)
            .with_ttl(Duration::from_secs(60)),
    );
    t.remote.seed(books(3));
    t.pull(&Query::new(), None).unwrap();
    assert_eq!(t.count(&Query::new(), None).unwrap(), 3);

    t.advance(Duration::from_secs(61));

    assert_eq!(t.count(&Query::new(), None).unwrap(), 0);
    assert_eq!(t.evict_expired().unwrap(), 3);
    assert!(t.cache.is_empty());
}

// ---- persistence ----

#[test]
fn pending_operations_survive_a_restart() {
    let t = TestStore::new(StoreType::Sync);
    t.save_many(books(3), None).unwrap();

    let t = t.restart();

    assert_eq!(t.sync_count(), 3);
    assert!(t.push().unwrap().is_success());
    assert_eq!(t.remote.len(), 3);
}

#[test]
fn on_disk_store_reopens_cache_and_queue() {
    init_tracing();
    let (_temp, dir) = temp_store_dir();
    let remote = Arc::new(MemoryRemote::new(TEST_COLLECTION));
    let session = Arc::new(Session::signed_in(TEST_APP_KEY, TEST_USER, "token"));
    let config = SyncConfig::new(TEST_COLLECTION).with_store_type(StoreType::Sync);

    {
        let store = DataStore::open(&dir, config.clone(), session.clone(), remote.clone()).unwrap();
        store.save(book(1), None).unwrap();
        store.save(book(2), None).unwrap();
    }

    let store = DataStore::open(&dir, config, session, remote.clone()).unwrap();
    assert_eq!(store.sync_count(), 2);
    assert_eq!(store.find(&Query::new(), None).unwrap().len(), 2);
    assert!(store.push().unwrap().is_success());
    assert_eq!(remote.len(), 2);
}

// ---- async ----

#[test]
fn completions_run_on_the_notification_thread() {
    let t = TestStore::with_config(
        SyncConfig::new(TEST_COLLECTION)
            .with_store_type(StoreType::Sync)
            .with_notification_thread("ui-main"),
    );
    let store = AsyncDataStore::new(t.store).unwrap();
    let (tx, rx) = mpsc::channel();

    store.save(book(1), None, move |result| {
        let thread = std::thread::current().name().map(str::to_string);
        let _ = tx.send((result.is_ok(), thread));
    });

    let (ok, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(ok);
    assert_eq!(thread.as_deref(), Some("ui-main"));
}

#[test]
fn cached_reads_deliver_local_then_network_results() {
    let t = scenarios::seeded_store(StoreType::Cache, 3);
    let store = AsyncDataStore::new(t.store).unwrap();
    let (tx, rx) = mpsc::channel();

    store.find(Query::new(), None, move |result| {
        let _ = tx.send(result.map(|found| found.len()));
    });

    let local = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    let network = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
    assert_eq!((local, network), (0, 3));
}

#[test]
fn slow_requests_time_out() {
    init_tracing();
    let t = TestStore::with_config(
        SyncConfig::new(TEST_COLLECTION)
            .with_store_type(StoreType::Network)
            .with_timeout(Duration::from_millis(50)),
    );
    t.remote.set_latency(Some(Duration::from_millis(500)));
    let store = AsyncDataStore::new(t.store).unwrap();
    let (tx, rx) = mpsc::channel();

    store.count(Query::new(), None, move |result| {
        let _ = tx.send(result);
    });

    let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(matches!(result, Err(SyncError::Timeout)));
}

#[test]
fn cancelled_requests_never_complete() {
    let t = TestStore::new(StoreType::Network);
    t.remote.set_latency(Some(Duration::from_millis(200)));
    let store = AsyncDataStore::new(t.store).unwrap();
    let (tx, rx) = mpsc::channel::<Vec<Entity>>();

    let handle = store.find(Query::new(), None, move |result| {
        if let Ok(found) = result {
            let _ = tx.send(found);
        }
    });
    handle.cancel();

    assert!(handle.is_cancelled());
    assert!(rx.recv_timeout(Duration::from_millis(600)).is_err());
}

// ---- properties ----

fn apply_local_ops(t: &TestStore, ops: &[LocalOp]) {
    for op in ops {
        let records = t.records(&Query::new());
        match op {
            LocalOp::SaveNew(entity) => {
                t.save(entity.clone(), None).unwrap();
            }
            LocalOp::Update { index, rev } if !records.is_empty() => {
                let record = &records[index % records.len()];
                let mut entity = record.entity.clone();
                entity.set("rev", *rev);
                t.save_under(&record.key, entity, None).unwrap();
            }
            LocalOp::Remove { index } if !records.is_empty() => {
                let record = &records[index % records.len()];
                t.remove_by_id(&record.key, None).unwrap();
            }
            LocalOp::Update { .. } | LocalOp::Remove { .. } => {}
        }
    }
}

proptest! {
    #![proptest_config(PropTestConfig::quick().to_proptest_config())]

    #[test]
    fn push_converges_cache_and_remote(ops in local_op_sequence_strategy(1, 30)) {
        let t = TestStore::new(StoreType::Sync);
        apply_local_ops(&t, &ops);
        let local = t.records(&Query::new()).len();
        prop_assert_eq!(t.sync_count(), local);

        let result = t.push().unwrap();

        prop_assert!(result.is_success());
        prop_assert_eq!(t.sync_count(), 0);
        prop_assert_eq!(t.remote.len(), local);
        prop_assert!(cache_matches_remote(&t));
    }

    #[test]
    fn interleaved_pushes_lose_nothing(
        first in local_op_sequence_strategy(1, 15),
        second in local_op_sequence_strategy(1, 15),
    ) {
        let t = TestStore::new(StoreType::Sync);
        apply_local_ops(&t, &first);
        t.push().unwrap();
        apply_local_ops(&t, &second);
        t.push().unwrap();

        prop_assert_eq!(t.sync_count(), 0);
        prop_assert!(cache_matches_remote(&t));
    }
}
