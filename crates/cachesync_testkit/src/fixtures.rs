//! Test fixtures and store helpers.
//!
//! A [`TestStore`] wires a [`DataStore`] to an in-process [`MemoryRemote`],
//! a signed-in [`Session`] and a [`ManualClock`]. Its cache and queue live in
//! shared in-memory journals, so [`TestStore::restart`] reopens them the way
//! an application restart would.

use cachesync_core::{CacheConfig, Entity, LocalCache, ManualClock, StoreDir, SyncQueue};
use cachesync_engine::{DataStore, StoreType, SyncConfig};
use cachesync_remote::{MemoryRemote, Session};
use cachesync_storage::{InMemoryBackend, JournalBackend, StorageResult};
use chrono::{TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Collection used by the fixtures.
pub const TEST_COLLECTION: &str = "books";

/// App key of the fixture session.
pub const TEST_APP_KEY: &str = "kid_testkit";

/// User id of the fixture session.
pub const TEST_USER: &str = "user-1";

/// A data store with an in-process remote and restartable journals.
pub struct TestStore {
    /// The store under test.
    pub store: DataStore,
    /// The remote collection.
    pub remote: Arc<MemoryRemote>,
    /// The session, signed in as [`TEST_USER`].
    pub session: Arc<Session>,
    /// Clock shared by the cache and the remote.
    pub clock: Arc<ManualClock>,
    /// The cache, also reachable through the store.
    pub cache: Arc<LocalCache>,
    /// The pending queue, also reachable through the store.
    pub queue: Arc<SyncQueue>,
    config: SyncConfig,
    cache_journal: InMemoryBackend,
    queue_journal: InMemoryBackend,
}

impl TestStore {
    /// Creates a store of the given type with default configuration.
    pub fn new(store_type: StoreType) -> Self {
        Self::with_config(SyncConfig::new(TEST_COLLECTION).with_store_type(store_type))
    }

    /// Creates a store from a configuration.
    pub fn with_config(config: SyncConfig) -> Self {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0)
                .single()
                .expect("valid start time"),
        ));
        let remote = Arc::new(MemoryRemote::with_clock(
            config.collection.clone(),
            clock.clone(),
        ));
        let session = Arc::new(Session::signed_in(TEST_APP_KEY, TEST_USER, "token"));
        Self::assemble(
            config,
            remote,
            session,
            clock,
            InMemoryBackend::new(),
            InMemoryBackend::new(),
        )
    }

    fn assemble(
        config: SyncConfig,
        remote: Arc<MemoryRemote>,
        session: Arc<Session>,
        clock: Arc<ManualClock>,
        cache_journal: InMemoryBackend,
        queue_journal: InMemoryBackend,
    ) -> Self {
        let cache = Arc::new(
            LocalCache::open(
                config.collection.clone(),
                Box::new(cache_journal.clone()),
                config.cache.clone(),
                clock.clone(),
            )
            .expect("Failed to open cache"),
        );
        let queue = Arc::new(
            SyncQueue::open(config.collection.clone(), Box::new(queue_journal.clone()))
                .expect("Failed to open queue"),
        );
        let store = DataStore::from_parts(
            config.clone(),
            session.clone(),
            remote.clone(),
            cache.clone(),
            queue.clone(),
        );
        Self {
            store,
            remote,
            session,
            clock,
            cache,
            queue,
            config,
            cache_journal,
            queue_journal,
        }
    }

    /// Reopens the cache and queue from their journals, keeping the remote,
    /// session and clock.
    pub fn restart(self) -> Self {
        let Self {
            config,
            remote,
            session,
            clock,
            cache_journal,
            queue_journal,
            ..
        } = self;
        Self::assemble(config, remote, session, clock, cache_journal, queue_journal)
    }

    /// The configuration the store was built with.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Advances the shared clock.
    pub fn advance(&self, by: std::time::Duration) {
        self.clock.advance(by);
    }
}

impl std::ops::Deref for TestStore {
    type Target = DataStore;

    fn deref(&self) -> &Self::Target {
        &self.store
    }
}

/// Runs a test with a fresh store of the given type.
///
/// # Example
///
/// ```rust,ignore
/// use cachesync_testkit::with_test_store;
///
/// #[test]
/// fn my_test() {
///     with_test_store(StoreType::Sync, |t| {
///         t.store.save(book(1), None).unwrap();
///     });
/// }
/// ```
pub fn with_test_store<F, R>(store_type: StoreType, f: F) -> R
where
    F: FnOnce(&TestStore) -> R,
{
    let test_store = TestStore::new(store_type);
    f(&test_store)
}

/// A new book entity without an id.
pub fn book(index: usize) -> Entity {
    Entity::new()
        .field("title", format!("Book {index}"))
        .field("index", index)
}

/// `count` new books numbered from zero.
pub fn books(count: usize) -> Vec<Entity> {
    (0..count).map(book).collect()
}

/// Cache configuration with a time-to-live.
pub fn ttl_config(ttl: std::time::Duration) -> CacheConfig {
    CacheConfig::new().with_ttl(ttl)
}

/// A store directory in a fresh temporary directory. Keep the
/// [`tempfile::TempDir`] alive for as long as the directory is used.
pub fn temp_store_dir() -> (tempfile::TempDir, StoreDir) {
    let temp = tempfile::tempdir().expect("Failed to create temp dir");
    let dir = StoreDir::open(temp.path(), true).expect("Failed to open store dir");
    (temp, dir)
}

/// An in-memory journal backend that counts its writes.
///
/// Clones share the buffer and the counters.
#[derive(Debug, Clone, Default)]
pub struct CountingBackend {
    inner: InMemoryBackend,
    appends: Arc<AtomicUsize>,
    replaces: Arc<AtomicUsize>,
}

impl CountingBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames appended so far.
    pub fn appends(&self) -> usize {
        self.appends.load(Ordering::SeqCst)
    }

    /// Whole-journal rewrites so far.
    pub fn replaces(&self) -> usize {
        self.replaces.load(Ordering::SeqCst)
    }
}

impl JournalBackend for CountingBackend {
    fn load(&self) -> StorageResult<Vec<u8>> {
        self.inner.load()
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<()> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        self.inner.append(data)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        self.replaces.fetch_add(1, Ordering::SeqCst);
        self.inner.replace(data)
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.inner.sync()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// A store of the given type whose remote holds `count` books with
    /// ids `book-0`, `book-1`, ...
    pub fn seeded_store(store_type: StoreType, count: usize) -> TestStore {
        let test_store = TestStore::new(store_type);
        test_store.remote.seed(
            (0..count).map(|i| {
                let mut entity = book(i);
                entity.id = Some(format!("book-{i}"));
                entity
            }),
        );
        test_store
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachesync_core::Query;

    #[test]
    fn fixture_session_is_signed_in() {
        let test_store = TestStore::new(StoreType::Sync);
        assert_eq!(test_store.session.active_user().as_deref(), Some(TEST_USER));
        assert_eq!(test_store.store_type(), StoreType::Sync);
    }

    #[test]
    fn restart_keeps_cache_and_queue() {
        let test_store = TestStore::new(StoreType::Sync);
        test_store.store.save(book(1), None).unwrap();

        let test_store = test_store.restart();
        assert_eq!(test_store.sync_count(), 1);
        assert_eq!(test_store.find(&Query::new(), None).unwrap().len(), 1);
    }

    #[test]
    fn temp_store_dir_is_created() {
        let (temp, dir) = temp_store_dir();
        assert_eq!(dir.path(), temp.path());
        assert!(dir.cache_path(TEST_COLLECTION).unwrap().starts_with(temp.path()));
    }

    #[test]
    fn counting_backend_counts_writes() {
        let mut backend = CountingBackend::new();
        let shared = backend.clone();
        backend.append(b"ab").unwrap();
        backend.replace(b"c").unwrap();
        assert_eq!(shared.appends(), 1);
        assert_eq!(shared.replaces(), 1);
        assert_eq!(shared.load().unwrap(), b"c");
    }

    #[test]
    fn seeded_store_has_remote_data_only() {
        let test_store = scenarios::seeded_store(StoreType::Sync, 3);
        assert_eq!(test_store.remote.len(), 3);
        assert!(test_store.cache.is_empty());
    }
}
