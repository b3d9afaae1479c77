//! Configuration for a data store.

use crate::policy::StoreType;
use cachesync_core::CacheConfig;
use cachesync_remote::MAX_MULTI_INSERT;
use std::time::Duration;

/// Default name of the thread completions are delivered on.
pub const DEFAULT_NOTIFICATION_THREAD: &str = "cachesync-main";

/// Configuration for one collection's data store.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Collection name.
    pub collection: String,
    /// Store type, which selects the default read and write policies.
    pub store_type: StoreType,
    /// Whether pulls and network reads use the delta-set manifest.
    pub delta_set: bool,
    /// Maximum entities per multi-insert request (capped at 100).
    pub max_batch_size: usize,
    /// Maximum ids per delta-set payload fetch.
    pub manifest_page_size: usize,
    /// Local cache configuration, including the TTL.
    pub cache: CacheConfig,
    /// Timeout applied to each async request.
    pub timeout: Duration,
    /// Name of the thread async completions run on.
    pub notification_thread: String,
    /// Worker threads of the async runtime.
    pub worker_threads: usize,
}

impl SyncConfig {
    /// Creates a configuration for `collection` with default values.
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            store_type: StoreType::default(),
            delta_set: false,
            max_batch_size: MAX_MULTI_INSERT,
            manifest_page_size: 200,
            cache: CacheConfig::default(),
            timeout: Duration::from_secs(60),
            notification_thread: DEFAULT_NOTIFICATION_THREAD.to_string(),
            worker_threads: 2,
        }
    }

    /// Sets the store type.
    pub fn with_store_type(mut self, store_type: StoreType) -> Self {
        self.store_type = store_type;
        self
    }

    /// Enables or disables delta-set pulls.
    pub fn with_delta_set(mut self, enabled: bool) -> Self {
        self.delta_set = enabled;
        self
    }

    /// Sets the multi-insert chunk size.
    pub fn with_max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Sets the delta-set fetch page size.
    pub fn with_manifest_page_size(mut self, size: usize) -> Self {
        self.manifest_page_size = size;
        self
    }

    /// Sets the cache time-to-live.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.cache.ttl = Some(ttl);
        self
    }

    /// Replaces the cache configuration.
    pub fn with_cache_config(mut self, cache: CacheConfig) -> Self {
        self.cache = cache;
        self
    }

    /// Sets the async request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the notification thread name.
    pub fn with_notification_thread(mut self, name: impl Into<String>) -> Self {
        self.notification_thread = name.into();
        self
    }

    /// Sets the number of async worker threads.
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    /// Chunk size actually used for multi-insert requests.
    pub fn effective_batch_size(&self) -> usize {
        self.max_batch_size.clamp(1, MAX_MULTI_INSERT)
    }

    /// Page size actually used for delta-set fetches.
    pub fn effective_page_size(&self) -> usize {
        self.manifest_page_size.max(1)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new("")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("books")
            .with_store_type(StoreType::Sync)
            .with_delta_set(true)
            .with_max_batch_size(25)
            .with_manifest_page_size(50)
            .with_ttl(Duration::from_secs(3600))
            .with_timeout(Duration::from_secs(5))
            .with_notification_thread("ui");

        assert_eq!(config.collection, "books");
        assert_eq!(config.store_type, StoreType::Sync);
        assert!(config.delta_set);
        assert_eq!(config.effective_batch_size(), 25);
        assert_eq!(config.effective_page_size(), 50);
        assert_eq!(config.cache.ttl, Some(Duration::from_secs(3600)));
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.notification_thread, "ui");
    }

    #[test]
    fn batch_size_is_capped() {
        let config = SyncConfig::new("books").with_max_batch_size(500);
        assert_eq!(config.effective_batch_size(), MAX_MULTI_INSERT);
        let config = SyncConfig::new("books").with_max_batch_size(0);
        assert_eq!(config.effective_batch_size(), 1);
    }

    #[test]
    fn defaults() {
        let config = SyncConfig::new("books");
        assert_eq!(config.store_type, StoreType::Cache);
        assert_eq!(config.manifest_page_size, 200);
        assert_eq!(config.notification_thread, DEFAULT_NOTIFICATION_THREAD);
        assert!(!config.delta_set);
    }
}
