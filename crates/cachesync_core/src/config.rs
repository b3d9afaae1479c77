//! Local cache configuration.

use std::time::Duration;

/// Configuration for a [`crate::LocalCache`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Records cached longer than this are treated as absent by reads.
    pub ttl: Option<Duration>,

    /// Journal frames tolerated before the cache rewrites a snapshot.
    pub compact_after_frames: usize,

    /// Whether every journal append is synced to durable storage.
    pub sync_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: None,
            compact_after_frames: 1024,
            sync_on_write: true,
        }
    }
}

impl CacheConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the time-to-live for cached records.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Sets the compaction threshold.
    #[must_use]
    pub const fn with_compact_after_frames(mut self, frames: usize) -> Self {
        self.compact_after_frames = frames;
        self
    }

    /// Sets whether appends are synced.
    #[must_use]
    pub const fn with_sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }
}
