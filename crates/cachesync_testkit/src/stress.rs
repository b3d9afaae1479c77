//! Stress tests for the sync engine.
//!
//! These helpers drive a [`TestStore`] with many local writes while pushes
//! run concurrently, then check that nothing pending was lost.

use crate::fixtures::{book, TestStore};
use cachesync_core::Query;
use cachesync_engine::{DataStore, ReadPolicy, SyncError, SyncResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tracing::info;

/// Result of a stress test run.
#[derive(Debug, Clone)]
pub struct StressTestResult {
    /// Total operations performed.
    pub total_ops: usize,
    /// Successful operations.
    pub successful_ops: usize,
    /// Failed operations.
    pub failed_ops: usize,
    /// Total duration.
    pub duration: Duration,
    /// Operations per second.
    pub ops_per_second: f64,
}

impl StressTestResult {
    /// Creates a new result.
    pub fn new(successful: usize, failed: usize, duration: Duration) -> Self {
        let total = successful + failed;
        let ops_per_second = if duration.as_secs_f64() > 0.0 {
            total as f64 / duration.as_secs_f64()
        } else {
            0.0
        };

        Self {
            total_ops: total,
            successful_ops: successful,
            failed_ops: failed,
            duration,
            ops_per_second,
        }
    }

    /// Logs a summary of the run.
    pub fn log_summary(&self, name: &str) {
        info!(
            test = name,
            total = self.total_ops,
            successful = self.successful_ops,
            failed = self.failed_ops,
            duration_ms = self.duration.as_millis() as u64,
            ops_per_second = format!("{:.2}", self.ops_per_second),
            "stress run finished"
        );
    }
}

/// Configuration for stress tests.
#[derive(Debug, Clone)]
pub struct StressConfig {
    /// Local writes per writer thread.
    pub operations: usize,
    /// Number of writer threads.
    pub threads: usize,
    /// Every n-th write updates an earlier entity instead of creating one.
    pub update_every: usize,
}

impl Default for StressConfig {
    fn default() -> Self {
        Self {
            operations: 200,
            threads: 4,
            update_every: 5,
        }
    }
}

impl StressConfig {
    /// A small configuration for unit tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            operations: 25,
            threads: 2,
            update_every: 3,
        }
    }
}

/// Counts of a concurrent save/push run.
#[derive(Debug, Clone)]
pub struct ConcurrentPushReport {
    /// Writer throughput.
    pub writes: StressTestResult,
    /// Pushes that ran to completion.
    pub pushes: usize,
    /// Pushes refused because another push was running.
    pub refused_pushes: usize,
}

/// Runs sequential local saves.
pub fn stress_sequential_saves(store: &DataStore, config: &StressConfig) -> StressTestResult {
    let start = Instant::now();
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        match store.save(book(i), None) {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    StressTestResult::new(successful, failed, start.elapsed())
}

fn writer(store: &DataStore, thread_id: usize, config: &StressConfig) -> (usize, usize) {
    let mut successful = 0usize;
    let mut failed = 0usize;

    for i in 0..config.operations {
        let update = config.update_every > 0 && i % config.update_every == 0;
        let result = if update {
            match store.find_by_id(&seed_id(thread_id), Some(ReadPolicy::ForceLocal)) {
                Ok(Some(mut entity)) => {
                    entity.set("rev", i);
                    store.save(entity, None)
                }
                Ok(None) => Err(SyncError::InvalidOperation(format!(
                    "{} is not cached",
                    seed_id(thread_id)
                ))),
                Err(err) => Err(err),
            }
        } else {
            store.save(book(thread_id * config.operations + i), None)
        };
        match result {
            Ok(_) => successful += 1,
            Err(_) => failed += 1,
        }
    }

    (successful, failed)
}

fn seed_id(thread_id: usize) -> String {
    format!("seed-{thread_id}")
}

/// Saves from several threads while another thread pushes in a loop, then
/// pushes until the queue drains.
///
/// Each writer creates new entities and periodically updates one record
/// pulled from the remote beforehand.
///
/// # Errors
///
/// Fails if seeding the cache with the initial pull fails.
pub fn stress_saves_during_push(
    test_store: &TestStore,
    config: &StressConfig,
) -> SyncResult<ConcurrentPushReport> {
    let store = &test_store.store;
    test_store.remote.seed((0..config.threads).map(|thread_id| {
        let mut entity = book(thread_id);
        entity.id = Some(seed_id(thread_id));
        entity
    }));
    store.pull(&Query::new(), None)?;
    let successful = AtomicUsize::new(0);
    let failed = AtomicUsize::new(0);
    let pushes = AtomicUsize::new(0);
    let refused = AtomicUsize::new(0);
    let writing = AtomicBool::new(true);

    let start = Instant::now();
    thread::scope(|scope| {
        let writers: Vec<_> = (0..config.threads)
            .map(|thread_id| {
                let successful = &successful;
                let failed = &failed;
                scope.spawn(move || {
                    let (ok, err) = writer(store, thread_id, config);
                    successful.fetch_add(ok, Ordering::Relaxed);
                    failed.fetch_add(err, Ordering::Relaxed);
                })
            })
            .collect();

        let pusher = scope.spawn(|| {
            while writing.load(Ordering::Acquire) {
                match store.push() {
                    Ok(_) => {
                        pushes.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(SyncError::InvalidStateTransition { .. }) => {
                        refused.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(_) => {}
                }
                thread::yield_now();
            }
        });

        for handle in writers {
            let _ = handle.join();
        }
        writing.store(false, Ordering::Release);
        let _ = pusher.join();
    });
    let writes = StressTestResult::new(
        successful.load(Ordering::Relaxed),
        failed.load(Ordering::Relaxed),
        start.elapsed(),
    );

    for _ in 0..4 {
        if test_store.queue.is_empty() {
            break;
        }
        if store.push().is_ok() {
            pushes.fetch_add(1, Ordering::Relaxed);
        }
    }

    Ok(ConcurrentPushReport {
        writes,
        pushes: pushes.load(Ordering::Relaxed),
        refused_pushes: refused.load(Ordering::Relaxed),
    })
}

/// True when every cached record has a server id and a remote counterpart
/// with the same fields.
pub fn cache_matches_remote(test_store: &TestStore) -> bool {
    let records = test_store.records(&Query::new());
    records.len() == test_store.remote.len()
        && records.iter().all(|record| {
            !record.is_temporary()
                && record.entity.id.as_deref().map_or(false, |id| {
                    test_store
                        .remote
                        .stored(id)
                        .map_or(false, |remote| remote.fields == record.entity.fields)
                })
        })
}
