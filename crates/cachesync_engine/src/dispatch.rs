//! Asynchronous request dispatch.
//!
//! Requests run on a tokio runtime as blocking tasks. Their completions are
//! handed to one named notification thread, in the order they finish, so
//! callers observe results on a single thread the way a UI main loop would.
//!
//! Every request returns a [`RequestHandle`]. Cancelling it stops multi-step
//! work at the next remote request and suppresses the completion.

use crate::cancel::CancelToken;
use crate::config::SyncConfig;
use crate::controller::{PushResult, SyncOutcome};
use crate::error::{SyncError, SyncResult};
use crate::policy::{ReadPolicy, WritePolicy};
use crate::store::DataStore;
use cachesync_core::{AggregateSpec, Entity, Query};
use cachesync_remote::MultiSaveResult;
use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send>;

/// Handle of a dispatched request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    token: CancelToken,
}

impl RequestHandle {
    /// Cancels the request. Its completion will not run.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// True once cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The request's cancellation token.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }
}

struct Delivery<T, C> {
    notifier: mpsc::Sender<Job>,
    token: CancelToken,
    done: AtomicBool,
    completion: Arc<Mutex<C>>,
    _result: std::marker::PhantomData<fn(T)>,
}

impl<T, C> Delivery<T, C>
where
    T: Send + 'static,
    C: FnMut(SyncResult<T>) + Send + 'static,
{
    fn emit(&self, result: SyncResult<T>) {
        if self.done.load(Ordering::SeqCst) || self.token.is_cancelled() {
            return;
        }
        self.send(result);
    }

    fn finish(&self, result: SyncResult<T>) {
        if self.done.swap(true, Ordering::SeqCst) || self.token.is_cancelled() {
            return;
        }
        self.send(result);
    }

    fn send(&self, result: SyncResult<T>) {
        let token = self.token.clone();
        let completion = self.completion.clone();
        let job: Job = Box::new(move || {
            if !token.is_cancelled() {
                let mut completion = completion.lock();
                (*completion)(result);
            }
        });
        if self.notifier.send(job).is_err() {
            warn!("notification thread is gone, completion dropped");
        }
    }
}

/// Runs requests on a tokio runtime and delivers completions on the
/// notification thread.
pub struct Dispatcher {
    runtime: Option<Runtime>,
    notifier: mpsc::Sender<Job>,
    timeout: Duration,
    thread_name: String,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("timeout", &self.timeout)
            .field("thread_name", &self.thread_name)
            .finish()
    }
}

impl Dispatcher {
    /// Starts the runtime and the notification thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime or the thread cannot be started.
    pub fn new(config: &SyncConfig) -> SyncResult<Self> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(config.worker_threads.max(1))
            .thread_name("cachesync-worker")
            .enable_all()
            .build()?;

        let (notifier, jobs) = mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name(config.notification_thread.clone())
            .spawn(move || {
                for job in jobs {
                    if catch_unwind(AssertUnwindSafe(job)).is_err() {
                        warn!("completion panicked");
                    }
                }
            })?;

        debug!(thread = %config.notification_thread, timeout = ?config.timeout, "dispatcher started");
        Ok(Self {
            runtime: Some(runtime),
            notifier,
            timeout: config.timeout,
            thread_name: config.notification_thread.clone(),
        })
    }

    /// Name of the notification thread.
    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    /// Runs `work` and delivers its result to `completion`.
    pub fn submit<T, W, C>(&self, work: W, completion: C) -> RequestHandle
    where
        T: Send + 'static,
        W: FnOnce(&CancelToken) -> SyncResult<T> + Send + 'static,
        C: FnOnce(SyncResult<T>) + Send + 'static,
    {
        self.stream(move |cancel, _| work(cancel), wrap_once(completion))
    }

    /// Runs `work`, which may emit intermediate results before returning
    /// its final one. Every result reaches `completion` in order.
    pub fn stream<T, W, C>(&self, work: W, completion: C) -> RequestHandle
    where
        T: Send + 'static,
        W: FnOnce(&CancelToken, &dyn Fn(SyncResult<T>)) -> SyncResult<T> + Send + 'static,
        C: FnMut(SyncResult<T>) + Send + 'static,
    {
        let token = CancelToken::new();
        let handle = RequestHandle {
            token: token.clone(),
        };
        let delivery = Arc::new(Delivery {
            notifier: self.notifier.clone(),
            token: token.clone(),
            done: AtomicBool::new(false),
            completion: Arc::new(Mutex::new(completion)),
            _result: std::marker::PhantomData,
        });

        let Some(runtime) = &self.runtime else {
            delivery.finish(Err(SyncError::Internal("dispatcher is shut down".to_string())));
            return handle;
        };

        let timeout = self.timeout;
        runtime.spawn(async move {
            let work_token = token.child();
            let task_token = work_token.clone();
            let task_delivery = delivery.clone();
            let task = tokio::task::spawn_blocking(move || {
                let emit = |result: SyncResult<T>| task_delivery.emit(result);
                work(&task_token, &emit)
            });

            let result = match tokio::time::timeout(timeout, task).await {
                Ok(Ok(result)) => result,
                Ok(Err(join)) => Err(SyncError::Internal(join.to_string())),
                Err(_) => {
                    work_token.cancel();
                    warn!(?timeout, "request timed out");
                    Err(SyncError::Timeout)
                }
            };
            delivery.finish(result);
        });
        handle
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

fn wrap_once<T: 'static>(completion: impl FnOnce(T) + Send + 'static) -> impl FnMut(T) + Send + 'static {
    let mut completion = Some(completion);
    move |value| {
        if let Some(completion) = completion.take() {
            completion(value);
        }
    }
}

/// A [`DataStore`] whose operations complete asynchronously.
///
/// Reads with [`ReadPolicy::Both`] call their completion twice: first with
/// the cached result, then with the network result.
#[derive(Debug, Clone)]
pub struct AsyncDataStore {
    store: Arc<DataStore>,
    dispatcher: Arc<Dispatcher>,
}

impl AsyncDataStore {
    /// Wraps `store` with its own dispatcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the dispatcher cannot be started.
    pub fn new(store: DataStore) -> SyncResult<Self> {
        let dispatcher = Dispatcher::new(store.config())?;
        Ok(Self::with_dispatcher(Arc::new(store), Arc::new(dispatcher)))
    }

    /// Wraps `store` with a shared dispatcher.
    pub fn with_dispatcher(store: Arc<DataStore>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { store, dispatcher }
    }

    /// The wrapped store.
    pub fn store(&self) -> &Arc<DataStore> {
        &self.store
    }

    fn read<T, F, C>(&self, policy: Option<ReadPolicy>, op: F, completion: C) -> RequestHandle
    where
        T: Send + 'static,
        F: Fn(&DataStore, ReadPolicy, &CancelToken) -> SyncResult<T> + Send + 'static,
        C: FnMut(SyncResult<T>) + Send + 'static,
    {
        let store = self.store.clone();
        let policy = policy.unwrap_or_else(|| store.store_type().read_policy());
        self.dispatcher.stream(
            move |cancel, emit| {
                if policy == ReadPolicy::Both && store.store_type().has_cache() {
                    emit(op(&*store, ReadPolicy::ForceLocal, cancel));
                }
                op(&*store, policy, cancel)
            },
            completion,
        )
    }

    fn run<T, W, C>(&self, work: W, completion: C) -> RequestHandle
    where
        T: Send + 'static,
        W: FnOnce(&DataStore, &CancelToken) -> SyncResult<T> + Send + 'static,
        C: FnOnce(SyncResult<T>) + Send + 'static,
    {
        let store = self.store.clone();
        self.dispatcher
            .submit(move |cancel| work(&*store, cancel), completion)
    }

    /// Finds the entities matching `query`.
    pub fn find(
        &self,
        query: Query,
        policy: Option<ReadPolicy>,
        completion: impl FnMut(SyncResult<Vec<Entity>>) + Send + 'static,
    ) -> RequestHandle {
        self.read(
            policy,
            move |store, policy, cancel| store.find_with(&query, policy, cancel),
            completion,
        )
    }

    /// Finds one entity by id.
    pub fn find_by_id(
        &self,
        id: impl Into<String>,
        policy: Option<ReadPolicy>,
        completion: impl FnMut(SyncResult<Option<Entity>>) + Send + 'static,
    ) -> RequestHandle {
        let id = id.into();
        self.read(
            policy,
            move |store, policy, cancel| store.find_by_id_with(&id, policy, cancel),
            completion,
        )
    }

    /// Counts the entities matching `query`.
    pub fn count(
        &self,
        query: Query,
        policy: Option<ReadPolicy>,
        completion: impl FnMut(SyncResult<usize>) + Send + 'static,
    ) -> RequestHandle {
        self.read(
            policy,
            move |store, policy, cancel| store.count_with(&query, policy, cancel),
            completion,
        )
    }

    /// Groups and reduces entities.
    pub fn aggregate(
        &self,
        spec: AggregateSpec,
        policy: Option<ReadPolicy>,
        completion: impl FnMut(SyncResult<Vec<Value>>) + Send + 'static,
    ) -> RequestHandle {
        self.read(
            policy,
            move |store, policy, cancel| store.aggregate_with(&spec, policy, cancel),
            completion,
        )
    }

    /// Saves one entity.
    pub fn save(
        &self,
        entity: Entity,
        policy: Option<WritePolicy>,
        completion: impl FnOnce(SyncResult<Entity>) + Send + 'static,
    ) -> RequestHandle {
        let policy = policy.unwrap_or_else(|| self.store.store_type().write_policy());
        self.run(
            move |store, cancel| store.save_with(None, entity, policy, cancel),
            completion,
        )
    }

    /// Saves many entities.
    pub fn save_many(
        &self,
        entities: Vec<Entity>,
        policy: Option<WritePolicy>,
        completion: impl FnOnce(SyncResult<MultiSaveResult>) + Send + 'static,
    ) -> RequestHandle {
        let policy = policy.unwrap_or_else(|| self.store.store_type().write_policy());
        self.run(
            move |store, cancel| store.save_many_with(entities, policy, cancel),
            completion,
        )
    }

    /// Removes the entities matching `query`.
    pub fn remove(
        &self,
        query: Query,
        policy: Option<WritePolicy>,
        completion: impl FnOnce(SyncResult<usize>) + Send + 'static,
    ) -> RequestHandle {
        let policy = policy.unwrap_or_else(|| self.store.store_type().write_policy());
        self.run(
            move |store, cancel| store.remove_with(&query, policy, cancel),
            completion,
        )
    }

    /// Removes entities by id or temporary key.
    pub fn remove_by_ids(
        &self,
        ids: Vec<String>,
        policy: Option<WritePolicy>,
        completion: impl FnOnce(SyncResult<usize>) + Send + 'static,
    ) -> RequestHandle {
        let policy = policy.unwrap_or_else(|| self.store.store_type().write_policy());
        self.run(
            move |store, cancel| {
                if ids.iter().any(String::is_empty) {
                    return Err(SyncError::InvalidArgument("id must not be empty".to_string()));
                }
                store.remove_keys_with(ids, policy, cancel)
            },
            completion,
        )
    }

    /// Removes one entity by id or temporary key.
    pub fn remove_by_id(
        &self,
        id: impl Into<String>,
        policy: Option<WritePolicy>,
        completion: impl FnOnce(SyncResult<usize>) + Send + 'static,
    ) -> RequestHandle {
        self.remove_by_ids(vec![id.into()], policy, completion)
    }

    /// Removes every entity.
    pub fn remove_all(
        &self,
        policy: Option<WritePolicy>,
        completion: impl FnOnce(SyncResult<usize>) + Send + 'static,
    ) -> RequestHandle {
        self.remove(Query::new(), policy, completion)
    }

    /// Pushes every pending operation.
    pub fn push(
        &self,
        completion: impl FnOnce(SyncResult<PushResult>) + Send + 'static,
    ) -> RequestHandle {
        self.run(move |store, cancel| store.push_with(cancel), completion)
    }

    /// Pulls `query` into the cache.
    pub fn pull(
        &self,
        query: Query,
        delta_set: Option<bool>,
        completion: impl FnOnce(SyncResult<Vec<Entity>>) + Send + 'static,
    ) -> RequestHandle {
        self.run(
            move |store, cancel| store.pull_with(&query, delta_set, cancel),
            completion,
        )
    }

    /// Pushes, then pulls `query`.
    pub fn sync(
        &self,
        query: Query,
        completion: impl FnOnce(SyncResult<SyncOutcome>) + Send + 'static,
    ) -> RequestHandle {
        self.run(
            move |store, cancel| store.sync_with(&query, cancel),
            completion,
        )
    }

    /// Discards pending operations and clears the cache scope of `query`.
    pub fn purge(
        &self,
        query: Query,
        completion: impl FnOnce(SyncResult<usize>) + Send + 'static,
    ) -> RequestHandle {
        self.run(
            move |store, cancel| store.purge_with(&query, cancel),
            completion,
        )
    }
}
