//! # cachesync engine
//!
//! Offline-first synchronization between a local cache and a remote
//! collection.
//!
//! This crate provides:
//! - [`DataStore`], which routes reads and writes by [`StoreType`] and
//!   per-call [`ReadPolicy`] / [`WritePolicy`]
//! - [`SyncController`] with push, pull (optionally delta-set), purge and sync
//! - [`AsyncDataStore`], which runs requests on a tokio runtime and delivers
//!   completions on one notification thread
//! - [`CancelToken`] and [`RequestHandle`] for cancellation
//!
//! ## Architecture
//!
//! Writes land in the cache and the pending queue first. A push drains the
//! queue in FIFO order; every confirmed item replaces its cached record with
//! the server copy and leaves the queue. A pull is refused while anything is
//! pending, so it never overwrites unpushed work.
//!
//! ## Key Invariants
//!
//! - Only confirmed items leave the queue
//! - Pull never runs with pending operations
//! - Transport failures are surfaced, never retried here
//! - Cancelled requests never call their completion

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod cancel;
mod config;
mod controller;
mod dispatch;
mod error;
mod policy;
mod store;

pub use cancel::CancelToken;
pub use config::{SyncConfig, DEFAULT_NOTIFICATION_THREAD};
pub use controller::{
    PushError, PushResult, SyncController, SyncOutcome, SyncState, SyncStats, PULL_GUARD_MESSAGE,
};
pub use dispatch::{AsyncDataStore, Dispatcher, RequestHandle};
pub use error::{SyncError, SyncResult};
pub use policy::{ReadPolicy, StoreType, WritePolicy};
pub use store::DataStore;
