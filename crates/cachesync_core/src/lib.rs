//! # cachesync core
//!
//! The on-device half of an offline-first sync engine.
//!
//! This crate provides:
//! - [`Entity`] with server metadata (`_kmd`) and access control (`_acl`)
//! - [`Query`] and [`Predicate`] evaluated against cached entities
//! - [`LocalCache`] with TTL expiry and journaled persistence
//! - [`SyncQueue`] of coalesced [`PendingOperation`]s
//! - [`compute_delta_set`] for manifest-based pulls
//! - [`aggregate`] for grouped reductions over cached data
//!
//! Nothing in this crate talks to the network. The reconciliation controller
//! in `cachesync_engine` composes these pieces with a remote collection.
//!
//! ## Key Invariants
//!
//! - An entity without an id has never been created remotely; once assigned,
//!   the id never changes
//! - Each cache call is one logical transaction and one journal frame
//! - The queue counts entities, not operations
//! - Delta-set partitions are pairwise disjoint

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod aggregate;
mod cache;
mod clock;
mod codec;
mod config;
#[cfg(feature = "std")]
mod dir;
mod delta;
mod entity;
mod error;
mod query;
mod queue;

pub use aggregate::{aggregate, AggregateSpec, Reduce};
pub use cache::{CacheBatch, CacheRecord, LocalCache, TEMP_KEY_PREFIX};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use delta::{compute_delta_set, DeltaSet, ManifestEntry};
#[cfg(feature = "std")]
pub use dir::StoreDir;
pub use entity::{Acl, Entity, Metadata, ACL_KEY, ID_KEY, LMT_PATH, METADATA_KEY};
pub use error::{CoreError, CoreResult};
pub use query::{compare_values, Predicate, Query, SortKey, SortOrder};
pub use queue::{append_mutation, Mutation, PendingOperation, SyncQueue, Verb};
