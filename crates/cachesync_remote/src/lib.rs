//! # cachesync remote
//!
//! The network-facing boundary of cachesync.
//!
//! This crate provides:
//! - [`RemoteCollection`], the capability the reconciliation controller needs
//!   from a backend collection endpoint (query, get, count, create,
//!   multi-insert, update, delete, aggregate)
//! - [`RemoteError`], the remote failure taxonomy
//! - Wire envelopes for multi-insert results and server errors
//! - [`Session`], the explicit credentials object
//! - [`MemoryRemote`], an in-process reference collection with fault
//!   injection, used by tests and offline demos
//!
//! HTTP transport and authentication live outside this crate; an HTTP client
//! implements [`RemoteCollection`] and maps responses through the envelopes
//! in [`wire`].

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod client;
mod error;
mod memory;
mod session;
pub mod wire;

pub use client::RemoteCollection;
pub use error::{RemoteError, RemoteResult};
pub use memory::{MemoryRemote, RequestKind, RequestRecord, MIN_MULTI_INSERT_API_VERSION};
pub use session::Session;
pub use wire::{ItemError, MultiSaveResult, MAX_MULTI_INSERT};
