//! # cachesync testkit
//!
//! Test utilities for cachesync.
//!
//! This crate provides:
//! - Store fixtures wired to an in-process remote, with restart support
//! - Property-based test generators using proptest
//! - Concurrent stress helpers for the push path
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cachesync_testkit::prelude::*;
//!
//! #[test]
//! fn saves_offline() {
//!     with_test_store(StoreType::Sync, |t| {
//!         t.store.save(book(1), None).unwrap();
//!         assert_eq!(t.store.sync_count(), 1);
//!     });
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod fixtures;
pub mod generators;
pub mod stress;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::stress::*;
    pub use cachesync_engine::StoreType;
}

pub use fixtures::*;
pub use generators::*;
pub use stress::*;
