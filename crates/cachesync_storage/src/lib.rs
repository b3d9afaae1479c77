//! # cachesync storage
//!
//! Durable journals for the cachesync local cache and pending-operation queue.
//!
//! A [`Journal`] is an append-only sequence of checksummed frames stored in a
//! [`JournalBackend`]. Backends are **opaque byte stores**; the journal owns
//! the framing, and the layers above own the meaning of each frame.
//!
//! ## Available Backends
//!
//! - [`InMemoryBackend`] - For tests and ephemeral stores. Clones share data,
//!   so a clone can be used to simulate a process restart.
//! - [`FileBackend`] - For persistent storage using OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use cachesync_storage::{InMemoryBackend, Journal};
//!
//! let backend = InMemoryBackend::new();
//! let (mut journal, _) = Journal::open(Box::new(backend.clone())).unwrap();
//! journal.append(b"first").unwrap();
//!
//! let (_, replay) = Journal::open(Box::new(backend)).unwrap();
//! assert_eq!(replay.frames, vec![b"first".to_vec()]);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod journal;
mod memory;

pub use backend::JournalBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use journal::{compute_crc32, Journal, JournalReplay, FRAME_HEADER_SIZE};
pub use memory::InMemoryBackend;
