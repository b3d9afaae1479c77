//! Store directory management.
//!
//! A durable store keeps one cache journal and one queue journal per
//! collection:
//!
//! ```text
//! <store_path>/
//! ├─ LOCK              # Advisory lock for single-process access
//! ├─ books.cache       # Cache journal of collection "books"
//! └─ books.queue       # Pending-operation journal of collection "books"
//! ```

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILE: &str = "LOCK";
const CACHE_EXTENSION: &str = "cache";
const QUEUE_EXTENSION: &str = "queue";

/// Manages the store directory and its lock.
///
/// The lock is held until the `StoreDir` is dropped, so only one
/// `StoreDir` can exist per directory at a time.
#[derive(Debug)]
pub struct StoreDir {
    path: PathBuf,
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory and takes its lock.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - The directory doesn't exist and `create_if_missing` is false
    /// - Another process holds the lock
    /// - I/O errors occur
    pub fn open(path: &Path, create_if_missing: bool) -> CoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(CoreError::StoreNotFound {
                    path: path.display().to_string(),
                });
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path.join(LOCK_FILE))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::StoreLocked {
                path: path.display().to_string(),
            });
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Root of the store.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the cache journal of `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name cannot be used as a file name.
    pub fn cache_path(&self, collection: &str) -> CoreResult<PathBuf> {
        validate_collection_name(collection)?;
        Ok(self.path.join(format!("{collection}.{CACHE_EXTENSION}")))
    }

    /// Path of the queue journal of `collection`.
    ///
    /// # Errors
    ///
    /// Returns an error if the name cannot be used as a file name.
    pub fn queue_path(&self, collection: &str) -> CoreResult<PathBuf> {
        validate_collection_name(collection)?;
        Ok(self.path.join(format!("{collection}.{QUEUE_EXTENSION}")))
    }
}

fn validate_collection_name(name: &str) -> CoreResult<()> {
    let valid = !name.is_empty()
        && name != LOCK_FILE
        && !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(CoreError::InvalidCollectionName(name.to_string()))
    }
}
