//! Journal backend trait definition.

use crate::error::StorageResult;

/// A byte store holding one journal.
///
/// Backends do not interpret their content; [`crate::Journal`] owns the
/// frame format.
///
/// # Invariants
///
/// - `load` returns every byte appended since the last `replace`
/// - `replace` is atomic: after a crash either the old or the new content is
///   visible, never a mix
/// - `sync` makes all previous writes durable
pub trait JournalBackend: Send + Sync {
    /// Returns the complete content of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn load(&self) -> StorageResult<Vec<u8>>;

    /// Appends bytes to the end of the store.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn append(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Atomically replaces the whole content of the store.
    ///
    /// Used for compaction and for dropping a torn tail after a crash.
    ///
    /// # Errors
    ///
    /// Returns an error if an I/O error occurs.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;

    /// Makes all previous writes durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current size of the store in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;
}
