//! Durable store trait definition.

use crate::error::StorageResult;

/// An append-only byte store that backs a write-ahead log.
///
/// # Invariants
///
/// - `append` returns the offset where data was written
/// - `read_at` returns exactly the bytes previously appended at that offset
/// - once `sync` returns, every byte appended before it survives a crash
/// - stores must be `Send + Sync` so a log can be shared across tasks
///
/// # Implementors
///
/// - [`super::MemoryStore`] - for tests and crash simulation
/// - [`super::FileStore`] - for persistent logs
pub trait DurableStore: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the range extends past the end of the store or an
    /// I/O error occurs.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends data to the end of the store and returns its offset.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Makes every previously appended byte durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the data could not be made durable. Callers must
    /// treat the preceding appends as lost.
    fn sync(&mut self) -> StorageResult<()>;

    /// Returns the current length of the store in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn len(&self) -> StorageResult<u64>;

    /// Returns true if the store holds no bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the length cannot be determined.
    fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    /// Truncates the store to `new_len` bytes and makes the truncation durable.
    ///
    /// Used when a log is compacted.
    ///
    /// # Errors
    ///
    /// Returns an error if `new_len` exceeds the current length or the
    /// truncation fails.
    fn truncate(&mut self, new_len: u64) -> StorageResult<()>;

    /// Replaces the whole contents with `data` and makes it durable.
    ///
    /// After a crash the store holds either the old contents or `data`,
    /// never a mix of the two. Used when a log is rewritten without its
    /// finished records.
    ///
    /// # Errors
    ///
    /// Returns an error if the new contents could not be made durable; the
    /// old contents are then still in place.
    fn replace(&mut self, data: &[u8]) -> StorageResult<()>;
}

impl<S: DurableStore + ?Sized> DurableStore for Box<S> {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        (**self).read_at(offset, len)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        (**self).append(data)
    }

    fn sync(&mut self) -> StorageResult<()> {
        (**self).sync()
    }

    fn len(&self) -> StorageResult<u64> {
        (**self).len()
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        (**self).truncate(new_len)
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        (**self).replace(data)
    }
}
