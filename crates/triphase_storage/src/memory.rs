//! In-memory durable store with crash simulation.

use crate::error::{StorageError, StorageResult};
use crate::store::DurableStore;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Default)]
struct Image {
    bytes: Vec<u8>,
    synced_len: usize,
}

/// An in-memory store whose contents outlive the handle that wrote them.
///
/// Cloning a `MemoryStore` yields another handle onto the same image, which
/// stands in for a disk that survives a process restart: a test hands one
/// handle to a coordinator, drops the coordinator, and reopens the log from
/// the other handle.
///
/// [`MemoryStore::simulate_crash`] discards every byte appended after the
/// last successful `sync`, which is what a power loss does to a real file.
///
/// # Example
///
/// ```rust
/// use triphase_storage::{DurableStore, MemoryStore};
///
/// let mut store = MemoryStore::new();
/// let disk = store.clone();
///
/// store.append(b"durable").unwrap();
/// store.sync().unwrap();
/// store.append(b"lost").unwrap();
///
/// disk.simulate_crash();
/// assert_eq!(disk.len().unwrap(), 7);
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    image: Arc<RwLock<Image>>,
}

impl MemoryStore {
    /// Creates a new empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store whose image already holds `data`, all of it synced.
    ///
    /// Useful for feeding hand-crafted or corrupted logs to recovery.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        let synced_len = data.len();
        Self {
            image: Arc::new(RwLock::new(Image {
                bytes: data,
                synced_len,
            })),
        }
    }

    /// Returns a copy of every byte in the image, synced or not.
    #[must_use]
    pub fn bytes(&self) -> Vec<u8> {
        self.image.read().bytes.clone()
    }

    /// Returns the number of bytes that would survive a crash.
    #[must_use]
    pub fn synced_len(&self) -> u64 {
        self.image.read().synced_len as u64
    }

    /// Drops every byte appended after the last `sync`.
    pub fn simulate_crash(&self) {
        let mut image = self.image.write();
        let synced = image.synced_len;
        image.bytes.truncate(synced);
    }

    /// Overwrites a single byte in place.
    ///
    /// Test helper for corruption scenarios; bypasses the append-only rule.
    pub fn corrupt_byte(&self, offset: usize, value: u8) {
        if let Some(byte) = self.image.write().bytes.get_mut(offset) {
            *byte = value;
        }
    }
}

impl DurableStore for MemoryStore {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let image = self.image.read();
        let size = image.bytes.len() as u64;
        let start = offset as usize;
        let end = start.saturating_add(len);

        if offset > size || end > image.bytes.len() {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        Ok(image.bytes[start..end].to_vec())
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut image = self.image.write();
        let offset = image.bytes.len() as u64;
        image.bytes.extend_from_slice(data);
        Ok(offset)
    }

    fn sync(&mut self) -> StorageResult<()> {
        let mut image = self.image.write();
        image.synced_len = image.bytes.len();
        Ok(())
    }

    fn len(&self) -> StorageResult<u64> {
        Ok(self.image.read().bytes.len() as u64)
    }

    fn truncate(&mut self, new_len: u64) -> StorageResult<()> {
        let mut image = self.image.write();
        let size = image.bytes.len() as u64;

        if new_len > size {
            return Err(StorageError::TruncateBeyondEnd {
                requested: new_len,
                size,
            });
        }

        image.bytes.truncate(new_len as usize);
        image.synced_len = image.synced_len.min(new_len as usize);
        Ok(())
    }

    fn replace(&mut self, data: &[u8]) -> StorageResult<()> {
        let mut image = self.image.write();
        image.bytes = data.to_vec();
        image.synced_len = data.len();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_returns_offsets() {
        let mut store = MemoryStore::new();
        assert_eq!(store.append(b"vote").unwrap(), 0);
        assert_eq!(store.append(b"ack").unwrap(), 4);
        assert_eq!(store.len().unwrap(), 7);
    }

    #[test]
    fn read_past_end_fails() {
        let mut store = MemoryStore::new();
        store.append(b"hello").unwrap();

        assert!(matches!(
            store.read_at(3, 10),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(store.read_at(5, 0).unwrap().is_empty());
    }

    #[test]
    fn clones_share_the_image() {
        let mut writer = MemoryStore::new();
        let reader = writer.clone();

        writer.append(b"shared").unwrap();
        assert_eq!(reader.read_at(0, 6).unwrap(), b"shared");
    }

    #[test]
    fn crash_drops_unsynced_tail() {
        let mut store = MemoryStore::new();
        store.append(b"begin").unwrap();
        store.sync().unwrap();
        store.append(b"voting").unwrap();
        assert_eq!(store.synced_len(), 5);

        store.simulate_crash();

        assert_eq!(store.bytes(), b"begin");
    }

    #[test]
    fn crash_after_sync_keeps_everything() {
        let mut store = MemoryStore::new();
        store.append(b"precommitted").unwrap();
        store.sync().unwrap();

        store.simulate_crash();

        assert_eq!(store.len().unwrap(), 12);
    }

    #[test]
    fn with_data_is_fully_synced() {
        let store = MemoryStore::with_data(b"preloaded".to_vec());
        store.simulate_crash();
        assert_eq!(store.read_at(0, 9).unwrap(), b"preloaded");
    }

    #[test]
    fn truncate_clamps_synced_len() {
        let mut store = MemoryStore::new();
        store.append(b"hello world").unwrap();
        store.sync().unwrap();

        store.truncate(5).unwrap();

        assert_eq!(store.synced_len(), 5);
        assert!(matches!(
            store.truncate(100),
            Err(StorageError::TruncateBeyondEnd { .. })
        ));
    }

    #[test]
    fn replace_is_durable_at_once() {
        let mut store = MemoryStore::new();
        store.append(b"begin end begin").unwrap();
        store.sync().unwrap();
        store.append(b" unsynced").unwrap();

        store.replace(b"begin").unwrap();
        store.simulate_crash();

        assert_eq!(store.bytes(), b"begin");
        assert_eq!(store.synced_len(), 5);
    }

    #[test]
    fn corrupt_byte_changes_image() {
        let mut store = MemoryStore::new();
        store.append(&[1, 2, 3]).unwrap();
        store.corrupt_byte(1, 0xFF);
        assert_eq!(store.bytes(), vec![1, 0xFF, 3]);
    }
}
