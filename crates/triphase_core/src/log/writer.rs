//! Durable log writer and reader.

use crate::error::CoreResult;
use crate::log::iterator::LogIterator;
use crate::log::record::{encode_frame, LogRecord};
use parking_lot::Mutex;
use std::marker::PhantomData;
use triphase_storage::DurableStore;

/// An append-only log of framed records on top of a [`DurableStore`].
///
/// With `sync_on_write` set, `append` returns only after the store is synced,
/// so a caller may send a message that depends on the record as soon as
/// `append` returns.
pub struct DurableLog<R> {
    store: Mutex<Box<dyn DurableStore>>,
    sync_on_write: bool,
    _record: PhantomData<fn(R) -> R>,
}

impl<R: LogRecord> DurableLog<R> {
    /// Creates a log over `store`.
    pub fn new(store: Box<dyn DurableStore>, sync_on_write: bool) -> Self {
        Self {
            store: Mutex::new(store),
            sync_on_write,
            _record: PhantomData,
        }
    }

    /// Appends a record and returns the offset where it was written.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding, writing or syncing fails.
    pub fn append(&self, record: &R) -> CoreResult<u64> {
        let frame = encode_frame(record)?;

        let mut store = self.store.lock();
        let offset = store.append(&frame)?;
        if self.sync_on_write {
            store.sync()?;
        }

        Ok(offset)
    }

    /// Makes every appended record durable.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be synced.
    pub fn sync(&self) -> CoreResult<()> {
        self.store.lock().sync()?;
        Ok(())
    }

    /// Returns the current log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        Ok(self.store.lock().len()?)
    }

    /// Returns whether appends are synced immediately.
    #[must_use]
    pub fn sync_on_write(&self) -> bool {
        self.sync_on_write
    }

    /// Returns a streaming iterator over every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be accessed.
    pub fn iter(&self) -> CoreResult<LogIterator<'_, R>> {
        LogIterator::new(self.store.lock(), 0)
    }

    /// Iterates over records with a callback.
    ///
    /// The callback returns `Ok(true)` to continue or `Ok(false)` to stop.
    ///
    /// # Errors
    ///
    /// Returns an error if reading fails or the callback returns an error.
    pub fn for_each_streaming<F>(&self, mut callback: F) -> CoreResult<()>
    where
        F: FnMut(u64, R) -> CoreResult<bool>,
    {
        for result in self.iter()? {
            let (offset, record) = result?;
            if !callback(offset, record)? {
                break;
            }
        }
        Ok(())
    }

    /// Reads all records into memory.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or I/O failure.
    pub fn read_all(&self) -> CoreResult<Vec<(u64, R)>> {
        self.iter()?.collect()
    }

    /// Truncates the log to `offset` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the truncation.
    pub fn truncate(&self, offset: u64) -> CoreResult<()> {
        self.store.lock().truncate(offset)?;
        Ok(())
    }

    /// Rewrites the log keeping only the records `plan` selects.
    ///
    /// `plan` sees every record and returns the filter to apply; kept
    /// records stay in their original order. Reading and rewriting happen
    /// under one lock, so no append can slip in between, and the store swaps
    /// in the new contents atomically. Returns how many records were
    /// dropped; nothing is rewritten if that is zero.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or I/O failure.
    pub fn retain<P, F>(&self, plan: P) -> CoreResult<usize>
    where
        P: FnOnce(&[(u64, R)]) -> F,
        F: FnMut(&R) -> bool,
    {
        let mut iter = LogIterator::<R>::new(self.store.lock(), 0)?;
        let records = iter.by_ref().collect::<CoreResult<Vec<_>>>()?;
        let mut keep = plan(&records);

        let mut kept = Vec::new();
        let mut dropped = 0usize;
        for (_, record) in &records {
            if keep(record) {
                kept.extend_from_slice(&encode_frame(record)?);
            } else {
                dropped += 1;
            }
        }
        if dropped == 0 {
            return Ok(0);
        }

        let mut store = iter.into_store();
        store.replace(&kept)?;
        Ok(dropped)
    }

    /// Discards every record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store refuses the truncation.
    pub fn clear(&self) -> CoreResult<()> {
        self.truncate(0)
    }
}

impl<R> std::fmt::Debug for DurableLog<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableLog")
            .field("sync_on_write", &self.sync_on_write)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;
    use crate::log::record::{CRC_SIZE, HEADER_SIZE};
    use serde::{Deserialize, Serialize};
    use triphase_storage::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    enum Entry {
        Open(u64),
        Note(String),
        Close(u64),
    }

    impl LogRecord for Entry {
        fn record_type(&self) -> u8 {
            match self {
                Entry::Open(_) => 1,
                Entry::Note(_) => 2,
                Entry::Close(_) => 3,
            }
        }

        fn is_known_type(type_byte: u8) -> bool {
            (1..=3).contains(&type_byte)
        }
    }

    fn create_log(sync_on_write: bool) -> (DurableLog<Entry>, MemoryStore) {
        let store = MemoryStore::new();
        let log = DurableLog::new(Box::new(store.clone()), sync_on_write);
        (log, store)
    }

    #[test]
    fn read_empty_log() {
        let (log, _) = create_log(false);
        assert!(log.read_all().unwrap().is_empty());
        assert_eq!(log.size().unwrap(), 0);
    }

    #[test]
    fn append_and_read_in_order() {
        let (log, _) = create_log(false);
        let entries = [
            Entry::Open(1),
            Entry::Note("seat 14C".into()),
            Entry::Close(1),
        ];
        for entry in &entries {
            log.append(entry).unwrap();
        }

        let records = log.read_all().unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].0, 0);
        for (read, written) in records.iter().zip(entries.iter()) {
            assert_eq!(&read.1, written);
        }
    }

    #[test]
    fn sync_on_write_survives_crash() {
        let (log, store) = create_log(true);
        log.append(&Entry::Open(9)).unwrap();

        store.simulate_crash();

        let reopened: DurableLog<Entry> = DurableLog::new(Box::new(store), true);
        assert_eq!(reopened.read_all().unwrap().len(), 1);
    }

    #[test]
    fn unsynced_records_lost_on_crash() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        log.sync().unwrap();
        log.append(&Entry::Close(1)).unwrap();

        store.simulate_crash();

        let reopened: DurableLog<Entry> = DurableLog::new(Box::new(store), false);
        let records = reopened.read_all().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].1, Entry::Open(1));
    }

    #[test]
    fn truncated_tail_is_clean_end() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        let keep = log.size().unwrap();
        log.append(&Entry::Note("half written".into())).unwrap();

        let mut bytes = store.bytes();
        bytes.truncate(keep as usize + HEADER_SIZE + 2);
        let torn: DurableLog<Entry> =
            DurableLog::new(Box::new(MemoryStore::with_data(bytes)), false);

        let records = torn.read_all().unwrap();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn truncated_header_is_clean_end() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();

        let mut bytes = store.bytes();
        bytes.extend_from_slice(b"3PC");
        let torn: DurableLog<Entry> =
            DurableLog::new(Box::new(MemoryStore::with_data(bytes)), false);

        assert_eq!(torn.read_all().unwrap().len(), 1);
    }

    #[test]
    fn crc_mismatch_is_fatal() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        let size = log.size().unwrap() as usize;

        // flip a payload byte
        store.corrupt_byte(size - CRC_SIZE - 1, 0xEE);

        let result = log.read_all();
        assert!(matches!(result, Err(CoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn bad_magic_is_fatal() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        store.corrupt_byte(0, b'X');

        assert!(matches!(
            log.read_all(),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        store.corrupt_byte(6, 0x7F);

        assert!(matches!(
            log.read_all(),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn future_version_is_fatal() {
        let (log, store) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        store.corrupt_byte(4, 0xFF);

        assert!(matches!(
            log.read_all(),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn for_each_early_exit() {
        let (log, _) = create_log(false);
        for i in 0..10 {
            log.append(&Entry::Open(i)).unwrap();
        }

        let mut count = 0;
        log.for_each_streaming(|_, _| {
            count += 1;
            Ok(count < 3)
        })
        .unwrap();

        assert_eq!(count, 3);
    }

    #[test]
    fn retain_drops_closed_entries() {
        let (log, store) = create_log(true);
        for entry in [
            Entry::Open(1),
            Entry::Open(2),
            Entry::Note("seat 14C".into()),
            Entry::Close(1),
        ] {
            log.append(&entry).unwrap();
        }
        let before = log.size().unwrap();

        let dropped = log
            .retain(|records| {
                let closed: Vec<u64> = records
                    .iter()
                    .filter_map(|(_, e)| match e {
                        Entry::Close(id) => Some(*id),
                        _ => None,
                    })
                    .collect();
                move |entry: &Entry| match entry {
                    Entry::Open(id) | Entry::Close(id) => !closed.contains(id),
                    Entry::Note(_) => true,
                }
            })
            .unwrap();

        assert_eq!(dropped, 2);
        assert!(log.size().unwrap() < before);
        let kept: Vec<Entry> = log.read_all().unwrap().into_iter().map(|(_, e)| e).collect();
        assert_eq!(kept, vec![Entry::Open(2), Entry::Note("seat 14C".into())]);

        // the rewrite is durable and later appends land after it
        log.append(&Entry::Close(2)).unwrap();
        store.simulate_crash();
        let reopened: DurableLog<Entry> = DurableLog::new(Box::new(store), true);
        assert_eq!(reopened.read_all().unwrap().len(), 3);
    }

    #[test]
    fn retain_everything_leaves_log_alone() {
        let (log, _) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        let size = log.size().unwrap();

        assert_eq!(log.retain(|_| |_: &Entry| true).unwrap(), 0);
        assert_eq!(log.size().unwrap(), size);
    }

    #[test]
    fn clear_log() {
        let (log, _) = create_log(false);
        log.append(&Entry::Open(1)).unwrap();
        log.append(&Entry::Close(1)).unwrap();

        log.clear().unwrap();

        assert_eq!(log.size().unwrap(), 0);
        assert!(log.read_all().unwrap().is_empty());
    }
}
