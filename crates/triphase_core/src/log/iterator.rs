//! Streaming log record iterator.

use crate::error::{CoreError, CoreResult};
use crate::log::record::{compute_crc32, LogRecord, CRC_SIZE, HEADER_SIZE, LOG_MAGIC, LOG_VERSION};
use parking_lot::MutexGuard;
use std::marker::PhantomData;
use tracing::debug;
use triphase_storage::DurableStore;

/// A streaming iterator over the records of a durable log.
///
/// Yields `(offset, record)` pairs. Holds the store lock for its whole
/// lifetime, so appends wait until iteration ends.
///
/// # Error Handling
///
/// - Truncated records (incomplete header or payload) end iteration cleanly
/// - CRC mismatches return an error
/// - Invalid magic bytes, unknown record types and future versions return a
///   corruption error
///
/// After the first error the iterator is exhausted.
pub struct LogIterator<'a, R> {
    store: MutexGuard<'a, Box<dyn DurableStore>>,
    total_size: u64,
    offset: u64,
    finished: bool,
    _record: PhantomData<fn() -> R>,
}

impl<'a, R: LogRecord> LogIterator<'a, R> {
    /// Creates an iterator starting at `start_offset`.
    ///
    /// # Errors
    ///
    /// Returns an error if the store size cannot be determined.
    pub(crate) fn new(
        store: MutexGuard<'a, Box<dyn DurableStore>>,
        start_offset: u64,
    ) -> CoreResult<Self> {
        let total_size = store.len()?;
        Ok(Self {
            store,
            total_size,
            offset: start_offset,
            finished: false,
            _record: PhantomData,
        })
    }

    /// Gives the store lock back once iteration is done.
    pub(crate) fn into_store(self) -> MutexGuard<'a, Box<dyn DurableStore>> {
        self.store
    }

    fn remaining(&self) -> u64 {
        self.total_size.saturating_sub(self.offset)
    }

    fn read_next_record(&mut self) -> CoreResult<Option<(u64, R)>> {
        let start = self.offset;

        if self.remaining() < HEADER_SIZE as u64 {
            if self.remaining() > 0 {
                debug!(offset = start, "truncated log header, treating as end of log");
            }
            return Ok(None);
        }

        let header = self.store.read_at(start, HEADER_SIZE)?;

        if header[0..4] != LOG_MAGIC {
            return Err(CoreError::log_corruption(format!(
                "invalid magic at offset {start}"
            )));
        }

        let version = u16::from_le_bytes([header[4], header[5]]);
        if version > LOG_VERSION {
            return Err(CoreError::log_corruption(format!(
                "unsupported version {version} at offset {start}"
            )));
        }

        let type_byte = header[6];
        if !R::is_known_type(type_byte) {
            return Err(CoreError::log_corruption(format!(
                "unknown record type {type_byte} at offset {start}"
            )));
        }

        let payload_len = u32::from_le_bytes([header[7], header[8], header[9], header[10]]) as usize;
        let total_len = HEADER_SIZE + payload_len + CRC_SIZE;

        if self.remaining() < total_len as u64 {
            debug!(offset = start, "truncated log record, treating as end of log");
            return Ok(None);
        }

        let frame = self.store.read_at(start, total_len)?;
        let crc_start = HEADER_SIZE + payload_len;
        let stored_crc = u32::from_le_bytes([
            frame[crc_start],
            frame[crc_start + 1],
            frame[crc_start + 2],
            frame[crc_start + 3],
        ]);
        let computed_crc = compute_crc32(&frame[..crc_start]);

        if stored_crc != computed_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: computed_crc,
            });
        }

        let record = R::decode_payload(type_byte, &frame[HEADER_SIZE..crc_start])?;
        self.offset += total_len as u64;

        Ok(Some((start, record)))
    }
}

impl<R: LogRecord> Iterator for LogIterator<'_, R> {
    type Item = CoreResult<(u64, R)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }

        match self.read_next_record() {
            Ok(Some(item)) => Some(Ok(item)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}
