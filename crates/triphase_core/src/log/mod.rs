//! Durable logs for crash recovery.
//!
//! Both roles keep a write-ahead log. The coordinator logs every phase
//! transition before sending the message that depends on it; a participant
//! logs `Prepared` before voting yes and syncs `PreCommitted` before acking.
//!
//! ## Record Format
//!
//! ```text
//! | magic (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! ```
//!
//! The payload is CBOR. The CRC covers header and payload.
//!
//! ## Recovery Policy
//!
//! ### Tolerated (clean end of log)
//!
//! - **Truncated header**: fewer than 11 bytes left
//! - **Truncated payload**: length exceeds the bytes left
//!
//! These are crashes mid-append; the partial record never reached `sync`, so
//! nobody acted on it.
//!
//! ### Fatal
//!
//! - **CRC mismatch** → `ChecksumMismatch`
//! - **Invalid magic**, **unknown record type**, **future version** →
//!   `LogCorruption`
//!
//! No repair is attempted.

mod coordinator;
mod iterator;
mod participant;
mod record;
mod writer;

pub use coordinator::{CoordinatorLog, CoordinatorRecord, LoggedTransaction};
pub use iterator::LogIterator;
pub use participant::{LoggedLocalTransaction, ParticipantLog, ParticipantLogRecord};
pub use record::{compute_crc32, LogRecord, LOG_MAGIC, LOG_VERSION};
pub use writer::DurableLog;
