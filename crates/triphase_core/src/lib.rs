//! # Triphase Core
//!
//! Logs and state machines shared by the three-phase commit coordinator and
//! its participants.
//!
//! This crate provides:
//! - [`Transaction`], the coordinator's per-transaction state machine with
//!   the `can_abort` guard
//! - [`LocalTransaction`], a participant's per-transaction state machine
//! - [`DurableLog`], a framed, checksummed write-ahead log over any
//!   `DurableStore`
//! - [`CoordinatorLog`] and [`ParticipantLog`] with replay for restart
//!   recovery
//!
//! Nothing here performs network I/O or spawns tasks.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
pub mod log;
pub mod transaction;

pub use error::{CoreError, CoreResult};
pub use log::{
    CoordinatorLog, CoordinatorRecord, DurableLog, LogRecord, LoggedLocalTransaction,
    LoggedTransaction, ParticipantLog, ParticipantLogRecord,
};
pub use transaction::{
    validate_participants, AbortCause, AckState, CoordinatorPhase, LocalTransaction, Outcome,
    ParticipantPhase, ParticipantRecord, ReservationHandle, Transaction, VoteState,
};
