//! # Triphase Protocol
//!
//! Message types exchanged between a three-phase commit coordinator and its
//! participants.
//!
//! This crate provides:
//! - `TransactionId` and `ParticipantId`
//! - `Vote` and `Decision`
//! - `ProtocolMessage`, the six logical messages plus `Nack`
//! - `Envelope`, the versioned CBOR wire form
//!
//! This is a pure protocol crate with no I/O operations. Delivery is
//! at-least-once, so every receiver of these messages must be idempotent.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod messages;
mod types;

pub use error::{ProtocolError, ProtocolResult};
pub use messages::{Envelope, NackReason, ProtocolMessage, PROTOCOL_VERSION};
pub use types::{Decision, ParticipantId, TransactionId, Vote};
