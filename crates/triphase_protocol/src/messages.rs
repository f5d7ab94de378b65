//! Protocol messages and their wire envelope.

use crate::error::{ProtocolError, ProtocolResult};
use crate::types::{Decision, TransactionId, Vote};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Current protocol version carried in every envelope.
pub const PROTOCOL_VERSION: u16 = 1;

/// Why a participant refused a request it cannot honour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NackReason {
    /// The participant already aborted this transaction.
    AlreadyAborted,
    /// The request is not valid in the participant's current phase.
    InvalidState,
    /// The participant detected a contract violation that needs manual
    /// reconciliation.
    Inconsistent,
}

impl fmt::Display for NackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NackReason::AlreadyAborted => f.write_str("already aborted"),
            NackReason::InvalidState => f.write_str("invalid state"),
            NackReason::Inconsistent => f.write_str("inconsistent"),
        }
    }
}

/// A three-phase commit protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolMessage {
    /// Phase 1 request: can you commit?
    Prepare(TransactionId),
    /// Phase 1 reply.
    Vote(TransactionId, Vote),
    /// Phase 2 request: enter the precommitted state.
    PreCommit(TransactionId),
    /// Phase 2 reply.
    Ack(TransactionId),
    /// Phase 3 request: apply the final decision.
    Decision(TransactionId, Decision),
    /// Phase 3 reply.
    DecisionAck(TransactionId),
    /// Negative reply to any request.
    Nack(TransactionId, NackReason),
}

impl ProtocolMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            ProtocolMessage::Prepare(_) => 1,
            ProtocolMessage::Vote(..) => 2,
            ProtocolMessage::PreCommit(_) => 3,
            ProtocolMessage::Ack(_) => 4,
            ProtocolMessage::Decision(..) => 5,
            ProtocolMessage::DecisionAck(_) => 6,
            ProtocolMessage::Nack(..) => 7,
        }
    }

    /// Returns a short name for logging and error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ProtocolMessage::Prepare(_) => "prepare",
            ProtocolMessage::Vote(..) => "vote",
            ProtocolMessage::PreCommit(_) => "precommit",
            ProtocolMessage::Ack(_) => "ack",
            ProtocolMessage::Decision(..) => "decision",
            ProtocolMessage::DecisionAck(_) => "decision_ack",
            ProtocolMessage::Nack(..) => "nack",
        }
    }

    /// Returns the transaction this message belongs to.
    pub fn tx_id(&self) -> TransactionId {
        match self {
            ProtocolMessage::Prepare(tx)
            | ProtocolMessage::Vote(tx, _)
            | ProtocolMessage::PreCommit(tx)
            | ProtocolMessage::Ack(tx)
            | ProtocolMessage::Decision(tx, _)
            | ProtocolMessage::DecisionAck(tx)
            | ProtocolMessage::Nack(tx, _) => *tx,
        }
    }

    /// Returns true for coordinator-to-participant requests.
    pub fn is_request(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::Prepare(_)
                | ProtocolMessage::PreCommit(_)
                | ProtocolMessage::Decision(..)
        )
    }
}

/// A versioned wrapper around a message, as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Protocol version of the sender.
    pub protocol_version: u16,
    /// The wrapped message.
    pub message: ProtocolMessage,
}

impl Envelope {
    /// Wraps a message using the current protocol version.
    pub fn new(message: ProtocolMessage) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            message,
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| ProtocolError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Decodes from CBOR and checks the protocol version.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        let envelope: Envelope =
            ciborium::from_reader(bytes).map_err(|e| ProtocolError::decode(e.to_string()))?;

        if envelope.protocol_version != PROTOCOL_VERSION {
            return Err(ProtocolError::VersionMismatch {
                local: PROTOCOL_VERSION,
                remote: envelope.protocol_version,
            });
        }

        Ok(envelope)
    }

    /// Encodes a bare message in a fresh envelope.
    pub fn encode_message(message: ProtocolMessage) -> ProtocolResult<Vec<u8>> {
        Self::new(message).encode()
    }

    /// Decodes bytes straight to the wrapped message.
    pub fn decode_message(bytes: &[u8]) -> ProtocolResult<ProtocolMessage> {
        Ok(Self::decode(bytes)?.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn tx() -> TransactionId {
        TransactionId::from_u128(42)
    }

    #[test]
    fn type_codes_are_distinct() {
        let messages = [
            ProtocolMessage::Prepare(tx()),
            ProtocolMessage::Vote(tx(), Vote::Yes),
            ProtocolMessage::PreCommit(tx()),
            ProtocolMessage::Ack(tx()),
            ProtocolMessage::Decision(tx(), Decision::Commit),
            ProtocolMessage::DecisionAck(tx()),
            ProtocolMessage::Nack(tx(), NackReason::AlreadyAborted),
        ];
        let mut codes: Vec<u8> = messages.iter().map(ProtocolMessage::type_code).collect();
        codes.dedup();
        assert_eq!(codes.len(), messages.len());
        assert!(messages.iter().all(|m| m.tx_id() == tx()));
    }

    #[test]
    fn only_coordinator_messages_are_requests() {
        assert!(ProtocolMessage::Prepare(tx()).is_request());
        assert!(ProtocolMessage::Decision(tx(), Decision::Abort).is_request());
        assert!(!ProtocolMessage::Vote(tx(), Vote::No).is_request());
        assert!(!ProtocolMessage::Nack(tx(), NackReason::InvalidState).is_request());
    }

    #[test]
    fn envelope_roundtrip() {
        let msg = ProtocolMessage::Decision(tx(), Decision::Commit);
        let bytes = Envelope::encode_message(msg.clone()).unwrap();
        assert_eq!(Envelope::decode_message(&bytes).unwrap(), msg);
    }

    #[test]
    fn envelope_rejects_other_version() {
        let envelope = Envelope {
            protocol_version: PROTOCOL_VERSION + 1,
            message: ProtocolMessage::Ack(tx()),
        };
        let bytes = envelope.encode().unwrap();

        match Envelope::decode(&bytes) {
            Err(ProtocolError::VersionMismatch { local, remote }) => {
                assert_eq!(local, PROTOCOL_VERSION);
                assert_eq!(remote, PROTOCOL_VERSION + 1);
            }
            other => panic!("expected version mismatch, got {other:?}"),
        }
    }

    #[test]
    fn envelope_rejects_garbage() {
        assert!(matches!(
            Envelope::decode(&[0xFF, 0x00, 0x13]),
            Err(ProtocolError::Decode(_))
        ));
    }

    proptest! {
        #[test]
        fn decode_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..128)) {
            let _ = Envelope::decode(&bytes);
        }
    }
}
