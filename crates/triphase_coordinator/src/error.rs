//! Error types for the coordinator.

use thiserror::Error;
use triphase_core::CoordinatorPhase;
use triphase_protocol::{NackReason, ParticipantId, TransactionId};

/// Result type for coordinator operations.
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Result type for transport calls.
pub type TransportResult<T> = Result<T, TransportError>;

/// Errors that can occur while a coordinator drives a transaction.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    /// A participant voted no.
    #[error("{participant} rejected {tx}")]
    VoteRejected {
        /// Transaction concerned.
        tx: TransactionId,
        /// Participant that voted no.
        participant: ParticipantId,
    },

    /// A participant did not answer before a decision was taken.
    #[error("{participant} unreachable for {tx}")]
    ParticipantUnreachable {
        /// Transaction concerned.
        tx: TransactionId,
        /// Participant that timed out or failed.
        participant: ParticipantId,
    },

    /// The transaction is past the point where it can be cancelled.
    #[error("{tx} is already committing")]
    AlreadyCommitting {
        /// Transaction concerned.
        tx: TransactionId,
    },

    /// The retry budget ran out before every participant acknowledged.
    ///
    /// The decision stands; the transaction stays pending and is resumed by
    /// recovery.
    #[error("{tx} still waiting on {pending:?} after retries")]
    CoordinatorTimeout {
        /// Transaction concerned.
        tx: TransactionId,
        /// Participants that never acknowledged.
        pending: Vec<ParticipantId>,
    },

    /// The participant list is empty or has duplicates.
    #[error("invalid participant set: {reason}")]
    InvalidParticipantSet {
        /// What is wrong with it.
        reason: String,
    },

    /// A participant broke the protocol contract.
    #[error("fatal inconsistency in {tx} at {participant}: {reason}")]
    FatalInconsistency {
        /// Transaction concerned.
        tx: TransactionId,
        /// Participant that reported or caused it.
        participant: ParticipantId,
        /// Details.
        reason: String,
    },

    /// No transaction with this ID is known.
    #[error("unknown transaction {0}")]
    UnknownTransaction(TransactionId),

    /// A transaction with this ID already exists.
    #[error("duplicate transaction {0}")]
    DuplicateTransaction(TransactionId),

    /// The operation does not fit the transaction's phase.
    #[error("{operation} not valid for {tx} in phase {phase}")]
    InvalidState {
        /// Transaction concerned.
        tx: TransactionId,
        /// Phase at the time of the call.
        phase: CoordinatorPhase,
        /// The rejected operation.
        operation: &'static str,
    },

    /// Log or state machine error.
    #[error("core error: {0}")]
    Core(#[from] triphase_core::CoreError),
}

impl CoordinatorError {
    /// Returns true if retrying the whole operation later can help.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoordinatorError::CoordinatorTimeout { .. })
    }
}

/// Errors from delivering one message to one participant.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The participant could not be reached.
    #[error("participant {participant} unreachable: {message}")]
    Unreachable {
        /// Target participant.
        participant: ParticipantId,
        /// Error message.
        message: String,
    },

    /// No answer within the deadline.
    #[error("participant {0} timed out")]
    Timeout(ParticipantId),

    /// The answer could not be decoded or was the wrong kind.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The participant answered with a `Nack`.
    #[error("participant {participant} rejected request: {reason}")]
    Rejected {
        /// Participant that answered.
        participant: ParticipantId,
        /// Why.
        reason: NackReason,
    },
}

impl TransportError {
    /// Creates an unreachable error.
    pub fn unreachable(participant: &ParticipantId, message: impl Into<String>) -> Self {
        Self::Unreachable {
            participant: participant.clone(),
            message: message.into(),
        }
    }

    /// Returns true if delivery may succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unreachable { .. } | TransportError::Timeout(_) => true,
            TransportError::Rejected { reason, .. } => *reason == NackReason::InvalidState,
            TransportError::Protocol(_) => false,
        }
    }

    /// Returns true if the participant reported a contract violation.
    pub fn is_inconsistency(&self) -> bool {
        matches!(
            self,
            TransportError::Rejected {
                reason: NackReason::Inconsistent,
                ..
            }
        )
    }
}

impl From<triphase_protocol::ProtocolError> for TransportError {
    fn from(e: triphase_protocol::ProtocolError) -> Self {
        TransportError::Protocol(e.to_string())
    }
}
