//! Error types for participants.

use thiserror::Error;
use triphase_core::ParticipantPhase;
use triphase_protocol::{NackReason, TransactionId};

/// Result type for participant operations.
pub type ParticipantResult<T> = Result<T, ParticipantError>;

/// Errors reported by a resource manager.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("resource error: {0}")]
pub struct ResourceError(pub String);

impl ResourceError {
    /// Creates a resource error.
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that can occur while a participant handles a request.
#[derive(Error, Debug)]
pub enum ParticipantError {
    /// Log or state machine error.
    #[error("core error: {0}")]
    Core(#[from] triphase_core::CoreError),

    /// Wire encoding error.
    #[error("protocol error: {0}")]
    Protocol(#[from] triphase_protocol::ProtocolError),

    /// The wrapped resource manager failed.
    #[error(transparent)]
    Resource(#[from] ResourceError),

    /// The request is not valid in the transaction's current phase.
    #[error("{request} not valid for {tx} in phase {phase}")]
    InvalidState {
        /// Transaction concerned.
        tx: TransactionId,
        /// Local phase at the time of the request.
        phase: ParticipantPhase,
        /// The rejected request.
        request: &'static str,
    },

    /// The transaction was already aborted locally.
    #[error("{0} already aborted")]
    AlreadyAborted(TransactionId),

    /// The participant cannot honour a decision it is bound by.
    ///
    /// Needs manual reconciliation; never retried away.
    #[error("fatal inconsistency for {tx}: {reason}")]
    FatalInconsistency {
        /// Transaction concerned.
        tx: TransactionId,
        /// What went wrong.
        reason: String,
    },

    /// Malformed wire request.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl ParticipantError {
    /// Returns the reason to report in a `Nack`.
    pub fn nack_reason(&self) -> NackReason {
        match self {
            ParticipantError::AlreadyAborted(_) => NackReason::AlreadyAborted,
            ParticipantError::FatalInconsistency { .. } => NackReason::Inconsistent,
            _ => NackReason::InvalidState,
        }
    }

    /// Returns true if the error needs manual reconciliation.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ParticipantError::FatalInconsistency { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nack_reasons() {
        let tx = TransactionId::from_u128(1);
        assert_eq!(
            ParticipantError::AlreadyAborted(tx).nack_reason(),
            NackReason::AlreadyAborted
        );
        let fatal = ParticipantError::FatalInconsistency {
            tx,
            reason: "commit refused".into(),
        };
        assert_eq!(fatal.nack_reason(), NackReason::Inconsistent);
        assert!(fatal.is_fatal());
        assert_eq!(
            ParticipantError::InvalidRequest("bad path".into()).nack_reason(),
            NackReason::InvalidState
        );
    }

    #[test]
    fn invalid_state_display() {
        let err = ParticipantError::InvalidState {
            tx: TransactionId::from_u128(2),
            phase: ParticipantPhase::Prepared,
            request: "commit",
        };
        let msg = err.to_string();
        assert!(msg.contains("commit"));
        assert!(msg.contains("prepared"));
    }

    #[test]
    fn already_aborted_display_names_transaction() {
        let tx = TransactionId::from_u128(3);
        let msg = ParticipantError::AlreadyAborted(tx).to_string();
        assert!(msg.contains(&tx.to_string()));
        assert!(msg.ends_with("already aborted"));
    }
}
