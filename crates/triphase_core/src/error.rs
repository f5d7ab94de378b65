//! Error types for triphase core.

use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in the logs and state machines.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Durable store error.
    #[error("storage error: {0}")]
    Storage(#[from] triphase_storage::StorageError),

    /// Log is corrupted or invalid.
    #[error("log corruption: {message}")]
    LogCorruption {
        /// Description of the corruption.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A log record could not be encoded.
    #[error("encode error: {message}")]
    Encode {
        /// Description of the failure.
        message: String,
    },

    /// A state machine was asked for a transition it does not allow.
    #[error("invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Phase before the attempted transition.
        from: String,
        /// Requested phase.
        to: String,
    },

    /// An abort was requested after a participant acknowledged precommit.
    #[error("cannot abort {tx}: a participant already acknowledged precommit")]
    CannotAbort {
        /// The transaction concerned.
        tx: String,
    },

    /// The participant list of a new transaction is unusable.
    #[error("invalid participant set: {reason}")]
    InvalidParticipantSet {
        /// Why the list was rejected.
        reason: String,
    },

    /// Operation not permitted in current state.
    #[error("invalid operation: {message}")]
    InvalidOperation {
        /// Description of why operation is invalid.
        message: String,
    },
}

impl CoreError {
    /// Creates a log corruption error.
    pub fn log_corruption(message: impl Into<String>) -> Self {
        Self::LogCorruption {
            message: message.into(),
        }
    }

    /// Creates an encode error.
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Creates an invalid transition error.
    pub fn invalid_transition(from: impl std::fmt::Debug, to: impl std::fmt::Debug) -> Self {
        Self::InvalidTransition {
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        }
    }

    /// Creates an invalid participant set error.
    pub fn invalid_participant_set(reason: impl Into<String>) -> Self {
        Self::InvalidParticipantSet {
            reason: reason.into(),
        }
    }

    /// Creates an invalid operation error.
    pub fn invalid_operation(message: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CoreError::log_corruption("bad magic");
        assert_eq!(err.to_string(), "log corruption: bad magic");

        let err = CoreError::ChecksumMismatch {
            expected: 0x1234_5678,
            actual: 0xDEAD_BEEF,
        };
        assert_eq!(
            err.to_string(),
            "checksum mismatch: expected 12345678, got deadbeef"
        );
    }

    #[test]
    fn invalid_transition_uses_debug_names() {
        #[derive(Debug)]
        enum Phase {
            Voting,
            Committed,
        }
        let err = CoreError::invalid_transition(Phase::Voting, Phase::Committed);
        assert_eq!(err.to_string(), "invalid transition from Voting to Committed");
    }
}
