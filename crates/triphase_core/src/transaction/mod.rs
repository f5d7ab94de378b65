//! Transaction state machines.
//!
//! - [`Transaction`] is the coordinator's view: phase, votes, acks, outcome.
//! - [`LocalTransaction`] is a participant's view of the same transaction.

mod coordinator;
mod local;

pub use coordinator::{
    validate_participants, AbortCause, AckState, CoordinatorPhase, Outcome, ParticipantRecord,
    Transaction, VoteState,
};
pub use local::{LocalTransaction, ParticipantPhase, ReservationHandle};
