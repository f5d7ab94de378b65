//! Participant-local transaction state.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use triphase_protocol::TransactionId;

/// Phase of a transaction at one participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantPhase {
    /// Not yet asked to prepare.
    Idle,
    /// Resources reserved, voted yes.
    Prepared,
    /// Durably promised to commit unless told to abort.
    Precommitted,
    /// Reservation finalized.
    Committed,
    /// Reservation released.
    Aborted,
}

impl ParticipantPhase {
    /// Returns true if the state machine permits moving to `next`.
    #[must_use]
    pub fn can_transition_to(self, next: ParticipantPhase) -> bool {
        use ParticipantPhase::*;
        matches!(
            (self, next),
            (Idle, Prepared)
                | (Prepared, Precommitted)
                | (Precommitted, Committed)
                | (Idle, Aborted)
                | (Prepared, Aborted)
                | (Precommitted, Aborted)
        )
    }

    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, ParticipantPhase::Committed | ParticipantPhase::Aborted)
    }

    /// Returns true if the participant may abort without being told to.
    ///
    /// Once precommitted it may not.
    #[must_use]
    pub fn may_abort_unilaterally(self) -> bool {
        matches!(self, ParticipantPhase::Idle | ParticipantPhase::Prepared)
    }
}

impl fmt::Display for ParticipantPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ParticipantPhase::Idle => "idle",
            ParticipantPhase::Prepared => "prepared",
            ParticipantPhase::Precommitted => "precommitted",
            ParticipantPhase::Committed => "committed",
            ParticipantPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Opaque handle to resources a resource manager reserved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReservationHandle(pub Vec<u8>);

impl ReservationHandle {
    /// Wraps raw bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Returns the raw bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One transaction as seen by one participant.
#[derive(Debug, Clone)]
pub struct LocalTransaction {
    id: TransactionId,
    phase: ParticipantPhase,
    reservation: Option<ReservationHandle>,
    last_contact: Instant,
}

impl LocalTransaction {
    /// Creates an `Idle` transaction first seen at `now`.
    #[must_use]
    pub fn new(id: TransactionId, now: Instant) -> Self {
        Self {
            id,
            phase: ParticipantPhase::Idle,
            reservation: None,
            last_contact: now,
        }
    }

    /// Rebuilds a transaction from replayed log state.
    #[must_use]
    pub fn restored(
        id: TransactionId,
        phase: ParticipantPhase,
        reservation: Option<ReservationHandle>,
        now: Instant,
    ) -> Self {
        Self {
            id,
            phase,
            reservation,
            last_contact: now,
        }
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the local phase.
    #[must_use]
    pub fn phase(&self) -> ParticipantPhase {
        self.phase
    }

    /// Returns the reservation handle, if any.
    #[must_use]
    pub fn reservation(&self) -> Option<&ReservationHandle> {
        self.reservation.as_ref()
    }

    /// Stores the reservation produced by `prepare`.
    pub fn set_reservation(&mut self, handle: ReservationHandle) {
        self.reservation = Some(handle);
    }

    /// Returns the instant of the last coordinator message.
    #[must_use]
    pub fn last_contact(&self) -> Instant {
        self.last_contact
    }

    /// Notes a coordinator message at `now`.
    pub fn touch(&mut self, now: Instant) {
        self.last_contact = now;
    }

    /// Returns how long the coordinator has been silent.
    #[must_use]
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_contact)
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the state machine forbids the move.
    pub fn transition(&mut self, next: ParticipantPhase) -> CoreResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(CoreError::invalid_transition(self.phase, next));
        }
        self.phase = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local() -> LocalTransaction {
        LocalTransaction::new(TransactionId::from_u128(3), Instant::now())
    }

    #[test]
    fn commit_path() {
        let mut t = local();
        t.transition(ParticipantPhase::Prepared).unwrap();
        t.transition(ParticipantPhase::Precommitted).unwrap();
        t.transition(ParticipantPhase::Committed).unwrap();
        assert!(t.phase().is_terminal());
    }

    #[test]
    fn commit_requires_precommit() {
        let mut t = local();
        t.transition(ParticipantPhase::Prepared).unwrap();
        assert!(matches!(
            t.transition(ParticipantPhase::Committed),
            Err(CoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn terminal_states_are_final() {
        let mut t = local();
        t.transition(ParticipantPhase::Aborted).unwrap();
        assert!(t.transition(ParticipantPhase::Prepared).is_err());
        assert!(t.transition(ParticipantPhase::Committed).is_err());
    }

    #[test]
    fn unilateral_abort_only_before_precommit() {
        assert!(ParticipantPhase::Idle.may_abort_unilaterally());
        assert!(ParticipantPhase::Prepared.may_abort_unilaterally());
        assert!(!ParticipantPhase::Precommitted.may_abort_unilaterally());
        assert!(!ParticipantPhase::Committed.may_abort_unilaterally());
    }

    #[test]
    fn idle_time_tracks_touch() {
        let start = Instant::now();
        let mut t = LocalTransaction::new(TransactionId::from_u128(1), start);
        let later = start + Duration::from_secs(5);
        assert_eq!(t.idle_for(later), Duration::from_secs(5));

        t.touch(later);
        assert_eq!(t.idle_for(later), Duration::ZERO);
        assert_eq!(t.idle_for(start), Duration::ZERO);
    }
}
