//! Coordinator-side transaction state.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Instant;
use triphase_protocol::{Decision, ParticipantId, TransactionId, Vote};

/// Phase of a transaction as the coordinator drives it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    /// Allocated, nothing sent yet.
    Init,
    /// Prepare requests are out.
    Voting,
    /// Every participant voted yes; precommit requests are out.
    PreCommitting,
    /// Commit is decided and being delivered.
    Committing,
    /// Abort is decided and being delivered.
    Aborting,
    /// Every participant acknowledged commit.
    Committed,
    /// Every participant acknowledged abort.
    Aborted,
}

impl CoordinatorPhase {
    /// Returns true if the state machine permits moving to `next`.
    ///
    /// `PreCommitting -> Aborting` and `PreCommitting -> Committing` are
    /// listed here, but [`Transaction`] only takes them while
    /// [`Transaction::can_abort`] and [`Transaction::can_commit`] hold.
    #[must_use]
    pub fn can_transition_to(self, next: CoordinatorPhase) -> bool {
        use CoordinatorPhase::*;
        matches!(
            (self, next),
            (Init, Voting)
                | (Voting, PreCommitting)
                | (PreCommitting, Committing)
                | (Committing, Committed)
                | (Init, Aborting)
                | (Voting, Aborting)
                | (PreCommitting, Aborting)
                | (Aborting, Aborted)
        )
    }

    /// Returns true for `Committed` and `Aborted`.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, CoordinatorPhase::Committed | CoordinatorPhase::Aborted)
    }

    /// Returns the final decision once one has been taken.
    #[must_use]
    pub fn decision(self) -> Option<Decision> {
        match self {
            CoordinatorPhase::Committing | CoordinatorPhase::Committed => Some(Decision::Commit),
            CoordinatorPhase::Aborting | CoordinatorPhase::Aborted => Some(Decision::Abort),
            _ => None,
        }
    }
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CoordinatorPhase::Init => "init",
            CoordinatorPhase::Voting => "voting",
            CoordinatorPhase::PreCommitting => "pre_committing",
            CoordinatorPhase::Committing => "committing",
            CoordinatorPhase::Aborting => "aborting",
            CoordinatorPhase::Committed => "committed",
            CoordinatorPhase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// Overall outcome of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Outcome {
    /// No terminal state reached yet.
    Pending,
    /// Committed everywhere.
    Committed,
    /// Aborted everywhere.
    Aborted,
}

/// Why a transaction was aborted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AbortCause {
    /// A participant voted no.
    VoteRejected(ParticipantId),
    /// A participant timed out or could not be reached before any
    /// precommit acknowledgment.
    ParticipantUnreachable(ParticipantId),
    /// A participant reported it had already aborted on its own.
    ParticipantAborted(ParticipantId),
    /// The caller cancelled the transaction.
    Cancelled,
    /// The coordinator restarted before the vote completed.
    Recovered,
}

impl fmt::Display for AbortCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortCause::VoteRejected(p) => write!(f, "{p} voted no"),
            AbortCause::ParticipantUnreachable(p) => write!(f, "{p} unreachable"),
            AbortCause::ParticipantAborted(p) => write!(f, "{p} already aborted"),
            AbortCause::Cancelled => f.write_str("cancelled"),
            AbortCause::Recovered => f.write_str("aborted during recovery"),
        }
    }
}

/// Last vote the coordinator received from a participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteState {
    /// No vote yet.
    None,
    /// Voted yes.
    Yes,
    /// Voted no.
    No,
}

impl From<Vote> for VoteState {
    fn from(vote: Vote) -> Self {
        match vote {
            Vote::Yes => VoteState::Yes,
            Vote::No => VoteState::No,
        }
    }
}

/// Last phase a participant acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckState {
    /// Nothing acknowledged.
    None,
    /// Acknowledged prepare (voted yes).
    Prepared,
    /// Acknowledged precommit.
    Precommitted,
    /// Acknowledged the commit decision.
    Committed,
    /// Acknowledged the abort decision, or refused precommit because it
    /// had already aborted on its own.
    Aborted,
}

/// What the coordinator knows about one participant of one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParticipantRecord {
    /// Participant identity.
    pub participant: ParticipantId,
    /// Last vote.
    pub vote: VoteState,
    /// Last acknowledgment.
    pub ack: AckState,
    /// Last time the participant answered.
    pub last_contact: Option<Instant>,
}

impl ParticipantRecord {
    fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            vote: VoteState::None,
            ack: AckState::None,
            last_contact: None,
        }
    }

    /// Returns true once the participant acknowledged precommit (or commit,
    /// which implies it).
    #[must_use]
    pub fn has_precommitted(&self) -> bool {
        matches!(self.ack, AckState::Precommitted | AckState::Committed)
    }

    /// Returns true once the participant acknowledged `decision`.
    #[must_use]
    pub fn has_acked_decision(&self, decision: Decision) -> bool {
        match decision {
            Decision::Commit => self.ack == AckState::Committed,
            Decision::Abort => self.ack == AckState::Aborted,
        }
    }
}

/// A distributed transaction as the coordinator sees it.
///
/// Only the coordinator task driving the transaction mutates it.
#[derive(Debug, Clone)]
pub struct Transaction {
    id: TransactionId,
    phase: CoordinatorPhase,
    records: Vec<ParticipantRecord>,
    outcome: Outcome,
    abort_cause: Option<AbortCause>,
    completed_at: Option<Instant>,
}

impl Transaction {
    /// Creates a transaction in `Init`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParticipantSet` if `participants` is empty or names a
    /// participant twice.
    pub fn new(id: TransactionId, participants: Vec<ParticipantId>) -> CoreResult<Self> {
        validate_participants(&participants)?;
        Ok(Self {
            id,
            phase: CoordinatorPhase::Init,
            records: participants.into_iter().map(ParticipantRecord::new).collect(),
            outcome: Outcome::Pending,
            abort_cause: None,
            completed_at: None,
        })
    }

    /// Rebuilds a transaction from replayed log state.
    ///
    /// # Errors
    ///
    /// Returns `InvalidParticipantSet` if the logged participant list is
    /// unusable.
    pub fn recovered(
        id: TransactionId,
        participants: Vec<ParticipantId>,
        phase: CoordinatorPhase,
        precommit_acked: &HashSet<ParticipantId>,
        abort_cause: Option<AbortCause>,
    ) -> CoreResult<Self> {
        let mut tx = Self::new(id, participants)?;
        tx.phase = phase;
        tx.abort_cause = abort_cause;
        for record in &mut tx.records {
            if precommit_acked.contains(&record.participant) {
                record.vote = VoteState::Yes;
                record.ack = AckState::Precommitted;
            }
        }
        Ok(tx)
    }

    /// Returns the transaction ID.
    #[must_use]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    /// Returns the current phase.
    #[must_use]
    pub fn phase(&self) -> CoordinatorPhase {
        self.phase
    }

    /// Returns the outcome.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Returns the abort cause, if the transaction is aborting or aborted.
    #[must_use]
    pub fn abort_cause(&self) -> Option<&AbortCause> {
        self.abort_cause.as_ref()
    }

    /// Returns when the transaction reached its terminal state.
    #[must_use]
    pub fn completed_at(&self) -> Option<Instant> {
        self.completed_at
    }

    /// Returns the participants in submission order.
    pub fn participants(&self) -> impl Iterator<Item = &ParticipantId> {
        self.records.iter().map(|r| &r.participant)
    }

    /// Returns every participant record in submission order.
    #[must_use]
    pub fn records(&self) -> &[ParticipantRecord] {
        &self.records
    }

    /// Returns the record for one participant.
    #[must_use]
    pub fn record(&self, participant: &ParticipantId) -> Option<&ParticipantRecord> {
        self.records.iter().find(|r| &r.participant == participant)
    }

    /// Returns true while an abort decision is still safe.
    ///
    /// That is the case until the first precommit ack, and afterwards only
    /// if some participant has already aborted on its own: commit can then
    /// never complete, and no `Commit` decision has gone out because
    /// `Committing` waits for every precommit ack. Every abort transition is
    /// checked against this.
    #[must_use]
    pub fn can_abort(&self) -> bool {
        match self.phase {
            CoordinatorPhase::Init | CoordinatorPhase::Voting | CoordinatorPhase::PreCommitting => {
                !self.records.iter().any(ParticipantRecord::has_precommitted)
                    || self.has_local_abort()
            }
            CoordinatorPhase::Aborting | CoordinatorPhase::Aborted => true,
            CoordinatorPhase::Committing | CoordinatorPhase::Committed => false,
        }
    }

    /// Returns true once every participant has acknowledged precommit.
    ///
    /// The move to `Committing` is checked against this, so a `Commit`
    /// decision never reaches a participant while another one could still
    /// refuse precommit.
    #[must_use]
    pub fn can_commit(&self) -> bool {
        self.records.iter().all(ParticipantRecord::has_precommitted)
    }

    /// Returns true if a participant reported that it had already aborted.
    #[must_use]
    pub fn has_local_abort(&self) -> bool {
        self.records.iter().any(|r| r.ack == AckState::Aborted)
    }

    /// Moves to `next`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if the state machine forbids the move and
    /// `CannotAbort` if `next` is `Aborting` after a precommit ack.
    pub fn transition(&mut self, next: CoordinatorPhase) -> CoreResult<()> {
        if !self.phase.can_transition_to(next) {
            return Err(CoreError::invalid_transition(self.phase, next));
        }
        if next == CoordinatorPhase::Aborting && !self.can_abort() {
            return Err(CoreError::CannotAbort {
                tx: self.id.to_string(),
            });
        }
        if next == CoordinatorPhase::Committing && !self.can_commit() {
            return Err(CoreError::invalid_operation(format!(
                "{} cannot commit, {} participants have not precommitted",
                self.id,
                self.awaiting_precommit().len()
            )));
        }
        self.phase = next;
        Ok(())
    }

    /// Moves to `Aborting`, remembering why.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::transition`].
    pub fn begin_abort(&mut self, cause: AbortCause) -> CoreResult<()> {
        self.transition(CoordinatorPhase::Aborting)?;
        self.abort_cause = Some(cause);
        Ok(())
    }

    /// Moves from `Committing`/`Aborting` to the matching terminal phase and
    /// records the outcome.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTransition` if no decision has been taken.
    pub fn finish(&mut self, now: Instant) -> CoreResult<Outcome> {
        let (terminal, outcome) = match self.phase {
            CoordinatorPhase::Committing => (CoordinatorPhase::Committed, Outcome::Committed),
            CoordinatorPhase::Aborting => (CoordinatorPhase::Aborted, Outcome::Aborted),
            other => return Err(CoreError::invalid_transition(other, "terminal")),
        };
        self.transition(terminal)?;
        self.outcome = outcome;
        self.completed_at = Some(now);
        Ok(outcome)
    }

    /// Records a phase-1 vote.
    pub fn record_vote(&mut self, participant: &ParticipantId, vote: Vote, now: Instant) {
        if let Some(record) = self.record_mut(participant) {
            record.vote = vote.into();
            if vote.is_yes() {
                record.ack = AckState::Prepared;
            }
            record.last_contact = Some(now);
        }
    }

    /// Records an acknowledgment.
    pub fn record_ack(&mut self, participant: &ParticipantId, ack: AckState, now: Instant) {
        if let Some(record) = self.record_mut(participant) {
            record.ack = ack;
            record.last_contact = Some(now);
        }
    }

    /// Returns true if every participant voted yes.
    #[must_use]
    pub fn all_voted_yes(&self) -> bool {
        self.records.iter().all(|r| r.vote == VoteState::Yes)
    }

    /// Returns the first participant without a yes vote, and why.
    ///
    /// A `No` vote wins over a missing one.
    #[must_use]
    pub fn missing_vote(&self) -> Option<AbortCause> {
        if let Some(r) = self.records.iter().find(|r| r.vote == VoteState::No) {
            return Some(AbortCause::VoteRejected(r.participant.clone()));
        }
        self.records
            .iter()
            .find(|r| r.vote == VoteState::None)
            .map(|r| AbortCause::ParticipantUnreachable(r.participant.clone()))
    }

    /// Returns the number of participants that acknowledged precommit.
    #[must_use]
    pub fn precommit_acks(&self) -> usize {
        self.records.iter().filter(|r| r.has_precommitted()).count()
    }

    /// Returns participants that still owe a precommit acknowledgment.
    #[must_use]
    pub fn awaiting_precommit(&self) -> Vec<ParticipantId> {
        self.records
            .iter()
            .filter(|r| !r.has_precommitted())
            .map(|r| r.participant.clone())
            .collect()
    }

    /// Returns participants that still owe an acknowledgment of `decision`.
    #[must_use]
    pub fn awaiting_decision(&self, decision: Decision) -> Vec<ParticipantId> {
        self.records
            .iter()
            .filter(|r| !r.has_acked_decision(decision))
            .map(|r| r.participant.clone())
            .collect()
    }

    fn record_mut(&mut self, participant: &ParticipantId) -> Option<&mut ParticipantRecord> {
        self.records.iter_mut().find(|r| &r.participant == participant)
    }
}

/// Checks that a participant list is non-empty and free of duplicates.
///
/// # Errors
///
/// Returns `InvalidParticipantSet` describing the problem.
pub fn validate_participants(participants: &[ParticipantId]) -> CoreResult<()> {
    if participants.is_empty() {
        return Err(CoreError::invalid_participant_set("no participants"));
    }

    let mut seen = HashSet::with_capacity(participants.len());
    for participant in participants {
        if !seen.insert(participant) {
            return Err(CoreError::invalid_participant_set(format!(
                "duplicate participant {participant}"
            )));
        }
    }

    Ok(())
}
