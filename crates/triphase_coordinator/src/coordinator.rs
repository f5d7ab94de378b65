//! The coordinator state machine.
//!
//! A [`Coordinator`] drives each transaction through three phases:
//!
//! 1. **Voting**: `Prepare` goes to every participant. Unanimous `Yes`
//!    proceeds; any `No`, timeout or failure aborts.
//! 2. **Pre-committing**: `PreCommit` goes to every participant. Once one of
//!    them acknowledges, the outcome is fixed to commit, unless another one
//!    reports it already aborted on its own. `Commit` is only decided once
//!    every participant has acknowledged.
//! 3. **Deciding**: the decision is delivered until every participant
//!    acknowledges it, with backoff between attempts.
//!
//! Every phase change is written to the coordinator log before the messages
//! that depend on it are sent, so [`Coordinator::recover_on_restart`] can
//! always finish what a crashed coordinator started.

use crate::config::CoordinatorConfig;
use crate::error::{CoordinatorError, CoordinatorResult, TransportError, TransportResult};
use crate::stats::{CoordinatorStats, StatsSnapshot};
use crate::transport::ParticipantTransport;
use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use triphase_core::{
    AbortCause, AckState, CoordinatorLog, CoordinatorPhase, CoreError, Outcome, Transaction,
};
use triphase_protocol::{Decision, NackReason, ParticipantId, TransactionId, Vote};
use triphase_storage::DurableStore;

/// Refers to a transaction begun on a [`Coordinator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionHandle {
    id: TransactionId,
}

impl TransactionHandle {
    /// Returns the transaction ID.
    pub fn id(&self) -> TransactionId {
        self.id
    }
}

/// What phase 1 concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    /// Every participant voted yes; run phase 2 next.
    Proceed,
    /// The transaction is decided; run phase 3 with this decision.
    Decided(Decision),
}

/// Final result of a transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionOutcome {
    /// Transaction ID.
    pub tx: TransactionId,
    /// Committed or aborted.
    pub outcome: Outcome,
    /// Why it aborted, if it did.
    pub abort_cause: Option<AbortCause>,
}

impl TransactionOutcome {
    /// Returns true if the transaction committed.
    pub fn is_committed(&self) -> bool {
        self.outcome == Outcome::Committed
    }

    /// Turns a participant-caused abort into the matching error.
    ///
    /// Commits, cancellations and recovery aborts pass through unchanged.
    ///
    /// # Errors
    ///
    /// `VoteRejected` for a `No` vote or a participant that had already
    /// aborted, `ParticipantUnreachable` for a timeout or transport failure.
    pub fn into_result(self) -> CoordinatorResult<Self> {
        match &self.abort_cause {
            Some(AbortCause::VoteRejected(p) | AbortCause::ParticipantAborted(p)) => {
                Err(CoordinatorError::VoteRejected {
                    tx: self.tx,
                    participant: p.clone(),
                })
            }
            Some(AbortCause::ParticipantUnreachable(p)) => {
                Err(CoordinatorError::ParticipantUnreachable {
                    tx: self.tx,
                    participant: p.clone(),
                })
            }
            _ => Ok(self),
        }
    }
}

/// What [`Coordinator::recover_on_restart`] did.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Transactions driven to a terminal outcome.
    pub resolved: Vec<TransactionOutcome>,
    /// Transactions that are still pending, with the reason.
    pub unresolved: Vec<(TransactionId, CoordinatorError)>,
}

struct Slot {
    /// Held by whoever is driving the transaction.
    driver: tokio::sync::Mutex<()>,
    state: Mutex<Transaction>,
}

impl Slot {
    fn new(tx: Transaction) -> Arc<Self> {
        Arc::new(Self {
            driver: tokio::sync::Mutex::new(()),
            state: Mutex::new(tx),
        })
    }

    fn outcome(&self) -> TransactionOutcome {
        slot_outcome(&self.state.lock())
    }
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Runs `call` against every target concurrently, each under `deadline`.
///
/// Results come back in target order.
async fn fan_out<'a, F, Fut, O>(
    targets: &'a [ParticipantId],
    deadline: Duration,
    call: F,
) -> Vec<(&'a ParticipantId, TransportResult<O>)>
where
    F: Fn(&'a ParticipantId) -> Fut,
    Fut: Future<Output = TransportResult<O>>,
{
    join_all(targets.iter().map(|p| {
        let pending = call(p);
        async move {
            let result = match tokio::time::timeout(deadline, pending).await {
                Ok(result) => result,
                Err(_) => Err(TransportError::Timeout(p.clone())),
            };
            (p, result)
        }
    }))
    .await
}

fn failure_cause(participant: &ParticipantId, error: &TransportError) -> AbortCause {
    match error {
        TransportError::Rejected {
            reason: NackReason::AlreadyAborted,
            ..
        } => AbortCause::ParticipantAborted(participant.clone()),
        _ => AbortCause::ParticipantUnreachable(participant.clone()),
    }
}

fn is_local_abort(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::Rejected {
            reason: NackReason::AlreadyAborted,
            ..
        }
    )
}

/// True for a participant refusing something it is bound to accept.
fn is_refusal(error: &TransportError) -> bool {
    matches!(
        error,
        TransportError::Rejected {
            reason: NackReason::AlreadyAborted | NackReason::Inconsistent,
            ..
        }
    )
}

/// A three-phase commit coordinator.
///
/// Each transaction has a single driver at a time. Different transactions
/// run in parallel.
pub struct Coordinator<T> {
    config: CoordinatorConfig,
    transport: T,
    log: CoordinatorLog,
    transactions: RwLock<HashMap<TransactionId, Arc<Slot>>>,
    stats: CoordinatorStats,
}

impl<T: ParticipantTransport> Coordinator<T> {
    /// Creates a coordinator logging to `store`.
    ///
    /// Call [`Coordinator::recover_on_restart`] before submitting new work if
    /// `store` may hold an earlier log.
    pub fn new(config: CoordinatorConfig, transport: T, store: Box<dyn DurableStore>) -> Self {
        let log = CoordinatorLog::new(store, config.sync_on_write);
        Self {
            config,
            transport,
            log,
            transactions: RwLock::new(HashMap::new()),
            stats: CoordinatorStats::new(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Returns a snapshot of the counters.
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Returns a copy of a transaction's current state.
    pub fn transaction(&self, tx: TransactionId) -> Option<Transaction> {
        self.transactions
            .read()
            .get(&tx)
            .map(|slot| slot.state.lock().clone())
    }

    /// Returns the number of transactions held in memory.
    pub fn transaction_count(&self) -> usize {
        self.transactions.read().len()
    }

    /// Returns the coordinator log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot report its size.
    pub fn log_size(&self) -> CoordinatorResult<u64> {
        Ok(self.log.size()?)
    }

    fn slot(&self, tx: TransactionId) -> CoordinatorResult<Arc<Slot>> {
        self.transactions
            .read()
            .get(&tx)
            .cloned()
            .ok_or(CoordinatorError::UnknownTransaction(tx))
    }

    /// Begins a transaction with a fresh ID.
    ///
    /// # Errors
    ///
    /// Same as [`Coordinator::begin_transaction_with_id`].
    pub fn begin_transaction(&self, participants: Vec<ParticipantId>) -> CoordinatorResult<TransactionHandle> {
        self.begin_transaction_with_id(TransactionId::generate(), participants)
    }

    /// Begins a transaction in `Init` and logs it.
    ///
    /// # Errors
    ///
    /// - `InvalidParticipantSet` for an empty list or duplicates
    /// - `DuplicateTransaction` if `id` is already in use
    pub fn begin_transaction_with_id(
        &self,
        id: TransactionId,
        participants: Vec<ParticipantId>,
    ) -> CoordinatorResult<TransactionHandle> {
        let tx = Transaction::new(id, participants).map_err(|e| match e {
            CoreError::InvalidParticipantSet { reason } => {
                CoordinatorError::InvalidParticipantSet { reason }
            }
            other => other.into(),
        })?;

        let mut transactions = self.transactions.write();
        if transactions.contains_key(&id) {
            return Err(CoordinatorError::DuplicateTransaction(id));
        }

        let participants: Vec<ParticipantId> = tx.participants().cloned().collect();
        self.log.log_begin(id, &participants)?;
        transactions.insert(id, Slot::new(tx));
        drop(transactions);

        self.stats.record_start();
        debug!(tx = %id, participants = participants.len(), "transaction begun");
        Ok(TransactionHandle { id })
    }

    /// Runs a transaction to completion.
    ///
    /// Phase-1 failures come back as an `Aborted` outcome carrying the
    /// cause; see [`TransactionOutcome::into_result`].
    ///
    /// # Errors
    ///
    /// - `InvalidParticipantSet` for a bad participant list
    /// - `CoordinatorTimeout` if precommit or the decision could not be
    ///   delivered within the retry budget; the transaction stays pending
    /// - `FatalInconsistency` if a participant broke the protocol
    pub async fn submit(&self, participants: Vec<ParticipantId>) -> CoordinatorResult<TransactionOutcome> {
        let handle = self.begin_transaction(participants)?;
        self.drive(&handle).await
    }

    /// Runs all remaining phases of a begun transaction.
    ///
    /// # Errors
    ///
    /// Same as [`Coordinator::submit`].
    pub async fn drive(&self, handle: &TransactionHandle) -> CoordinatorResult<TransactionOutcome> {
        let slot = self.slot(handle.id)?;
        let _driver = slot.driver.lock().await;

        let (phase, all_yes) = {
            let state = slot.state.lock();
            (state.phase(), state.all_voted_yes())
        };
        let decision = match phase {
            CoordinatorPhase::Init => match self.phase1(&slot).await? {
                PhaseOutcome::Proceed => self.phase2(&slot).await?,
                PhaseOutcome::Decided(decision) => decision,
            },
            // an earlier driver was dropped while votes were out
            CoordinatorPhase::Voting if !all_yes => self.abort_unfinished_vote(&slot)?,
            CoordinatorPhase::Voting | CoordinatorPhase::PreCommitting => self.phase2(&slot).await?,
            CoordinatorPhase::Committed | CoordinatorPhase::Aborted => return Ok(slot.outcome()),
            CoordinatorPhase::Committing => Decision::Commit,
            CoordinatorPhase::Aborting => Decision::Abort,
        };
        self.phase3(&slot, decision).await
    }

    /// Phase 1: collects votes.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the transaction is in `Init`.
    pub async fn run_phase1(&self, handle: &TransactionHandle) -> CoordinatorResult<PhaseOutcome> {
        let slot = self.slot(handle.id)?;
        let _driver = slot.driver.lock().await;
        self.phase1(&slot).await
    }

    /// Phase 2: distributes precommit.
    ///
    /// Returns the decision phase 3 must deliver.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if phase 1 has not passed
    /// - `CoordinatorTimeout` if a participant never acknowledged precommit
    ///   after another one did; the transaction stays in `PreCommitting`
    /// - `FatalInconsistency` if a participant reports a broken contract
    pub async fn run_phase2(&self, handle: &TransactionHandle) -> CoordinatorResult<Decision> {
        let slot = self.slot(handle.id)?;
        let _driver = slot.driver.lock().await;
        self.phase2(&slot).await
    }

    /// Phase 3: delivers `decision` until every participant acknowledges.
    ///
    /// An undecided transaction is decided here if `decision` is allowed:
    /// abort only while no participant has precommitted, commit only once
    /// every participant has.
    ///
    /// # Errors
    ///
    /// - `InvalidState` if `decision` contradicts the recorded one
    /// - `CoordinatorTimeout` if the retry budget runs out
    /// - `FatalInconsistency` if a participant cannot apply the decision
    pub async fn run_phase3(
        &self,
        handle: &TransactionHandle,
        decision: Decision,
    ) -> CoordinatorResult<TransactionOutcome> {
        let slot = self.slot(handle.id)?;
        let _driver = slot.driver.lock().await;
        self.phase3(&slot, decision).await
    }

    /// Cancels a transaction that has not reached pre-commit.
    ///
    /// Waits for any active driver to finish and returns the final outcome.
    ///
    /// # Errors
    ///
    /// - `AlreadyCommitting` once precommit requests may have gone out
    /// - `UnknownTransaction` for an unknown ID
    pub async fn cancel(&self, tx: TransactionId) -> CoordinatorResult<TransactionOutcome> {
        let slot = self.slot(tx)?;

        loop {
            let phase = slot.state.lock().phase();
            match phase {
                CoordinatorPhase::Init | CoordinatorPhase::Voting => {
                    let cause = Some(AbortCause::Cancelled);
                    if self.advance_from(&slot, phase, CoordinatorPhase::Aborting, cause)? {
                        info!(tx = %tx, from = %phase, "transaction cancelled");
                        break;
                    }
                }
                CoordinatorPhase::Aborting | CoordinatorPhase::Aborted => break,
                _ => return Err(CoordinatorError::AlreadyCommitting { tx }),
            }
        }

        let _driver = slot.driver.lock().await;
        self.phase3(&slot, Decision::Abort).await
    }

    /// Resumes every transaction the log shows as unfinished.
    ///
    /// - `Init` or `Voting`: abort; no participant can have precommitted
    /// - `PreCommitting`: run phase 2 again for the participants without a
    ///   logged ack; this commits unless one of them already aborted
    /// - `Committing` or `Aborting`: deliver the logged decision
    ///
    /// Votes are never collected again.
    ///
    /// # Errors
    ///
    /// Returns an error only if the log cannot be replayed. Per-transaction
    /// failures are listed in the report.
    pub async fn recover_on_restart(&self) -> CoordinatorResult<RecoveryReport> {
        let logged = self.log.in_flight()?;
        let mut slots = Vec::with_capacity(logged.len());

        {
            let mut transactions = self.transactions.write();
            for entry in logged {
                if transactions.contains_key(&entry.id) {
                    continue;
                }
                let tx = Transaction::recovered(
                    entry.id,
                    entry.participants,
                    entry.phase,
                    &entry.precommit_acked,
                    entry.abort_cause,
                )?;
                let slot = Slot::new(tx);
                transactions.insert(entry.id, Arc::clone(&slot));
                slots.push(slot);
            }
        }

        info!(transactions = slots.len(), "recovering coordinator log");

        let results = join_all(slots.iter().map(|slot| async move {
            self.stats.record_recovered();
            let _driver = slot.driver.lock().await;
            let tx = slot.state.lock().id();
            (tx, self.resume(slot).await)
        }))
        .await;

        let mut report = RecoveryReport::default();
        for (tx, result) in results {
            match result {
                Ok(outcome) => report.resolved.push(outcome),
                Err(e) => {
                    warn!(tx = %tx, error = %e, "transaction still pending after recovery");
                    report.unresolved.push((tx, e));
                }
            }
        }
        Ok(report)
    }

    async fn resume(&self, slot: &Slot) -> CoordinatorResult<TransactionOutcome> {
        let (tx, phase, acks) = {
            let state = slot.state.lock();
            (state.id(), state.phase(), state.precommit_acks())
        };
        debug!(tx = %tx, %phase, acks, "resuming");

        let decision = match phase {
            CoordinatorPhase::Init | CoordinatorPhase::Voting => {
                let cause = Some(AbortCause::Recovered);
                if !self.advance_from(slot, phase, CoordinatorPhase::Aborting, cause)? {
                    debug!(tx = %tx, "cancelled during recovery");
                }
                Decision::Abort
            }
            CoordinatorPhase::PreCommitting => self.phase2(slot).await?,
            CoordinatorPhase::Committing | CoordinatorPhase::Committed => Decision::Commit,
            CoordinatorPhase::Aborting | CoordinatorPhase::Aborted => Decision::Abort,
        };
        self.phase3(slot, decision).await
    }

    /// Drops finished transactions older than `completed_retention` and
    /// rewrites the log without the records of ended transactions.
    ///
    /// Returns how many transactions were dropped from memory.
    ///
    /// # Errors
    ///
    /// Returns an error if log compaction fails.
    pub fn collect_garbage(&self) -> CoordinatorResult<usize> {
        let current = now();
        let retention = self.config.completed_retention;

        let removed = {
            let mut transactions = self.transactions.write();
            let before = transactions.len();
            transactions.retain(|_, slot| {
                let state = slot.state.lock();
                match state.completed_at() {
                    Some(at) => current.saturating_duration_since(at) < retention,
                    None => true,
                }
            });
            before - transactions.len()
        };

        let dropped_records = self.log.compact()?;
        debug!(removed, dropped_records, "garbage collected");
        Ok(removed)
    }

    /// Validates, logs, then applies a phase change.
    fn advance(
        &self,
        slot: &Slot,
        next: CoordinatorPhase,
        cause: Option<AbortCause>,
    ) -> CoordinatorResult<()> {
        let mut state = slot.state.lock();
        self.apply(&mut state, next, cause)
    }

    /// Like [`Coordinator::advance`], but only from `from`.
    ///
    /// Returns false, changing nothing, if a concurrent cancel moved the
    /// transaction on first.
    fn advance_from(
        &self,
        slot: &Slot,
        from: CoordinatorPhase,
        next: CoordinatorPhase,
        cause: Option<AbortCause>,
    ) -> CoordinatorResult<bool> {
        let mut state = slot.state.lock();
        if state.phase() != from {
            return Ok(false);
        }
        self.apply(&mut state, next, cause)?;
        Ok(true)
    }

    fn apply(
        &self,
        state: &mut Transaction,
        next: CoordinatorPhase,
        cause: Option<AbortCause>,
    ) -> CoordinatorResult<()> {
        let mut draft = state.clone();
        let checked = match cause.clone() {
            Some(cause) => draft.begin_abort(cause),
            None => draft.transition(next),
        };
        checked.map_err(|e| match e {
            CoreError::CannotAbort { .. } => CoordinatorError::AlreadyCommitting { tx: state.id() },
            other => other.into(),
        })?;

        self.log.log_phase(state.id(), next, cause)?;
        *state = draft;
        debug!(tx = %state.id(), phase = %next, "phase change");
        Ok(())
    }

    /// Aborts a transaction left in `Voting` without a full set of yes
    /// votes.
    fn abort_unfinished_vote(&self, slot: &Slot) -> CoordinatorResult<Decision> {
        let (tx, cause) = {
            let state = slot.state.lock();
            (state.id(), state.missing_vote())
        };
        let cause = cause.unwrap_or(AbortCause::Recovered);
        info!(tx = %tx, cause = %cause, "aborting unfinished vote");
        let from = CoordinatorPhase::Voting;
        if !self.advance_from(slot, from, CoordinatorPhase::Aborting, Some(cause))? {
            debug!(tx = %tx, "cancelled before the vote was resumed");
        }
        Ok(Decision::Abort)
    }

    async fn phase1(&self, slot: &Slot) -> CoordinatorResult<PhaseOutcome> {
        let (tx, phase) = {
            let state = slot.state.lock();
            (state.id(), state.phase())
        };
        match phase {
            CoordinatorPhase::Init => {}
            CoordinatorPhase::Aborting | CoordinatorPhase::Aborted => {
                return Ok(PhaseOutcome::Decided(Decision::Abort));
            }
            phase => {
                return Err(CoordinatorError::InvalidState {
                    tx,
                    phase,
                    operation: "phase 1",
                })
            }
        }

        if !self.advance_from(slot, CoordinatorPhase::Init, CoordinatorPhase::Voting, None)? {
            return Ok(PhaseOutcome::Decided(Decision::Abort));
        }
        let targets: Vec<ParticipantId> = slot.state.lock().participants().cloned().collect();

        let results = fan_out(&targets, self.config.vote_timeout, |p| {
            self.transport.prepare(p, tx)
        })
        .await;

        let mut cause = None;
        {
            let mut state = slot.state.lock();
            let at = now();
            for (p, result) in &results {
                match result {
                    Ok(vote) => {
                        state.record_vote(p, *vote, at);
                        if *vote == Vote::No && cause.is_none() {
                            cause = Some(AbortCause::VoteRejected((*p).clone()));
                        }
                    }
                    Err(e) => {
                        debug!(tx = %tx, participant = %p, error = %e, "no vote");
                        if cause.is_none() {
                            cause = Some(failure_cause(p, e));
                        }
                    }
                }
            }
        }

        match cause {
            Some(cause) => {
                info!(tx = %tx, cause = %cause, "aborting after vote");
                let from = CoordinatorPhase::Voting;
                if !self.advance_from(slot, from, CoordinatorPhase::Aborting, Some(cause))? {
                    debug!(tx = %tx, "cancelled while votes were out");
                }
                Ok(PhaseOutcome::Decided(Decision::Abort))
            }
            None => {
                debug!(tx = %tx, "unanimous yes");
                Ok(PhaseOutcome::Proceed)
            }
        }
    }

    async fn phase2(&self, slot: &Slot) -> CoordinatorResult<Decision> {
        let (tx, phase, all_yes) = {
            let state = slot.state.lock();
            (state.id(), state.phase(), state.all_voted_yes())
        };
        match phase {
            CoordinatorPhase::Voting if all_yes => {
                let next = CoordinatorPhase::PreCommitting;
                if !self.advance_from(slot, phase, next, None)? {
                    debug!(tx = %tx, "cancelled before precommit");
                    return Ok(Decision::Abort);
                }
            }
            CoordinatorPhase::PreCommitting => {}
            phase => match phase.decision() {
                Some(decision) => return Ok(decision),
                None => {
                    return Err(CoordinatorError::InvalidState {
                        tx,
                        phase,
                        operation: "phase 2",
                    })
                }
            },
        }

        let mut attempt = 0u32;
        loop {
            if attempt > 0 {
                tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                self.stats.record_retry();
            }

            let targets = slot.state.lock().awaiting_precommit();
            let results = fan_out(&targets, self.config.precommit_timeout, |p| {
                self.transport.precommit(p, tx)
            })
            .await;

            let mut failures = Vec::new();
            for (p, result) in results {
                match result {
                    Ok(()) => {
                        self.log.log_precommit_ack(tx, p)?;
                        slot.state.lock().record_ack(p, AckState::Precommitted, now());
                    }
                    Err(e) => failures.push((p.clone(), e)),
                }
            }

            if failures.is_empty() {
                self.advance(slot, CoordinatorPhase::Committing, None)?;
                return Ok(Decision::Commit);
            }

            // nobody has been told to commit yet, so a local abort wins
            if let Some((p, e)) = failures.iter().find(|(_, e)| is_local_abort(e)) {
                let acks = {
                    let mut state = slot.state.lock();
                    state.record_ack(p, AckState::Aborted, now());
                    state.precommit_acks()
                };
                info!(tx = %tx, participant = %p, error = %e, acks, "participant already aborted, aborting");
                let cause = AbortCause::ParticipantAborted(p.clone());
                self.advance(slot, CoordinatorPhase::Aborting, Some(cause))?;
                return Ok(Decision::Abort);
            }

            let acks = slot.state.lock().precommit_acks();
            if acks == 0 {
                let (p, e) = &failures[0];
                let cause = failure_cause(p, e);
                info!(tx = %tx, cause = %cause, "aborting before any precommit ack");
                self.advance(slot, CoordinatorPhase::Aborting, Some(cause))?;
                return Ok(Decision::Abort);
            }

            if let Some((p, e)) = failures.iter().find(|(_, e)| is_refusal(e)) {
                error!(tx = %tx, participant = %p, error = %e, acks, "precommit refused after another participant acknowledged");
                return Err(CoordinatorError::FatalInconsistency {
                    tx,
                    participant: p.clone(),
                    reason: e.to_string(),
                });
            }

            attempt += 1;
            if attempt >= self.config.retry.max_attempts {
                self.stats.record_timeout();
                let pending: Vec<ParticipantId> = failures.into_iter().map(|(p, _)| p).collect();
                error!(tx = %tx, pending = ?pending, acks, "precommit not acknowledged, retry budget exhausted");
                return Err(CoordinatorError::CoordinatorTimeout { tx, pending });
            }
            warn!(tx = %tx, attempt, missing = failures.len(), "redelivering precommit");
        }
    }

    async fn phase3(&self, slot: &Slot, decision: Decision) -> CoordinatorResult<TransactionOutcome> {
        self.decide(slot, decision)?;
        let tx = slot.state.lock().id();

        let mut attempt = 0u32;
        loop {
            let targets = {
                let state = slot.state.lock();
                if state.phase().is_terminal() {
                    return Ok(slot_outcome(&state));
                }
                state.awaiting_decision(decision)
            };

            if targets.is_empty() {
                return self.finish(slot);
            }

            if attempt > 0 {
                tokio::time::sleep(self.config.retry.delay_for_attempt(attempt)).await;
                self.stats.record_retry();
                warn!(tx = %tx, %decision, attempt, pending = targets.len(), "redelivering decision");
            }

            let results = fan_out(&targets, self.config.decision_timeout, |p| {
                self.transport.decide(p, tx, decision)
            })
            .await;

            let ack = match decision {
                Decision::Commit => AckState::Committed,
                Decision::Abort => AckState::Aborted,
            };
            let mut failures = Vec::new();
            {
                let mut state = slot.state.lock();
                let at = now();
                for (p, result) in results {
                    match result {
                        Ok(()) => state.record_ack(p, ack, at),
                        Err(e) => failures.push((p.clone(), e)),
                    }
                }
            }

            if failures.is_empty() {
                return self.finish(slot);
            }

            if let Some((p, e)) = failures.iter().find(|(_, e)| is_refusal(e)) {
                error!(tx = %tx, participant = %p, %decision, error = %e, "participant cannot apply decision");
                return Err(CoordinatorError::FatalInconsistency {
                    tx,
                    participant: p.clone(),
                    reason: e.to_string(),
                });
            }

            attempt += 1;
            if attempt >= self.config.retry.max_attempts {
                self.stats.record_timeout();
                let pending: Vec<ParticipantId> = failures.into_iter().map(|(p, _)| p).collect();
                error!(tx = %tx, %decision, pending = ?pending, "decision not acknowledged, retry budget exhausted");
                return Err(CoordinatorError::CoordinatorTimeout { tx, pending });
            }
        }
    }

    /// Makes sure the transaction is in the phase that delivers `decision`.
    fn decide(&self, slot: &Slot, decision: Decision) -> CoordinatorResult<()> {
        let (tx, phase, can_abort, awaiting) = {
            let state = slot.state.lock();
            (
                state.id(),
                state.phase(),
                state.can_abort(),
                state.awaiting_precommit().len(),
            )
        };

        match (phase.decision(), decision) {
            (Some(recorded), requested) if recorded == requested => Ok(()),
            (None, Decision::Abort) if can_abort => {
                let cause = Some(AbortCause::Cancelled);
                if self.advance_from(slot, phase, CoordinatorPhase::Aborting, cause)? {
                    Ok(())
                } else {
                    self.decide(slot, decision)
                }
            }
            (None, Decision::Commit) if phase == CoordinatorPhase::PreCommitting && awaiting == 0 => {
                self.advance(slot, CoordinatorPhase::Committing, None)
            }
            _ => Err(CoordinatorError::InvalidState {
                tx,
                phase,
                operation: match decision {
                    Decision::Commit => "commit",
                    Decision::Abort => "abort",
                },
            }),
        }
    }

    fn finish(&self, slot: &Slot) -> CoordinatorResult<TransactionOutcome> {
        let mut state = slot.state.lock();
        let mut draft = state.clone();
        let outcome = draft.finish(now())?;

        self.log.log_end(draft.id(), outcome)?;
        *state = draft;

        match outcome {
            Outcome::Committed => self.stats.record_commit(),
            _ => self.stats.record_abort(),
        }
        info!(tx = %state.id(), outcome = ?outcome, "transaction finished");
        Ok(slot_outcome(&state))
    }
}

fn slot_outcome(state: &Transaction) -> TransactionOutcome {
    TransactionOutcome {
        tx: state.id(),
        outcome: state.outcome(),
        abort_cause: state.abort_cause().cloned(),
    }
}

impl<T> std::fmt::Debug for Coordinator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("config", &self.config)
            .field("transactions", &self.transactions.read().len())
            .finish_non_exhaustive()
    }
}
