//! The participant state machine.

use crate::config::ParticipantConfig;
use crate::error::{ParticipantError, ParticipantResult};
use crate::resource::{PrepareOutcome, ResourceManager};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use triphase_core::{
    LocalTransaction, ParticipantLog, ParticipantLogRecord, ParticipantPhase,
};
use triphase_protocol::{Decision, ParticipantId, TransactionId, Vote};
use triphase_storage::DurableStore;

type Slot = Arc<tokio::sync::Mutex<LocalTransaction>>;

/// What a coordinator timeout did to a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// The transaction was not yet precommitted and was aborted locally.
    Aborted,
    /// The transaction is precommitted; the participant keeps waiting for
    /// the coordinator.
    Blocked,
    /// Nothing to do: the transaction is terminal or unknown.
    Unaffected,
}

/// What [`Participant::recover`] found in the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Transactions restored in `Prepared`.
    pub prepared: usize,
    /// Transactions restored in `Precommitted`.
    pub precommitted: usize,
    /// Terminal transactions kept for duplicate delivery.
    pub terminal: usize,
}

/// What [`Participant::collect_garbage`] cleaned up.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GarbageReport {
    /// Terminal transactions moved out of memory into the outcome table.
    pub forgotten: usize,
    /// Remembered outcomes older than `completed_retention` that were dropped.
    pub expired: usize,
    /// Log records removed by compaction.
    pub records_dropped: usize,
}

/// One participant in three-phase commit.
///
/// Wraps a [`ResourceManager`] and a durable log. Each transaction has its
/// own slot, so requests for different transactions proceed in parallel
/// while requests for the same transaction are serialized.
///
/// Every request is idempotent: a duplicate is answered from the recorded
/// state without touching the resource manager again. That holds for
/// forgotten transactions too, whose outcomes are kept in a compact table
/// for `completed_retention`.
pub struct Participant<R> {
    id: ParticipantId,
    config: ParticipantConfig,
    resource: R,
    log: ParticipantLog,
    slots: Mutex<HashMap<TransactionId, Slot>>,
    // lock order: slots, then finished
    finished: Mutex<HashMap<TransactionId, (ParticipantPhase, Instant)>>,
}

fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

impl<R: ResourceManager> Participant<R> {
    /// Creates a participant logging to `store`.
    ///
    /// Call [`Participant::recover`] before serving requests if `store` may
    /// hold an earlier log.
    pub fn new(
        id: impl Into<ParticipantId>,
        config: ParticipantConfig,
        resource: R,
        store: Box<dyn DurableStore>,
    ) -> Self {
        let log = ParticipantLog::new(store, config.sync_on_write);
        Self {
            id: id.into(),
            config,
            resource,
            log,
            slots: Mutex::new(HashMap::new()),
            finished: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the participant ID.
    pub fn id(&self) -> &ParticipantId {
        &self.id
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ParticipantConfig {
        &self.config
    }

    /// Returns the wrapped resource manager.
    pub fn resource(&self) -> &R {
        &self.resource
    }

    /// Returns the local phase of `tx`, if known.
    ///
    /// Forgotten transactions report their remembered outcome.
    pub async fn phase(&self, tx: TransactionId) -> Option<ParticipantPhase> {
        let slot = self.slots.lock().get(&tx).cloned();
        match slot {
            Some(slot) => Some(slot.lock().await.phase()),
            None => self.finished.lock().get(&tx).map(|(phase, _)| *phase),
        }
    }

    /// Returns the number of transactions held in memory with full state.
    pub fn transaction_count(&self) -> usize {
        self.slots.lock().len()
    }

    /// Returns the number of forgotten transactions whose outcome is still
    /// remembered.
    pub fn remembered_outcomes(&self) -> usize {
        self.finished.lock().len()
    }

    fn existing_slot(&self, tx: TransactionId) -> Option<Slot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(&tx) {
            return Some(Arc::clone(slot));
        }
        let (phase, _) = self.finished.lock().remove(&tx)?;
        debug!(participant = %self.id, tx = %tx, %phase, "request for forgotten transaction");
        let local = LocalTransaction::restored(tx, phase, None, now());
        let slot = Arc::new(tokio::sync::Mutex::new(local));
        slots.insert(tx, Arc::clone(&slot));
        Some(slot)
    }

    fn slot(&self, tx: TransactionId) -> Slot {
        if let Some(slot) = self.existing_slot(tx) {
            return slot;
        }
        Arc::clone(
            self.slots
                .lock()
                .entry(tx)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(LocalTransaction::new(tx, now())))),
        )
    }

    /// Handles `Prepare`: reserve, log, vote.
    ///
    /// `Yes` is returned only after the `Prepared` record is durable. A
    /// refusal logs `Aborted` and votes `No`.
    ///
    /// # Errors
    ///
    /// Returns an error if the log cannot be written. Any reservation made
    /// for this call is released first.
    pub async fn on_prepare(&self, tx: TransactionId) -> ParticipantResult<Vote> {
        let slot = self.slot(tx);
        let mut local = slot.lock().await;
        local.touch(now());

        match local.phase() {
            ParticipantPhase::Idle => {}
            ParticipantPhase::Prepared | ParticipantPhase::Precommitted | ParticipantPhase::Committed => {
                debug!(participant = %self.id, tx = %tx, "duplicate prepare, re-voting yes");
                return Ok(Vote::Yes);
            }
            ParticipantPhase::Aborted => return Ok(Vote::No),
        }

        let outcome = match self.resource.prepare(tx).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(participant = %self.id, tx = %tx, error = %e, "prepare failed, voting no");
                PrepareOutcome::Refused {
                    reason: e.to_string(),
                }
            }
        };

        match outcome {
            PrepareOutcome::Reserved(handle) => {
                let record = ParticipantLogRecord::Prepared {
                    tx,
                    reservation: handle.clone(),
                };
                if let Err(e) = self.log.append_durable(&record) {
                    // never vote yes on an unlogged reservation
                    self.resource.abort(tx, Some(&handle)).await?;
                    return Err(e.into());
                }
                local.set_reservation(handle);
                local.transition(ParticipantPhase::Prepared)?;
                debug!(participant = %self.id, tx = %tx, "prepared");
                Ok(Vote::Yes)
            }
            PrepareOutcome::Refused { reason } => {
                self.log.append(&ParticipantLogRecord::Aborted { tx })?;
                local.transition(ParticipantPhase::Aborted)?;
                info!(participant = %self.id, tx = %tx, reason = %reason, "voting no");
                Ok(Vote::No)
            }
        }
    }

    /// Handles `PreCommit`: the `PreCommitted` record is synced before this
    /// returns.
    ///
    /// # Errors
    ///
    /// - `AlreadyAborted` if the participant aborted the transaction
    /// - `InvalidState` if the transaction was never prepared here
    pub async fn on_precommit(&self, tx: TransactionId) -> ParticipantResult<()> {
        let slot = self.existing_slot(tx).ok_or(ParticipantError::InvalidState {
            tx,
            phase: ParticipantPhase::Idle,
            request: "precommit",
        })?;
        let mut local = slot.lock().await;
        local.touch(now());

        match local.phase() {
            ParticipantPhase::Prepared => {}
            ParticipantPhase::Precommitted | ParticipantPhase::Committed => return Ok(()),
            ParticipantPhase::Aborted => return Err(ParticipantError::AlreadyAborted(tx)),
            phase @ ParticipantPhase::Idle => {
                return Err(ParticipantError::InvalidState {
                    tx,
                    phase,
                    request: "precommit",
                })
            }
        }

        let handle = local.reservation().cloned().ok_or_else(|| {
            triphase_core::CoreError::invalid_operation(format!("{tx} prepared without reservation"))
        })?;
        self.resource.precommit(tx, &handle).await?;
        self.log
            .append_durable(&ParticipantLogRecord::PreCommitted { tx })?;
        local.transition(ParticipantPhase::Precommitted)?;

        debug!(participant = %self.id, tx = %tx, "precommitted");
        Ok(())
    }

    /// Handles the final decision.
    ///
    /// Re-delivery after the matching terminal state is a no-op that still
    /// succeeds.
    ///
    /// # Errors
    ///
    /// - `FatalInconsistency` for commit after a local abort, abort after a
    ///   local commit, or a resource manager that refuses to commit
    /// - `InvalidState` for commit before precommit
    pub async fn on_decision(&self, tx: TransactionId, decision: Decision) -> ParticipantResult<()> {
        match decision {
            Decision::Commit => self.commit(tx).await,
            Decision::Abort => self.abort(tx).await,
        }
    }

    async fn commit(&self, tx: TransactionId) -> ParticipantResult<()> {
        let slot = self.existing_slot(tx).ok_or(ParticipantError::InvalidState {
            tx,
            phase: ParticipantPhase::Idle,
            request: "commit",
        })?;
        let mut local = slot.lock().await;
        local.touch(now());

        match local.phase() {
            ParticipantPhase::Precommitted => {}
            ParticipantPhase::Committed => {
                debug!(participant = %self.id, tx = %tx, "duplicate commit");
                return Ok(());
            }
            ParticipantPhase::Aborted => {
                error!(participant = %self.id, tx = %tx, "commit requested for aborted transaction");
                return Err(ParticipantError::FatalInconsistency {
                    tx,
                    reason: "commit requested after local abort".into(),
                });
            }
            phase => {
                return Err(ParticipantError::InvalidState {
                    tx,
                    phase,
                    request: "commit",
                })
            }
        }

        let handle = local.reservation().cloned().ok_or_else(|| {
            triphase_core::CoreError::invalid_operation(format!("{tx} precommitted without reservation"))
        })?;

        if let Err(e) = self.resource.commit(tx, &handle).await {
            error!(participant = %self.id, tx = %tx, error = %e, "resource refused to commit after voting yes");
            return Err(ParticipantError::FatalInconsistency {
                tx,
                reason: e.to_string(),
            });
        }

        self.log.append(&ParticipantLogRecord::Committed { tx })?;
        local.transition(ParticipantPhase::Committed)?;
        info!(participant = %self.id, tx = %tx, "committed");
        Ok(())
    }

    async fn abort(&self, tx: TransactionId) -> ParticipantResult<()> {
        let slot = self.slot(tx);
        let mut local = slot.lock().await;
        local.touch(now());

        match local.phase() {
            ParticipantPhase::Aborted => {
                debug!(participant = %self.id, tx = %tx, "duplicate abort");
                return Ok(());
            }
            ParticipantPhase::Committed => {
                error!(participant = %self.id, tx = %tx, "abort requested for committed transaction");
                return Err(ParticipantError::FatalInconsistency {
                    tx,
                    reason: "abort requested after local commit".into(),
                });
            }
            _ => {}
        }

        self.release(tx, &mut local).await?;
        info!(participant = %self.id, tx = %tx, "aborted");
        Ok(())
    }

    async fn release(&self, tx: TransactionId, local: &mut LocalTransaction) -> ParticipantResult<()> {
        self.resource.abort(tx, local.reservation()).await?;
        self.log.append(&ParticipantLogRecord::Aborted { tx })?;
        local.transition(ParticipantPhase::Aborted)?;
        Ok(())
    }

    /// Reacts to a coordinator that has gone silent on `tx`.
    ///
    /// Before precommit the participant aborts on its own. Once precommitted
    /// it must not, and reports [`TimeoutAction::Blocked`] instead.
    ///
    /// # Errors
    ///
    /// Returns an error if the local abort cannot be logged.
    pub async fn on_coordinator_timeout(&self, tx: TransactionId) -> ParticipantResult<TimeoutAction> {
        let Some(slot) = self.existing_slot(tx) else {
            return Ok(TimeoutAction::Unaffected);
        };
        let mut local = slot.lock().await;

        match local.phase() {
            phase if phase.may_abort_unilaterally() => {
                warn!(participant = %self.id, tx = %tx, %phase, "coordinator silent, aborting");
                self.release(tx, &mut local).await?;
                Ok(TimeoutAction::Aborted)
            }
            ParticipantPhase::Precommitted => {
                warn!(
                    participant = %self.id,
                    tx = %tx,
                    idle_ms = local.idle_for(now()).as_millis() as u64,
                    "coordinator silent while precommitted, blocked"
                );
                Ok(TimeoutAction::Blocked)
            }
            _ => Ok(TimeoutAction::Unaffected),
        }
    }

    /// Applies [`Participant::on_coordinator_timeout`] to every non-terminal
    /// transaction idle for at least `prepare_timeout`.
    ///
    /// # Errors
    ///
    /// Returns the first error from a local abort.
    pub async fn check_timeouts(&self) -> ParticipantResult<Vec<(TransactionId, TimeoutAction)>> {
        let slots: Vec<(TransactionId, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(tx, slot)| (*tx, Arc::clone(slot)))
            .collect();

        let current = now();
        let mut expired = Vec::new();
        for (tx, slot) in slots {
            // busy slots are being driven right now
            let Ok(local) = slot.try_lock() else { continue };
            if !local.phase().is_terminal() && local.idle_for(current) >= self.config.prepare_timeout {
                expired.push(tx);
            }
        }

        let mut actions = Vec::with_capacity(expired.len());
        for tx in expired {
            let action = self.on_coordinator_timeout(tx).await?;
            actions.push((tx, action));
        }
        Ok(actions)
    }

    /// Rebuilds local state from the log after a restart.
    ///
    /// Prepared and precommitted transactions get their holds back through
    /// [`ResourceManager::restore`]; their idle clocks restart now.
    ///
    /// # Errors
    ///
    /// Returns an error on log corruption or if a hold cannot be restored.
    pub async fn recover(&self) -> ParticipantResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let current = now();

        for logged in self.log.replay()? {
            match logged.phase {
                ParticipantPhase::Prepared => report.prepared += 1,
                ParticipantPhase::Precommitted => report.precommitted += 1,
                _ => report.terminal += 1,
            }

            if !logged.phase.is_terminal() {
                if let Some(handle) = &logged.reservation {
                    self.resource.restore(logged.id, handle, logged.phase).await?;
                }
            }

            let local =
                LocalTransaction::restored(logged.id, logged.phase, logged.reservation, current);
            self.slots
                .lock()
                .insert(logged.id, Arc::new(tokio::sync::Mutex::new(local)));
        }

        info!(
            participant = %self.id,
            prepared = report.prepared,
            precommitted = report.precommitted,
            terminal = report.terminal,
            "participant recovered"
        );
        Ok(report)
    }

    /// Moves terminal transactions out of memory, keeping only their
    /// outcome.
    ///
    /// Returns how many were moved. A late request for a forgotten
    /// transaction is answered as if it were never forgotten: `Prepare`
    /// re-votes without reserving, and a repeated decision is acknowledged.
    pub fn forget_terminal(&self) -> usize {
        let current = now();
        let mut slots = self.slots.lock();
        let mut finished = self.finished.lock();
        let before = slots.len();
        slots.retain(|tx, slot| match slot.try_lock() {
            Ok(local) if local.phase().is_terminal() => {
                finished.insert(*tx, (local.phase(), current));
                false
            }
            _ => true,
        });
        before - slots.len()
    }

    /// Forgets terminal transactions, drops remembered outcomes older than
    /// `completed_retention` and compacts the log to match.
    ///
    /// Only records of transactions this participant no longer remembers
    /// at all are removed from the log.
    ///
    /// # Errors
    ///
    /// Returns an error if log compaction fails.
    pub fn collect_garbage(&self) -> ParticipantResult<GarbageReport> {
        let forgotten = self.forget_terminal();

        let current = now();
        let retention = self.config.completed_retention;
        let expired = {
            let mut finished = self.finished.lock();
            let before = finished.len();
            finished.retain(|_, (_, at)| current.saturating_duration_since(*at) < retention);
            before - finished.len()
        };

        let remembered: HashSet<TransactionId> = {
            let slots = self.slots.lock();
            let finished = self.finished.lock();
            slots.keys().chain(finished.keys()).copied().collect()
        };
        let records_dropped = self.log.compact(|tx| remembered.contains(tx))?;

        let report = GarbageReport {
            forgotten,
            expired,
            records_dropped,
        };
        debug!(
            participant = %self.id,
            forgotten,
            expired,
            records_dropped,
            "garbage collected"
        );
        Ok(report)
    }

    /// Returns the log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store size cannot be read.
    pub fn log_size(&self) -> ParticipantResult<u64> {
        Ok(self.log.size()?)
    }
}

impl<R: ResourceManager + 'static> Participant<R> {
    /// Spawns a task that runs [`Participant::check_timeouts`] every
    /// `timeout_scan_interval`.
    pub fn spawn_timeout_monitor(self: &Arc<Self>) -> JoinHandle<()> {
        let participant = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(participant.config.timeout_scan_interval);
            loop {
                ticker.tick().await;
                if let Err(e) = participant.check_timeouts().await {
                    warn!(participant = %participant.id, error = %e, "timeout scan failed");
                }
            }
        })
    }
}

impl<R> std::fmt::Debug for Participant<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Participant")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
