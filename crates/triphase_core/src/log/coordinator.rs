//! The coordinator's write-ahead log.

use crate::error::{CoreError, CoreResult};
use crate::log::record::LogRecord;
use crate::log::writer::DurableLog;
use crate::transaction::{AbortCause, CoordinatorPhase, Outcome};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::{debug, info};
use triphase_protocol::{ParticipantId, TransactionId};
use triphase_storage::DurableStore;

/// A record in the coordinator log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CoordinatorRecord {
    /// A transaction was allocated.
    Begin {
        /// Transaction ID.
        tx: TransactionId,
        /// Participants in submission order.
        participants: Vec<ParticipantId>,
    },
    /// The transaction entered a new phase.
    Phase {
        /// Transaction ID.
        tx: TransactionId,
        /// The phase entered.
        phase: CoordinatorPhase,
        /// Why, when the phase is `Aborting`.
        cause: Option<AbortCause>,
    },
    /// A participant acknowledged precommit.
    PrecommitAcked {
        /// Transaction ID.
        tx: TransactionId,
        /// The acknowledging participant.
        participant: ParticipantId,
    },
    /// Every participant acknowledged the decision.
    End {
        /// Transaction ID.
        tx: TransactionId,
        /// Final outcome.
        outcome: Outcome,
    },
}

impl CoordinatorRecord {
    /// Returns the transaction this record belongs to.
    #[must_use]
    pub fn tx(&self) -> TransactionId {
        match self {
            CoordinatorRecord::Begin { tx, .. }
            | CoordinatorRecord::Phase { tx, .. }
            | CoordinatorRecord::PrecommitAcked { tx, .. }
            | CoordinatorRecord::End { tx, .. } => *tx,
        }
    }
}

impl LogRecord for CoordinatorRecord {
    fn record_type(&self) -> u8 {
        match self {
            CoordinatorRecord::Begin { .. } => 1,
            CoordinatorRecord::Phase { .. } => 2,
            CoordinatorRecord::PrecommitAcked { .. } => 3,
            CoordinatorRecord::End { .. } => 4,
        }
    }

    fn is_known_type(type_byte: u8) -> bool {
        (1..=4).contains(&type_byte)
    }
}

/// What the log says about one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedTransaction {
    /// Transaction ID.
    pub id: TransactionId,
    /// Participants in submission order.
    pub participants: Vec<ParticipantId>,
    /// Last logged phase.
    pub phase: CoordinatorPhase,
    /// Participants whose precommit acknowledgment was logged.
    pub precommit_acked: HashSet<ParticipantId>,
    /// Abort cause from the `Aborting` record, if any.
    pub abort_cause: Option<AbortCause>,
    /// Final outcome, present once an `End` record was written.
    pub outcome: Option<Outcome>,
}

impl LoggedTransaction {
    /// Returns true if the transaction still needs driving.
    #[must_use]
    pub fn is_in_flight(&self) -> bool {
        self.outcome.is_none()
    }
}

/// The coordinator's write-ahead log.
///
/// Every phase transition is appended here before the coordinator sends the
/// message that depends on it. With `sync_on_write` the record is durable by
/// the time the call returns.
#[derive(Debug)]
pub struct CoordinatorLog {
    log: DurableLog<CoordinatorRecord>,
}

impl CoordinatorLog {
    /// Opens a coordinator log over `store`.
    pub fn new(store: Box<dyn DurableStore>, sync_on_write: bool) -> Self {
        Self {
            log: DurableLog::new(store, sync_on_write),
        }
    }

    /// Logs a new transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn log_begin(&self, tx: TransactionId, participants: &[ParticipantId]) -> CoreResult<()> {
        self.log.append(&CoordinatorRecord::Begin {
            tx,
            participants: participants.to_vec(),
        })?;
        Ok(())
    }

    /// Logs a phase transition.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn log_phase(
        &self,
        tx: TransactionId,
        phase: CoordinatorPhase,
        cause: Option<AbortCause>,
    ) -> CoreResult<()> {
        self.log.append(&CoordinatorRecord::Phase { tx, phase, cause })?;
        Ok(())
    }

    /// Logs a precommit acknowledgment.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn log_precommit_ack(&self, tx: TransactionId, participant: &ParticipantId) -> CoreResult<()> {
        self.log.append(&CoordinatorRecord::PrecommitAcked {
            tx,
            participant: participant.clone(),
        })?;
        Ok(())
    }

    /// Logs the end of a transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn log_end(&self, tx: TransactionId, outcome: Outcome) -> CoreResult<()> {
        self.log.append(&CoordinatorRecord::End { tx, outcome })?;
        Ok(())
    }

    /// Replays the log into per-transaction state, in `Begin` order.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption, including records for transactions
    /// that were never begun.
    pub fn replay(&self) -> CoreResult<Vec<LoggedTransaction>> {
        let records = self.log.read_all()?;
        let replayed = fold_records(records.into_iter().map(|(_, r)| r))?;
        debug!(transactions = replayed.len(), "replayed coordinator log");
        Ok(replayed)
    }

    /// Returns only the transactions without an `End` record.
    ///
    /// # Errors
    ///
    /// Same as [`CoordinatorLog::replay`].
    pub fn in_flight(&self) -> CoreResult<Vec<LoggedTransaction>> {
        Ok(self
            .replay()?
            .into_iter()
            .filter(LoggedTransaction::is_in_flight)
            .collect())
    }

    /// Rewrites the log without the records of ended transactions.
    ///
    /// Records of in-flight transactions are kept in order, so replay after
    /// compaction resumes exactly the same work. Returns how many records
    /// were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or if the store cannot be rewritten.
    pub fn compact(&self) -> CoreResult<usize> {
        let mut folded = Ok(());
        let mut ended = 0usize;
        let dropped = self.log.retain(|records| {
            let open: HashSet<TransactionId> =
                match fold_records(records.iter().map(|(_, r)| r.clone())) {
                    Ok(txs) => {
                        ended = txs.iter().filter(|t| !t.is_in_flight()).count();
                        txs.into_iter()
                            .filter(LoggedTransaction::is_in_flight)
                            .map(|t| t.id)
                            .collect()
                    }
                    Err(e) => {
                        folded = Err(e);
                        records.iter().map(|(_, r)| r.tx()).collect()
                    }
                };
            move |record: &CoordinatorRecord| open.contains(&record.tx())
        })?;
        folded?;

        if dropped > 0 {
            info!(transactions = ended, records = dropped, "compacted coordinator log");
        }
        Ok(dropped)
    }

    /// Returns the log size in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the store size cannot be read.
    pub fn size(&self) -> CoreResult<u64> {
        self.log.size()
    }
}

fn fold_records<I>(records: I) -> CoreResult<Vec<LoggedTransaction>>
where
    I: IntoIterator<Item = CoordinatorRecord>,
{
    let mut order: Vec<TransactionId> = Vec::new();
    let mut by_id: HashMap<TransactionId, LoggedTransaction> = HashMap::new();

    for record in records {
        let tx = record.tx();

        if let CoordinatorRecord::Begin { participants, .. } = record {
            if by_id.contains_key(&tx) {
                return Err(CoreError::log_corruption(format!("duplicate begin for {tx}")));
            }
            order.push(tx);
            by_id.insert(
                tx,
                LoggedTransaction {
                    id: tx,
                    participants,
                    phase: CoordinatorPhase::Init,
                    precommit_acked: HashSet::new(),
                    abort_cause: None,
                    outcome: None,
                },
            );
            continue;
        }

        let entry = by_id
            .get_mut(&tx)
            .ok_or_else(|| CoreError::log_corruption(format!("record for unknown {tx}")))?;

        match record {
            CoordinatorRecord::Phase { phase, cause, .. } => {
                entry.phase = phase;
                if cause.is_some() {
                    entry.abort_cause = cause;
                }
            }
            CoordinatorRecord::PrecommitAcked { participant, .. } => {
                entry.precommit_acked.insert(participant);
            }
            CoordinatorRecord::End { outcome, .. } => {
                entry.phase = match outcome {
                    Outcome::Committed => CoordinatorPhase::Committed,
                    _ => CoordinatorPhase::Aborted,
                };
                entry.outcome = Some(outcome);
            }
            CoordinatorRecord::Begin { .. } => {}
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|tx| by_id.remove(&tx))
        .collect())
}
