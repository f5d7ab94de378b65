//! A participant's local log.

use crate::error::{CoreError, CoreResult};
use crate::log::record::LogRecord;
use crate::log::writer::DurableLog;
use crate::transaction::{ParticipantPhase, ReservationHandle};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tracing::debug;
use triphase_protocol::TransactionId;
use triphase_storage::DurableStore;

/// A record in a participant log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantLogRecord {
    /// Resources reserved; the participant is about to vote yes.
    Prepared {
        /// Transaction ID.
        tx: TransactionId,
        /// Handle the resource manager returned.
        reservation: ReservationHandle,
    },
    /// The participant promised to commit unless told to abort.
    PreCommitted {
        /// Transaction ID.
        tx: TransactionId,
    },
    /// The reservation was finalized.
    Committed {
        /// Transaction ID.
        tx: TransactionId,
    },
    /// The reservation was released (or never made).
    Aborted {
        /// Transaction ID.
        tx: TransactionId,
    },
}

impl ParticipantLogRecord {
    /// Returns the transaction this record belongs to.
    #[must_use]
    pub fn tx(&self) -> TransactionId {
        match self {
            ParticipantLogRecord::Prepared { tx, .. }
            | ParticipantLogRecord::PreCommitted { tx }
            | ParticipantLogRecord::Committed { tx }
            | ParticipantLogRecord::Aborted { tx } => *tx,
        }
    }
}

impl LogRecord for ParticipantLogRecord {
    fn record_type(&self) -> u8 {
        match self {
            ParticipantLogRecord::Prepared { .. } => 1,
            ParticipantLogRecord::PreCommitted { .. } => 2,
            ParticipantLogRecord::Committed { .. } => 3,
            ParticipantLogRecord::Aborted { .. } => 4,
        }
    }

    fn is_known_type(type_byte: u8) -> bool {
        (1..=4).contains(&type_byte)
    }
}

/// Local state of one transaction, as the participant log records it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedLocalTransaction {
    /// Transaction ID.
    pub id: TransactionId,
    /// Last logged phase.
    pub phase: ParticipantPhase,
    /// Reservation handle from the `Prepared` record.
    pub reservation: Option<ReservationHandle>,
}

/// A participant's durable log.
#[derive(Debug)]
pub struct ParticipantLog {
    log: DurableLog<ParticipantLogRecord>,
}

impl ParticipantLog {
    /// Opens a participant log over `store`.
    pub fn new(store: Box<dyn DurableStore>, sync_on_write: bool) -> Self {
        Self {
            log: DurableLog::new(store, sync_on_write),
        }
    }

    /// Appends a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written.
    pub fn append(&self, record: &ParticipantLogRecord) -> CoreResult<()> {
        self.log.append(record)?;
        Ok(())
    }

    /// Appends a record and syncs the store regardless of `sync_on_write`.
    ///
    /// Used for the precommit record, which must be durable before the ack.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written or synced.
    pub fn append_durable(&self, record: &ParticipantLogRecord) -> CoreResult<()> {
        self.log.append(record)?;
        if !self.log.sync_on_write() {
            self.log.sync()?;
        }
        Ok(())
    }

    /// Replays the log into per-transaction state, in first-seen order.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption, including a precommit or commit for a
    /// transaction that was never prepared.
    pub fn replay(&self) -> CoreResult<Vec<LoggedLocalTransaction>> {
        let records = self.log.read_all()?;
        fold_records(records.into_iter().map(|(_, r)| r))
    }

    /// Rewrites the log without the records of terminal transactions that
    /// `remembered` no longer wants.
    ///
    /// Records of prepared and precommitted transactions are always kept.
    /// Returns how many records were dropped.
    ///
    /// # Errors
    ///
    /// Returns an error on corruption or if the store cannot be rewritten.
    pub fn compact<F>(&self, remembered: F) -> CoreResult<usize>
    where
        F: Fn(&TransactionId) -> bool,
    {
        let mut folded = Ok(());
        let dropped = self.log.retain(|records| {
            let keep: HashSet<TransactionId> =
                match fold_records(records.iter().map(|(_, r)| r.clone())) {
                    Ok(txs) => txs
                        .into_iter()
                        .filter(|t| !t.phase.is_terminal() || remembered(&t.id))
                        .map(|t| t.id)
                        .collect(),
                    Err(e) => {
                        folded = Err(e);
                        records.iter().map(|(_, r)| r.tx()).collect()
                    }
                };
            move |record: &ParticipantLogRecord| keep.contains(&record.tx())
        })?;
        folded?;

        if dropped > 0 {
            debug!(records = dropped, "compacted participant log");
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

fn fold_records<I>(records: I) -> CoreResult<Vec<LoggedLocalTransaction>>
where
    I: IntoIterator<Item = ParticipantLogRecord>,
{
    let mut order = Vec::new();
    let mut by_id: HashMap<TransactionId, LoggedLocalTransaction> = HashMap::new();

    for record in records {
        let tx = record.tx();

        match record {
            ParticipantLogRecord::Prepared { reservation, .. } => {
                if by_id.contains_key(&tx) {
                    return Err(CoreError::log_corruption(format!(
                        "duplicate prepare for {tx}"
                    )));
                }
                order.push(tx);
                by_id.insert(
                    tx,
                    LoggedLocalTransaction {
                        id: tx,
                        phase: ParticipantPhase::Prepared,
                        reservation: Some(reservation),
                    },
                );
            }
            ParticipantLogRecord::PreCommitted { .. } => {
                let entry = by_id.get_mut(&tx).ok_or_else(|| {
                    CoreError::log_corruption(format!("precommit for unprepared {tx}"))
                })?;
                entry.phase = ParticipantPhase::Precommitted;
            }
            ParticipantLogRecord::Committed { .. } => {
                let entry = by_id.get_mut(&tx).ok_or_else(|| {
                    CoreError::log_corruption(format!("commit for unprepared {tx}"))
                })?;
                entry.phase = ParticipantPhase::Committed;
            }
            ParticipantLogRecord::Aborted { .. } => {
                by_id
                    .entry(tx)
                    .or_insert_with(|| {
                        order.push(tx);
                        LoggedLocalTransaction {
                            id: tx,
                            phase: ParticipantPhase::Aborted,
                            reservation: None,
                        }
                    })
                    .phase = ParticipantPhase::Aborted;
            }
        }
    }

    Ok(order
        .into_iter()
        .filter_map(|tx| by_id.remove(&tx))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use triphase_storage::MemoryStore;

    fn log(sync_on_write: bool) -> (ParticipantLog, MemoryStore) {
        let store = MemoryStore::new();
        (
            ParticipantLog::new(Box::new(store.clone()), sync_on_write),
            store,
        )
    }

    #[test]
    fn replay_tracks_phases() {
        let (log, _) = log(true);
        let t1 = TransactionId::from_u128(1);
        let t2 = TransactionId::from_u128(2);

        log.append(&ParticipantLogRecord::Prepared {
            tx: t1,
            reservation: ReservationHandle::new(vec![1]),
        })
        .unwrap();
        log.append(&ParticipantLogRecord::Aborted { tx: t2 }).unwrap();
        log.append(&ParticipantLogRecord::PreCommitted { tx: t1 })
            .unwrap();

        let replayed = log.replay().unwrap();
        assert_eq!(replayed.len(), 2);
        assert_eq!(replayed[0].phase, ParticipantPhase::Precommitted);
        assert_eq!(replayed[0].reservation, Some(ReservationHandle::new(vec![1])));
        assert_eq!(replayed[1].phase, ParticipantPhase::Aborted);
        assert_eq!(replayed[1].reservation, None);
    }

    #[test]
    fn append_durable_syncs_without_sync_on_write() {
        let (log, store) = log(false);
        let t = TransactionId::from_u128(1);
        log.append(&ParticipantLogRecord::Prepared {
            tx: t,
            reservation: ReservationHandle::new(vec![]),
        })
        .unwrap();
        log.append_durable(&ParticipantLogRecord::PreCommitted { tx: t })
            .unwrap();

        store.simulate_crash();

        let reopened = ParticipantLog::new(Box::new(store), false);
        assert_eq!(
            reopened.replay().unwrap()[0].phase,
            ParticipantPhase::Precommitted
        );
    }

    #[test]
    fn commit_without_prepare_is_corruption() {
        let (log, _) = log(true);
        log.append(&ParticipantLogRecord::Committed {
            tx: TransactionId::from_u128(4),
        })
        .unwrap();
        assert!(matches!(
            log.replay(),
            Err(CoreError::LogCorruption { .. })
        ));
    }

    #[test]
    fn compact_drops_forgotten_terminal_records() {
        let (log, store) = log(true);
        let mut remembered = Vec::new();
        for n in 0..12u128 {
            let t = TransactionId::from_u128(n);
            log.append(&ParticipantLogRecord::Prepared {
                tx: t,
                reservation: ReservationHandle::new(vec![n as u8]),
            })
            .unwrap();
            match n % 3 {
                0 => {}
                1 => {
                    log.append(&ParticipantLogRecord::PreCommitted { tx: t })
                        .unwrap();
                    log.append(&ParticipantLogRecord::Committed { tx: t })
                        .unwrap();
                }
                _ => log.append(&ParticipantLogRecord::Aborted { tx: t }).unwrap(),
            }
        }
        let late = TransactionId::from_u128(5);
        remembered.push(late);
        let before = log.size().unwrap();

        // 4 prepared stay, 8 terminal go except the remembered abort
        assert_eq!(log.compact(|t| remembered.contains(t)).unwrap(), 3 * 4 + 2 * 3);
        assert!(log.size().unwrap() < before / 2);

        store.simulate_crash();
        let reopened = ParticipantLog::new(Box::new(store), true);
        let replayed = reopened.replay().unwrap();
        let ids: Vec<u128> = replayed.iter().map(|t| t.id.as_uuid().as_u128()).collect();
        assert_eq!(ids, vec![0, 3, 5, 6, 9]);
        assert_eq!(replayed[2].phase, ParticipantPhase::Aborted);
        assert!(replayed
            .iter()
            .filter(|t| t.id != late)
            .all(|t| t.phase == ParticipantPhase::Prepared));
    }

    #[test]
    fn compact_keeps_everything_in_flight() {
        let (log, _) = log(true);
        let t = TransactionId::from_u128(1);
        log.append(&ParticipantLogRecord::Prepared {
            tx: t,
            reservation: ReservationHandle::new(vec![]),
        })
        .unwrap();
        log.append_durable(&ParticipantLogRecord::PreCommitted { tx: t })
            .unwrap();

        assert_eq!(log.compact(|_| false).unwrap(), 0);
        assert_eq!(log.replay().unwrap()[0].phase, ParticipantPhase::Precommitted);
    }
}
