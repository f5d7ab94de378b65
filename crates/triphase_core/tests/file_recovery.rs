//! Log recovery against real files.

use std::collections::HashSet;
use tempfile::tempdir;
use triphase_core::{
    AbortCause, CoordinatorLog, CoordinatorPhase, Outcome, ParticipantLog, ParticipantLogRecord,
    ParticipantPhase, ReservationHandle, Transaction,
};
use triphase_protocol::{ParticipantId, TransactionId};
use triphase_storage::{DurableStore, FileStore};

fn participants() -> Vec<ParticipantId> {
    vec!["flights".into(), "payments".into(), "bookings".into()]
}

#[test]
fn coordinator_log_survives_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coordinator.log");
    let tx = TransactionId::from_u128(11);

    {
        let log = CoordinatorLog::new(Box::new(FileStore::open(&path).unwrap()), true);
        log.log_begin(tx, &participants()).unwrap();
        log.log_phase(tx, CoordinatorPhase::Voting, None).unwrap();
        log.log_phase(tx, CoordinatorPhase::PreCommitting, None)
            .unwrap();
        log.log_precommit_ack(tx, &"payments".into()).unwrap();
    }

    let log = CoordinatorLog::new(Box::new(FileStore::open(&path).unwrap()), true);
    let in_flight = log.in_flight().unwrap();
    assert_eq!(in_flight.len(), 1);

    let logged = &in_flight[0];
    assert_eq!(logged.participants, participants());
    assert_eq!(logged.phase, CoordinatorPhase::PreCommitting);

    let restored = Transaction::recovered(
        logged.id,
        logged.participants.clone(),
        logged.phase,
        &logged.precommit_acked,
        logged.abort_cause.clone(),
    )
    .unwrap();
    assert!(!restored.can_abort());
}

#[test]
fn torn_append_is_dropped_on_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coordinator.log");
    let tx = TransactionId::from_u128(12);

    let intact_len = {
        let log = CoordinatorLog::new(Box::new(FileStore::open(&path).unwrap()), true);
        log.log_begin(tx, &participants()).unwrap();
        log.log_phase(tx, CoordinatorPhase::Aborting, Some(AbortCause::Cancelled))
            .unwrap();
        log.size().unwrap()
    };

    // Half a record lands after the last synced one.
    {
        let mut store = FileStore::open(&path).unwrap();
        store.append(&triphase_core::log::LOG_MAGIC).unwrap();
        store.append(&[1, 0, 4, 0xFF]).unwrap();
        store.sync().unwrap();
        assert!(store.len().unwrap() > intact_len);
    }

    let log = CoordinatorLog::new(Box::new(FileStore::open(&path).unwrap()), true);
    let replayed = log.replay().unwrap();
    assert_eq!(replayed.len(), 1);
    assert_eq!(replayed[0].phase, CoordinatorPhase::Aborting);
    assert_eq!(replayed[0].abort_cause, Some(AbortCause::Cancelled));
}

#[test]
fn compaction_truncates_file() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("coordinator.log");
    let tx = TransactionId::from_u128(13);

    let log = CoordinatorLog::new(Box::new(FileStore::open(&path).unwrap()), true);
    log.log_begin(tx, &participants()).unwrap();
    log.log_phase(tx, CoordinatorPhase::Committing, None).unwrap();
    log.log_end(tx, Outcome::Committed).unwrap();

    assert_eq!(log.compact().unwrap(), 3);
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 0);
}

#[test]
fn participant_log_restores_reservations() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("participant.log");
    let prepared = TransactionId::from_u128(21);
    let precommitted = TransactionId::from_u128(22);

    {
        let log = ParticipantLog::new(Box::new(FileStore::open(&path).unwrap()), false);
        for tx in [prepared, precommitted] {
            log.append(&ParticipantLogRecord::Prepared {
                tx,
                reservation: ReservationHandle::new(tx.as_uuid().as_bytes().to_vec()),
            })
            .unwrap();
        }
        log.append_durable(&ParticipantLogRecord::PreCommitted { tx: precommitted })
            .unwrap();
    }

    let log = ParticipantLog::new(Box::new(FileStore::open(&path).unwrap()), false);
    let replayed = log.replay().unwrap();
    let phases: HashSet<_> = replayed.iter().map(|t| (t.id, t.phase)).collect();

    assert!(phases.contains(&(prepared, ParticipantPhase::Prepared)));
    assert!(phases.contains(&(precommitted, ParticipantPhase::Precommitted)));
    assert!(replayed.iter().all(|t| t.reservation.is_some()));
}
