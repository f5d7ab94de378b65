//! Participant behaviour across restarts and silent coordinators.

use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;
use triphase_core::ParticipantPhase;
use triphase_participant::{
    InventoryResource, Participant, ParticipantConfig, ProtocolHandler, PREPARE_PATH,
};
use triphase_protocol::{Decision, Envelope, ProtocolMessage, TransactionId, Vote};
use triphase_storage::{FileStore, MemoryStore};

fn config() -> ParticipantConfig {
    ParticipantConfig::default()
        .with_prepare_timeout(Duration::from_secs(2))
        .with_timeout_scan_interval(Duration::from_millis(100))
}

#[tokio::test(start_paused = true)]
async fn monitor_aborts_prepared_but_not_precommitted() {
    let seats = InventoryResource::new(10);
    let p = Arc::new(Participant::new(
        "flights",
        config(),
        seats.clone(),
        Box::new(MemoryStore::new()),
    ));
    let monitor = p.spawn_timeout_monitor();

    let prepared = TransactionId::from_u128(1);
    let precommitted = TransactionId::from_u128(2);
    assert_eq!(p.on_prepare(prepared).await.unwrap(), Vote::Yes);
    assert_eq!(p.on_prepare(precommitted).await.unwrap(), Vote::Yes);
    p.on_precommit(precommitted).await.unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;

    assert_eq!(p.phase(prepared).await, Some(ParticipantPhase::Aborted));
    assert_eq!(
        p.phase(precommitted).await,
        Some(ParticipantPhase::Precommitted)
    );
    assert!(seats.is_held(precommitted));
    assert!(!seats.is_held(prepared));

    // The blocked transaction still completes once the coordinator returns.
    p.on_decision(precommitted, Decision::Commit).await.unwrap();
    assert_eq!(seats.sold(), 1);

    monitor.abort();
}

#[tokio::test(start_paused = true)]
async fn activity_resets_the_idle_clock() {
    let p = Participant::new(
        "hotels",
        config(),
        InventoryResource::new(1),
        Box::new(MemoryStore::new()),
    );
    let tx = TransactionId::from_u128(3);
    p.on_prepare(tx).await.unwrap();

    tokio::time::advance(Duration::from_millis(1500)).await;
    // Duplicate delivery counts as coordinator contact.
    p.on_prepare(tx).await.unwrap();
    tokio::time::advance(Duration::from_millis(1500)).await;

    assert!(p.check_timeouts().await.unwrap().is_empty());
    assert_eq!(p.phase(tx).await, Some(ParticipantPhase::Prepared));
}

#[tokio::test]
async fn restart_from_file_keeps_promises() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("payments.log");
    let tx = TransactionId::from_u128(4);

    {
        let p = Participant::new(
            "payments",
            config().with_sync_on_write(false),
            InventoryResource::new(5),
            Box::new(FileStore::open(&path).unwrap()),
        );
        p.on_prepare(tx).await.unwrap();
        p.on_precommit(tx).await.unwrap();
    }

    let funds = InventoryResource::new(5);
    let p = Participant::new(
        "payments",
        config(),
        funds.clone(),
        Box::new(FileStore::open(&path).unwrap()),
    );
    let report = p.recover().await.unwrap();

    assert_eq!(report.precommitted, 1);
    assert_eq!(funds.available(), 4);
    assert_eq!(p.phase(tx).await, Some(ParticipantPhase::Precommitted));

    p.on_decision(tx, Decision::Commit).await.unwrap();
    assert_eq!(funds.sold(), 1);
}

#[tokio::test]
async fn envelope_requests_through_handler() {
    let p = Participant::new(
        "bookings",
        config(),
        InventoryResource::new(0),
        Box::new(MemoryStore::new()),
    );
    let tx = TransactionId::from_u128(5);
    let body = Envelope::encode_message(ProtocolMessage::Prepare(tx)).unwrap();

    let response = p.handle_request(PREPARE_PATH, &body).await.unwrap();

    assert_eq!(
        Envelope::decode_message(&response).unwrap(),
        ProtocolMessage::Vote(tx, Vote::No)
    );
}
