//! Property tests: atomicity under votes, crashes and transport faults.

use proptest::prelude::*;
use triphase_coordinator::CoordinatorError;
use triphase_core::ParticipantPhase;
use triphase_participant::{InventoryResource, Participant, ParticipantConfig, ProtocolHandler};
use triphase_protocol::{ParticipantId, ProtocolMessage, TransactionId, Vote};
use triphase_storage::MemoryStore;
use triphase_testkit::prelude::*;

const NAMES: [&str; 3] = ["flights", "hotels", "cars"];

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .start_paused(true)
        .build()
        .unwrap()
}

fn retarget(message: ProtocolMessage, tx: TransactionId) -> ProtocolMessage {
    match message {
        ProtocolMessage::Prepare(_) => ProtocolMessage::Prepare(tx),
        ProtocolMessage::PreCommit(_) => ProtocolMessage::PreCommit(tx),
        ProtocolMessage::Decision(_, d) => ProtocolMessage::Decision(tx, d),
        ProtocolMessage::Vote(_, v) => ProtocolMessage::Vote(tx, v),
        ProtocolMessage::Ack(_) => ProtocolMessage::Ack(tx),
        ProtocolMessage::DecisionAck(_) => ProtocolMessage::DecisionAck(tx),
        ProtocolMessage::Nack(_, r) => ProtocolMessage::Nack(tx, r),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn commits_exactly_when_every_vote_is_yes(votes in vote_plan_strategy(NAMES.len())) {
        runtime().block_on(async {
            let cluster = Cluster::new(&NAMES, 1);
            let handle = cluster.begin_all().unwrap();
            for (name, vote) in NAMES.iter().zip(&votes) {
                if *vote == Vote::No {
                    cluster.resource(name).set_demand(handle.id(), 2);
                }
            }

            let outcome = cluster.coordinator().drive(&handle).await.unwrap();
            let unanimous = votes.iter().all(|v| v.is_yes());
            prop_assert_eq!(outcome.is_committed(), unanimous);

            let expected = if unanimous {
                ParticipantPhase::Committed
            } else {
                ParticipantPhase::Aborted
            };
            prop_assert_eq!(cluster.agreed_phase(handle.id()).await, Some(expected));

            if !unanimous {
                for name in NAMES {
                    let p = ParticipantId::new(name);
                    prop_assert_eq!(cluster.transport().delivered(&p, RequestKind::PreCommit), 0);
                }
            }
            Ok(())
        })?;
    }

    #[test]
    fn coordinator_crash_anywhere_recovers_atomically(crash_after in crash_point_strategy()) {
        runtime().block_on(async {
            let mut cluster = Cluster::new(&NAMES, 10);
            cluster.coordinator_store().crash_after_appends(crash_after);

            let handle = match cluster.begin_all() {
                Ok(handle) => handle,
                Err(_) => {
                    // nothing was logged, so nothing may be recovered
                    let report = cluster.restart_coordinator().await.unwrap();
                    prop_assert!(report.resolved.is_empty());
                    return Ok(());
                }
            };
            let _ = cluster.coordinator().drive(&handle).await;

            let precommitted = cluster
                .local_phases(handle.id())
                .await
                .values()
                .any(|p| *p == Some(ParticipantPhase::Precommitted));

            let report = cluster.restart_coordinator().await.unwrap();
            prop_assert!(report.unresolved.is_empty());

            let agreed = cluster.agreed_phase(handle.id()).await;
            prop_assert!(matches!(
                agreed,
                Some(ParticipantPhase::Committed | ParticipantPhase::Aborted)
            ));
            if precommitted {
                prop_assert_eq!(agreed, Some(ParticipantPhase::Committed));
            }
            Ok(())
        })?;
    }

    #[test]
    fn transport_faults_never_split_the_outcome(plan in fault_plan_strategy(NAMES.len())) {
        runtime().block_on(async {
            let cluster = Cluster::new(&NAMES, 10);
            let target = ParticipantId::new(NAMES[plan.participant]);
            cluster.transport().fail_next(&target, plan.kind, plan.fault, plan.times);

            let handle = cluster.begin_all().unwrap();
            let first = cluster.coordinator().drive(&handle).await;
            cluster.transport().heal_all();

            let outcome = match first {
                Ok(outcome) => outcome,
                Err(CoordinatorError::CoordinatorTimeout { .. }) => {
                    cluster.coordinator().drive(&handle).await.unwrap()
                }
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            };

            let expected = if outcome.is_committed() {
                ParticipantPhase::Committed
            } else {
                ParticipantPhase::Aborted
            };
            prop_assert_eq!(cluster.agreed_phase(handle.id()).await, Some(expected));
            Ok(())
        })?;
    }

    #[test]
    fn terminal_participant_states_are_final(
        messages in prop::collection::vec(protocol_message_strategy(), 1..20),
    ) {
        runtime().block_on(async {
            let tx = TransactionId::from_u128(7);
            let participant = Participant::new(
                "flights",
                ParticipantConfig::default(),
                InventoryResource::new(5),
                Box::new(MemoryStore::new()),
            );

            let mut settled: Option<ParticipantPhase> = None;
            for message in messages {
                participant.handle(retarget(message, tx)).await;
                let phase = participant.phase(tx).await;
                if let Some(terminal) = settled {
                    prop_assert_eq!(phase, Some(terminal));
                } else if let Some(p) = phase.filter(|p| p.is_terminal()) {
                    settled = Some(p);
                }
            }
            Ok(())
        })?;
    }
}
