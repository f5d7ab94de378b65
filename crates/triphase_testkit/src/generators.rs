//! Property-based test generators using proptest.
//!
//! Provides strategies for identifiers, protocol messages, vote plans and
//! fault schedules.

use crate::faults::{Fault, RequestKind};
use proptest::prelude::*;
use std::time::Duration;
use triphase_protocol::{Decision, NackReason, ParticipantId, ProtocolMessage, TransactionId, Vote};

/// Strategy for generating transaction IDs.
pub fn transaction_id_strategy() -> impl Strategy<Value = TransactionId> {
    any::<u128>().prop_map(TransactionId::from_u128)
}

/// Strategy for generating participant names.
pub fn participant_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9-]{0,15}").expect("Invalid regex")
}

/// Strategy for generating a non-empty set of distinct participant IDs, in
/// sorted order.
pub fn participant_set_strategy(max: usize) -> impl Strategy<Value = Vec<ParticipantId>> {
    prop::collection::btree_set(participant_name_strategy(), 1..=max.max(1))
        .prop_map(|names| names.into_iter().map(ParticipantId::new).collect())
}

/// Strategy for generating votes.
pub fn vote_strategy() -> impl Strategy<Value = Vote> {
    prop_oneof![Just(Vote::Yes), Just(Vote::No)]
}

/// Strategy for generating one vote per participant, weighted toward `Yes`
/// so unanimous plans show up often.
pub fn vote_plan_strategy(participants: usize) -> impl Strategy<Value = Vec<Vote>> {
    prop::collection::vec(
        prop_oneof![3 => Just(Vote::Yes), 1 => Just(Vote::No)],
        participants,
    )
}

/// Strategy for generating decisions.
pub fn decision_strategy() -> impl Strategy<Value = Decision> {
    prop_oneof![Just(Decision::Commit), Just(Decision::Abort)]
}

/// Strategy for generating any protocol message.
pub fn protocol_message_strategy() -> impl Strategy<Value = ProtocolMessage> {
    let reason = prop_oneof![
        Just(NackReason::AlreadyAborted),
        Just(NackReason::InvalidState),
        Just(NackReason::Inconsistent),
    ];
    prop_oneof![
        transaction_id_strategy().prop_map(ProtocolMessage::Prepare),
        (transaction_id_strategy(), vote_strategy()).prop_map(|(tx, v)| ProtocolMessage::Vote(tx, v)),
        transaction_id_strategy().prop_map(ProtocolMessage::PreCommit),
        transaction_id_strategy().prop_map(ProtocolMessage::Ack),
        (transaction_id_strategy(), decision_strategy())
            .prop_map(|(tx, d)| ProtocolMessage::Decision(tx, d)),
        transaction_id_strategy().prop_map(ProtocolMessage::DecisionAck),
        (transaction_id_strategy(), reason).prop_map(|(tx, r)| ProtocolMessage::Nack(tx, r)),
    ]
}

/// Strategy for generating request kinds.
pub fn request_kind_strategy() -> impl Strategy<Value = RequestKind> {
    prop_oneof![
        Just(RequestKind::Prepare),
        Just(RequestKind::PreCommit),
        Just(RequestKind::Decision),
    ]
}

/// Strategy for generating faults that eventually let the caller through.
///
/// `Hang` is included; callers rely on their own deadlines.
pub fn fault_strategy() -> impl Strategy<Value = Fault> {
    prop_oneof![
        Just(Fault::Drop),
        Just(Fault::LoseReply),
        Just(Fault::Hang),
        Just(Fault::Duplicate),
        (1u64..200).prop_map(|ms| Fault::Delay(Duration::from_millis(ms))),
    ]
}

/// A fault to inject: which participant (by index), which request, what
/// happens and how many times.
#[derive(Debug, Clone)]
pub struct FaultPlan {
    /// Index into the participant list.
    pub participant: usize,
    /// Request type affected.
    pub kind: RequestKind,
    /// The fault.
    pub fault: Fault,
    /// How many consecutive requests it affects.
    pub times: usize,
}

/// Strategy for generating a fault plan for a cluster of `participants`.
pub fn fault_plan_strategy(participants: usize) -> impl Strategy<Value = FaultPlan> {
    (
        0..participants.max(1),
        request_kind_strategy(),
        fault_strategy(),
        1usize..4,
    )
        .prop_map(|(participant, kind, fault, times)| FaultPlan {
            participant,
            kind,
            fault,
            times,
        })
}

/// Strategy for generating how many coordinator log records get written
/// before a crash.
pub fn crash_point_strategy() -> impl Strategy<Value = usize> {
    0usize..10
}
