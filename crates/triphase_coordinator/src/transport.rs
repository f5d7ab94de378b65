//! Transport layer between the coordinator and its participants.

use crate::error::{TransportError, TransportResult};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use triphase_participant::ProtocolHandler;
use triphase_protocol::{Decision, ParticipantId, ProtocolMessage, TransactionId, Vote};

/// Delivers protocol requests to participants.
///
/// Implementations only need [`ParticipantTransport::send`]; the typed
/// per-phase calls are built on it. Delivery is at-least-once: the
/// coordinator may send the same request several times, and participants
/// answer duplicates from their recorded state.
///
/// Deadlines are applied by the coordinator, not the transport.
#[async_trait]
pub trait ParticipantTransport: Send + Sync {
    /// Sends one request and waits for its response.
    async fn send(
        &self,
        participant: &ParticipantId,
        request: ProtocolMessage,
    ) -> TransportResult<ProtocolMessage>;

    /// Phase 1: asks for a vote.
    async fn prepare(&self, participant: &ParticipantId, tx: TransactionId) -> TransportResult<Vote> {
        match expect_reply(participant, tx, self.send(participant, ProtocolMessage::Prepare(tx)).await?)? {
            ProtocolMessage::Vote(_, vote) => Ok(vote),
            other => Err(unexpected(participant, "Vote", &other)),
        }
    }

    /// Phase 2: asks the participant to precommit.
    async fn precommit(&self, participant: &ParticipantId, tx: TransactionId) -> TransportResult<()> {
        match expect_reply(participant, tx, self.send(participant, ProtocolMessage::PreCommit(tx)).await?)? {
            ProtocolMessage::Ack(_) => Ok(()),
            other => Err(unexpected(participant, "Ack", &other)),
        }
    }

    /// Phase 3: delivers the final decision.
    async fn decide(
        &self,
        participant: &ParticipantId,
        tx: TransactionId,
        decision: Decision,
    ) -> TransportResult<()> {
        let request = ProtocolMessage::Decision(tx, decision);
        match expect_reply(participant, tx, self.send(participant, request).await?)? {
            ProtocolMessage::DecisionAck(_) => Ok(()),
            other => Err(unexpected(participant, "DecisionAck", &other)),
        }
    }
}

#[async_trait]
impl<T: ParticipantTransport + ?Sized> ParticipantTransport for Arc<T> {
    async fn send(
        &self,
        participant: &ParticipantId,
        request: ProtocolMessage,
    ) -> TransportResult<ProtocolMessage> {
        (**self).send(participant, request).await
    }
}

fn expect_reply(
    participant: &ParticipantId,
    tx: TransactionId,
    response: ProtocolMessage,
) -> TransportResult<ProtocolMessage> {
    if response.tx_id() != tx {
        return Err(TransportError::Protocol(format!(
            "{participant} answered for {} instead of {tx}",
            response.tx_id()
        )));
    }
    match response {
        ProtocolMessage::Nack(_, reason) => Err(TransportError::Rejected {
            participant: participant.clone(),
            reason,
        }),
        other => Ok(other),
    }
}

fn unexpected(participant: &ParticipantId, expected: &str, actual: &ProtocolMessage) -> TransportError {
    TransportError::Protocol(format!(
        "{participant} sent {} where {expected} was expected",
        actual.kind()
    ))
}

/// In-process transport that calls registered handlers directly.
///
/// Removing a handler makes its participant unreachable, which is how
/// tests model a crashed or partitioned participant.
#[derive(Default)]
pub struct LocalTransport {
    handlers: RwLock<HashMap<ParticipantId, Arc<dyn ProtocolHandler>>>,
}

impl LocalTransport {
    /// Creates an empty transport.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler under its participant ID, replacing any earlier
    /// one.
    pub fn register(&self, handler: Arc<dyn ProtocolHandler>) {
        let id = handler.participant_id().clone();
        self.handlers.write().insert(id, handler);
    }

    /// Removes a participant's handler.
    pub fn unregister(&self, participant: &ParticipantId) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.write().remove(participant)
    }

    /// Returns true if a handler is registered for `participant`.
    pub fn is_registered(&self, participant: &ParticipantId) -> bool {
        self.handlers.read().contains_key(participant)
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut participants: Vec<_> = self.handlers.read().keys().cloned().collect();
        participants.sort();
        f.debug_struct("LocalTransport")
            .field("participants", &participants)
            .finish()
    }
}

#[async_trait]
impl ParticipantTransport for LocalTransport {
    async fn send(
        &self,
        participant: &ParticipantId,
        request: ProtocolMessage,
    ) -> TransportResult<ProtocolMessage> {
        let handler = self
            .handlers
            .read()
            .get(participant)
            .cloned()
            .ok_or_else(|| TransportError::unreachable(participant, "no handler registered"))?;
        Ok(handler.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use triphase_protocol::NackReason;

    struct Scripted {
        id: ParticipantId,
        reply: fn(ProtocolMessage) -> ProtocolMessage,
    }

    #[async_trait]
    impl ProtocolHandler for Scripted {
        fn participant_id(&self) -> &ParticipantId {
            &self.id
        }

        async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
            (self.reply)(message)
        }
    }

    fn transport(reply: fn(ProtocolMessage) -> ProtocolMessage) -> (LocalTransport, ParticipantId) {
        let id = ParticipantId::new("flights");
        let transport = LocalTransport::new();
        transport.register(Arc::new(Scripted {
            id: id.clone(),
            reply,
        }));
        (transport, id)
    }

    #[tokio::test]
    async fn typed_calls_interpret_replies() {
        let (transport, p) = transport(|m| match m {
            ProtocolMessage::Prepare(tx) => ProtocolMessage::Vote(tx, Vote::No),
            ProtocolMessage::PreCommit(tx) => ProtocolMessage::Ack(tx),
            other => ProtocolMessage::DecisionAck(other.tx_id()),
        });
        let tx = TransactionId::from_u128(1);

        assert_eq!(transport.prepare(&p, tx).await.unwrap(), Vote::No);
        transport.precommit(&p, tx).await.unwrap();
        transport.decide(&p, tx, Decision::Abort).await.unwrap();
    }

    #[tokio::test]
    async fn nack_becomes_rejected() {
        let (transport, p) = transport(|m| ProtocolMessage::Nack(m.tx_id(), NackReason::AlreadyAborted));
        let err = transport
            .precommit(&p, TransactionId::from_u128(2))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TransportError::Rejected {
                participant: p,
                reason: NackReason::AlreadyAborted,
            }
        );
    }

    #[tokio::test]
    async fn wrong_reply_kind_is_protocol_error() {
        let (transport, p) = transport(|m| ProtocolMessage::Ack(m.tx_id()));
        let err = transport
            .prepare(&p, TransactionId::from_u128(3))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn reply_for_other_transaction_is_protocol_error() {
        let (transport, p) =
            transport(|_| ProtocolMessage::Vote(TransactionId::from_u128(99), Vote::Yes));
        let err = transport
            .prepare(&p, TransactionId::from_u128(4))
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Protocol(_)));
    }

    #[tokio::test]
    async fn unregistered_is_unreachable() {
        let (transport, p) = transport(|m| m);
        assert!(transport.unregister(&p).is_some());
        assert!(!transport.is_registered(&p));

        let err = transport
            .prepare(&p, TransactionId::from_u128(5))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }
}
