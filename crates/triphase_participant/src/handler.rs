//! Protocol message dispatch.
//!
//! A [`ProtocolHandler`] turns one request message into one response
//! message. Transports deliver to a handler directly (in-process) or through
//! [`ProtocolHandler::handle_request`], which works on encoded envelopes
//! keyed by path:
//!
//! | Path              | Request      | Response                   |
//! |-------------------|--------------|----------------------------|
//! | `/3pc/prepare`    | `Prepare`    | `Vote` or `Nack`           |
//! | `/3pc/precommit`  | `PreCommit`  | `Ack` or `Nack`            |
//! | `/3pc/decision`   | `Decision`   | `DecisionAck` or `Nack`    |

use crate::error::{ParticipantError, ParticipantResult};
use crate::participant::Participant;
use crate::resource::ResourceManager;
use async_trait::async_trait;
use tracing::{debug, warn};
use triphase_protocol::{Envelope, NackReason, ParticipantId, ProtocolMessage};

/// Path for `Prepare`.
pub const PREPARE_PATH: &str = "/3pc/prepare";
/// Path for `PreCommit`.
pub const PRECOMMIT_PATH: &str = "/3pc/precommit";
/// Path for `Decision`.
pub const DECISION_PATH: &str = "/3pc/decision";

/// Returns the path a request message is posted to.
#[must_use]
pub fn path_for(message: &ProtocolMessage) -> Option<&'static str> {
    match message {
        ProtocolMessage::Prepare(_) => Some(PREPARE_PATH),
        ProtocolMessage::PreCommit(_) => Some(PRECOMMIT_PATH),
        ProtocolMessage::Decision(..) => Some(DECISION_PATH),
        _ => None,
    }
}

/// Something that answers three-phase commit requests.
#[async_trait]
pub trait ProtocolHandler: Send + Sync {
    /// Returns the ID of the participant behind this handler.
    fn participant_id(&self) -> &ParticipantId;

    /// Answers one request message.
    ///
    /// Failures are reported in-band as `Nack`.
    async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage;

    /// Answers one encoded request posted to `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the body does not decode, or carries a message
    /// that does not belong on `path`.
    async fn handle_request(&self, path: &str, body: &[u8]) -> ParticipantResult<Vec<u8>> {
        let request = Envelope::decode_message(body)?;
        if path_for(&request) != Some(path) {
            return Err(ParticipantError::InvalidRequest(format!(
                "{} posted to {path}",
                request.kind()
            )));
        }
        let response = self.handle(request).await;
        Ok(Envelope::encode_message(response)?)
    }
}

#[async_trait]
impl<R: ResourceManager> ProtocolHandler for Participant<R> {
    fn participant_id(&self) -> &ParticipantId {
        self.id()
    }

    async fn handle(&self, message: ProtocolMessage) -> ProtocolMessage {
        let tx = message.tx_id();
        let result = match message {
            ProtocolMessage::Prepare(tx) => self
                .on_prepare(tx)
                .await
                .map(|vote| ProtocolMessage::Vote(tx, vote)),
            ProtocolMessage::PreCommit(tx) => self
                .on_precommit(tx)
                .await
                .map(|()| ProtocolMessage::Ack(tx)),
            ProtocolMessage::Decision(tx, decision) => self
                .on_decision(tx, decision)
                .await
                .map(|()| ProtocolMessage::DecisionAck(tx)),
            other => {
                warn!(participant = %self.id(), kind = other.kind(), "not a request");
                return ProtocolMessage::Nack(tx, NackReason::InvalidState);
            }
        };

        result.unwrap_or_else(|e| {
            debug!(participant = %self.id(), tx = %tx, error = %e, "nack");
            ProtocolMessage::Nack(tx, e.nack_reason())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ParticipantConfig;
    use crate::inventory::InventoryResource;
    use triphase_protocol::{Decision, TransactionId, Vote};
    use triphase_storage::MemoryStore;

    fn participant() -> Participant<InventoryResource> {
        Participant::new(
            "hotels",
            ParticipantConfig::default(),
            InventoryResource::new(4),
            Box::new(MemoryStore::new()),
        )
    }

    #[tokio::test]
    async fn handle_maps_requests_to_responses() {
        let p = participant();
        let tx = TransactionId::from_u128(1);

        assert_eq!(
            p.handle(ProtocolMessage::Prepare(tx)).await,
            ProtocolMessage::Vote(tx, Vote::Yes)
        );
        assert_eq!(
            p.handle(ProtocolMessage::PreCommit(tx)).await,
            ProtocolMessage::Ack(tx)
        );
        assert_eq!(
            p.handle(ProtocolMessage::Decision(tx, Decision::Commit)).await,
            ProtocolMessage::DecisionAck(tx)
        );
    }

    #[tokio::test]
    async fn errors_become_nacks() {
        let p = participant();
        let tx = TransactionId::from_u128(2);
        p.on_prepare(tx).await.unwrap();
        p.on_decision(tx, Decision::Abort).await.unwrap();

        assert_eq!(
            p.handle(ProtocolMessage::PreCommit(tx)).await,
            ProtocolMessage::Nack(tx, NackReason::AlreadyAborted)
        );
        assert_eq!(
            p.handle(ProtocolMessage::Decision(tx, Decision::Commit)).await,
            ProtocolMessage::Nack(tx, NackReason::Inconsistent)
        );
    }

    #[tokio::test]
    async fn responses_are_not_requests() {
        let p = participant();
        let tx = TransactionId::from_u128(3);
        assert_eq!(
            p.handle(ProtocolMessage::Ack(tx)).await,
            ProtocolMessage::Nack(tx, NackReason::InvalidState)
        );
    }

    #[tokio::test]
    async fn handle_request_round_trip() {
        let p = participant();
        let tx = TransactionId::from_u128(4);
        let body = Envelope::encode_message(ProtocolMessage::Prepare(tx)).unwrap();

        let response = p.handle_request(PREPARE_PATH, &body).await.unwrap();

        assert_eq!(
            Envelope::decode_message(&response).unwrap(),
            ProtocolMessage::Vote(tx, Vote::Yes)
        );
    }

    #[tokio::test]
    async fn handle_request_rejects_wrong_path() {
        let p = participant();
        let body =
            Envelope::encode_message(ProtocolMessage::Prepare(TransactionId::from_u128(5))).unwrap();

        assert!(matches!(
            p.handle_request(DECISION_PATH, &body).await,
            Err(ParticipantError::InvalidRequest(_))
        ));
        assert_eq!(p.transaction_count(), 0);
    }
}
