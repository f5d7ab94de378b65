//! HTTP transport implementation.
//!
//! Requests are CBOR [`Envelope`]s posted to
//! `{base}/3pc/{prepare|precommit|decision}`. The HTTP client itself is
//! abstracted by [`HttpClient`] so any library can carry the bytes.

use crate::error::{TransportError, TransportResult};
use crate::transport::ParticipantTransport;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use triphase_participant::{path_for, ProtocolHandler};
use triphase_protocol::{Envelope, ParticipantId, ProtocolMessage};

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// HTTP-based participant transport.
///
/// Each participant is reached at its own base URL.
pub struct HttpTransport<C: HttpClient> {
    client: C,
    endpoints: RwLock<HashMap<ParticipantId, String>>,
}

impl<C: HttpClient> HttpTransport<C> {
    /// Creates a transport with no endpoints.
    pub fn new(client: C) -> Self {
        Self {
            client,
            endpoints: RwLock::new(HashMap::new()),
        }
    }

    /// Adds an endpoint, builder style.
    pub fn with_endpoint(self, participant: impl Into<ParticipantId>, base_url: impl Into<String>) -> Self {
        self.set_endpoint(participant, base_url);
        self
    }

    /// Sets or replaces a participant's base URL.
    pub fn set_endpoint(&self, participant: impl Into<ParticipantId>, base_url: impl Into<String>) {
        let base_url: String = base_url.into();
        self.endpoints
            .write()
            .insert(participant.into(), base_url.trim_end_matches('/').to_string());
    }

    /// Returns a participant's base URL.
    pub fn endpoint(&self, participant: &ParticipantId) -> Option<String> {
        self.endpoints.read().get(participant).cloned()
    }

    /// Returns the HTTP client.
    pub fn client(&self) -> &C {
        &self.client
    }
}

#[async_trait]
impl<C: HttpClient> ParticipantTransport for HttpTransport<C> {
    async fn send(
        &self,
        participant: &ParticipantId,
        request: ProtocolMessage,
    ) -> TransportResult<ProtocolMessage> {
        let path = path_for(&request).ok_or_else(|| {
            TransportError::Protocol(format!("{} is not a request", request.kind()))
        })?;
        let base = self
            .endpoint(participant)
            .ok_or_else(|| TransportError::unreachable(participant, "no endpoint configured"))?;

        let url = format!("{base}{path}");
        let body = Envelope::encode_message(request)?;
        debug!(participant = %participant, url = %url, bytes = body.len(), "posting");

        let response = self
            .client
            .post(&url, body)
            .await
            .map_err(|e| TransportError::unreachable(participant, e))?;

        Ok(Envelope::decode_message(&response)?)
    }
}

impl<C: HttpClient> std::fmt::Debug for HttpTransport<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoints", &*self.endpoints.read())
            .finish_non_exhaustive()
    }
}

/// Trait for servers that can handle loopback requests.
#[async_trait]
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

#[async_trait]
impl<H: ProtocolHandler + ?Sized> LoopbackServer for H {
    async fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        self.handle_request(path, body)
            .await
            .map_err(|e| e.to_string())
    }
}

/// A loopback HTTP client that routes posts straight into in-process
/// servers, keyed by base URL.
///
/// Useful for exercising the full encode/decode path without a network.
#[derive(Default)]
pub struct LoopbackClient {
    servers: RwLock<HashMap<String, Arc<dyn LoopbackServer>>>,
}

impl LoopbackClient {
    /// Creates a client with no routes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Routes posts under `base_url` to `server`.
    pub fn route(&self, base_url: impl Into<String>, server: Arc<dyn LoopbackServer>) {
        let base_url: String = base_url.into();
        self.servers
            .write()
            .insert(base_url.trim_end_matches('/').to_string(), server);
    }

    /// Removes a route; later posts to it fail as if the host were down.
    pub fn unroute(&self, base_url: &str) -> bool {
        self.servers
            .write()
            .remove(base_url.trim_end_matches('/'))
            .is_some()
    }
}

#[async_trait]
impl HttpClient for LoopbackClient {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        let split = url.find("/3pc/").ok_or_else(|| format!("no route for {url}"))?;
        let (base, path) = url.split_at(split);

        let server = self
            .servers
            .read()
            .get(base)
            .cloned()
            .ok_or_else(|| format!("connection refused: {base}"))?;

        server.handle_post(path, &body).await
    }
}

#[async_trait]
impl<C: HttpClient + ?Sized> HttpClient for Arc<C> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        (**self).post(url, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use triphase_protocol::{Decision, NackReason, TransactionId, Vote};

    struct RecordingClient {
        urls: Mutex<Vec<String>>,
        reply: ProtocolMessage,
    }

    #[async_trait]
    impl HttpClient for RecordingClient {
        async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
            Envelope::decode_message(&body).map_err(|e| e.to_string())?;
            self.urls.lock().push(url.to_string());
            Envelope::encode_message(self.reply.clone()).map_err(|e| e.to_string())
        }
    }

    fn transport(reply: ProtocolMessage) -> HttpTransport<RecordingClient> {
        HttpTransport::new(RecordingClient {
            urls: Mutex::new(Vec::new()),
            reply,
        })
        .with_endpoint("flights", "http://flights.internal:8080/")
    }

    #[tokio::test]
    async fn posts_to_phase_paths() {
        let tx = TransactionId::from_u128(1);
        let p = ParticipantId::new("flights");

        let t = transport(ProtocolMessage::Vote(tx, Vote::Yes));
        assert_eq!(t.prepare(&p, tx).await.unwrap(), Vote::Yes);

        let t2 = transport(ProtocolMessage::DecisionAck(tx));
        t2.decide(&p, tx, Decision::Commit).await.unwrap();

        assert_eq!(
            t.client().urls.lock().as_slice(),
            ["http://flights.internal:8080/3pc/prepare"]
        );
        assert_eq!(
            t2.client().urls.lock().as_slice(),
            ["http://flights.internal:8080/3pc/decision"]
        );
    }

    #[tokio::test]
    async fn missing_endpoint_is_unreachable() {
        let tx = TransactionId::from_u128(2);
        let t = transport(ProtocolMessage::Ack(tx));
        let err = t.precommit(&"hotels".into(), tx).await.unwrap_err();
        assert!(matches!(err, TransportError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn nack_over_http() {
        let tx = TransactionId::from_u128(3);
        let t = transport(ProtocolMessage::Nack(tx, NackReason::AlreadyAborted));
        let err = t.precommit(&"flights".into(), tx).await.unwrap_err();
        assert!(matches!(
            err,
            TransportError::Rejected {
                reason: NackReason::AlreadyAborted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn loopback_without_route_refuses() {
        let client = LoopbackClient::new();
        let err = client
            .post("http://down:1/3pc/prepare", Vec::new())
            .await
            .unwrap_err();
        assert!(err.contains("connection refused"));
        assert!(!client.unroute("http://down:1"));
    }
}
