//! Fault injection between the coordinator and its participants.
//!
//! [`FaultyTransport`] wraps any [`ParticipantTransport`] and applies
//! per-participant rules to the requests passing through it. It also keeps
//! a history of every request the wrapped transport actually delivered, so
//! tests can assert on who received what.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let transport = FaultyTransport::new(LocalTransport::new());
//! transport.fail_next(&"hotels".into(), RequestKind::PreCommit, Fault::LoseReply, 2);
//! transport.partition(&"cars".into());
//! ```

use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use triphase_coordinator::{ParticipantTransport, TransportError, TransportResult};
use triphase_protocol::{ParticipantId, ProtocolMessage};

/// The three request types a coordinator sends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    /// Phase 1 `Prepare`.
    Prepare,
    /// Phase 2 `PreCommit`.
    PreCommit,
    /// Phase 3 `Decision`.
    Decision,
}

impl RequestKind {
    /// Classifies a request; replies give `None`.
    pub fn of(message: &ProtocolMessage) -> Option<Self> {
        match message {
            ProtocolMessage::Prepare(_) => Some(Self::Prepare),
            ProtocolMessage::PreCommit(_) => Some(Self::PreCommit),
            ProtocolMessage::Decision(..) => Some(Self::Decision),
            _ => None,
        }
    }
}

/// What happens to a matching request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// The request never arrives.
    Drop,
    /// The request arrives but the reply is lost.
    LoseReply,
    /// Nothing ever comes back; only the caller's deadline ends the wait.
    Hang,
    /// The request arrives after a delay.
    Delay(Duration),
    /// The request arrives twice; the second reply is returned.
    Duplicate,
}

#[derive(Debug, Clone)]
struct Rule {
    participant: ParticipantId,
    kind: Option<RequestKind>,
    fault: Fault,
    /// `None` means until healed.
    remaining: Option<usize>,
}

impl Rule {
    fn matches(&self, participant: &ParticipantId, kind: RequestKind) -> bool {
        self.participant == *participant
            && self.kind.map_or(true, |k| k == kind)
            && self.remaining != Some(0)
    }
}

/// A transport that misbehaves on command.
pub struct FaultyTransport<T> {
    inner: T,
    rules: Mutex<Vec<Rule>>,
    delivered: Mutex<Vec<(ParticipantId, ProtocolMessage)>>,
}

impl<T: ParticipantTransport> FaultyTransport<T> {
    /// Wraps `inner` with no faults configured.
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    /// Returns the wrapped transport.
    pub fn inner(&self) -> &T {
        &self.inner
    }

    /// Adds a rule. `kind: None` matches every request; `times: None` keeps
    /// the rule until [`FaultyTransport::heal`].
    ///
    /// Rules are checked in the order they were added.
    pub fn inject(
        &self,
        participant: &ParticipantId,
        kind: Option<RequestKind>,
        fault: Fault,
        times: Option<usize>,
    ) {
        self.rules.lock().push(Rule {
            participant: participant.clone(),
            kind,
            fault,
            remaining: times,
        });
    }

    /// Applies `fault` to the next `times` requests of `kind`.
    pub fn fail_next(&self, participant: &ParticipantId, kind: RequestKind, fault: Fault, times: usize) {
        self.inject(participant, Some(kind), fault, Some(times));
    }

    /// Drops every request to `participant` until healed.
    pub fn partition(&self, participant: &ParticipantId) {
        self.inject(participant, None, Fault::Drop, None);
    }

    /// Removes every rule for `participant`.
    pub fn heal(&self, participant: &ParticipantId) {
        self.rules.lock().retain(|rule| rule.participant != *participant);
    }

    /// Removes every rule.
    pub fn heal_all(&self) {
        self.rules.lock().clear();
    }

    /// Returns every request handed to the wrapped transport, in order.
    pub fn history(&self) -> Vec<(ParticipantId, ProtocolMessage)> {
        self.delivered.lock().clone()
    }

    /// Counts requests of `kind` delivered to `participant`.
    pub fn delivered(&self, participant: &ParticipantId, kind: RequestKind) -> usize {
        self.delivered
            .lock()
            .iter()
            .filter(|(p, m)| p == participant && RequestKind::of(m) == Some(kind))
            .count()
    }

    /// Forgets the delivery history.
    pub fn clear_history(&self) {
        self.delivered.lock().clear();
    }

    fn next_fault(&self, participant: &ParticipantId, kind: RequestKind) -> Option<Fault> {
        let mut rules = self.rules.lock();
        let rule = rules.iter_mut().find(|rule| rule.matches(participant, kind))?;
        if let Some(remaining) = rule.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(rule.fault)
    }

    async fn forward(
        &self,
        participant: &ParticipantId,
        request: ProtocolMessage,
    ) -> TransportResult<ProtocolMessage> {
        self.delivered
            .lock()
            .push((participant.clone(), request.clone()));
        self.inner.send(participant, request).await
    }
}

#[async_trait]
impl<T: ParticipantTransport> ParticipantTransport for FaultyTransport<T> {
    async fn send(
        &self,
        participant: &ParticipantId,
        request: ProtocolMessage,
    ) -> TransportResult<ProtocolMessage> {
        let fault = RequestKind::of(&request).and_then(|kind| self.next_fault(participant, kind));

        match fault {
            None => self.forward(participant, request).await,
            Some(Fault::Drop) => Err(TransportError::unreachable(participant, "request dropped")),
            Some(Fault::LoseReply) => {
                self.forward(participant, request).await?;
                Err(TransportError::unreachable(participant, "reply lost"))
            }
            Some(Fault::Hang) => std::future::pending().await,
            Some(Fault::Delay(delay)) => {
                tokio::time::sleep(delay).await;
                self.forward(participant, request).await
            }
            Some(Fault::Duplicate) => {
                // the first reply is discarded
                let _ = self.forward(participant, request.clone()).await;
                self.forward(participant, request).await
            }
        }
    }
}

impl<T> std::fmt::Debug for FaultyTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FaultyTransport")
            .field("rules", &*self.rules.lock())
            .field("delivered", &self.delivered.lock().len())
            .finish_non_exhaustive()
    }
}
