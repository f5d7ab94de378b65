//! Test fixtures.
//!
//! A [`Cluster`] is one coordinator and a set of in-process participants,
//! each selling from its own [`InventoryResource`]. Every request goes
//! through a [`FaultyTransport`], the coordinator logs to a
//! [`CrashableStore`] and every participant logs to its own
//! [`MemoryStore`], so any node can be crashed and restarted mid-protocol.

use crate::crash::CrashableStore;
use crate::faults::FaultyTransport;
use std::collections::BTreeMap;
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::info;
use tracing_subscriber::EnvFilter;
use triphase_coordinator::{
    Coordinator, CoordinatorConfig, CoordinatorResult, LocalTransport,
    RecoveryReport as CoordinatorRecovery, RetryConfig, TransactionHandle, TransactionOutcome,
};
use triphase_core::ParticipantPhase;
use triphase_participant::{
    InventoryResource, Participant, ParticipantConfig, ParticipantResult,
    RecoveryReport as ParticipantRecovery,
};
use triphase_protocol::{ParticipantId, TransactionId};
use triphase_storage::MemoryStore;

/// Installs a test-friendly tracing subscriber once per process.
///
/// Honors `RUST_LOG`; defaults to `warn`.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// The transport type a [`Cluster`] coordinator uses.
pub type ClusterTransport = Arc<FaultyTransport<LocalTransport>>;

/// A participant as the cluster runs it.
pub type ClusterParticipant = Participant<InventoryResource>;

struct Node {
    participant: Arc<ClusterParticipant>,
    resource: InventoryResource,
    store: MemoryStore,
}

/// A coordinator plus in-process participants.
pub struct Cluster {
    coordinator_config: CoordinatorConfig,
    participant_config: ParticipantConfig,
    transport: ClusterTransport,
    nodes: BTreeMap<ParticipantId, Node>,
    coordinator_store: CrashableStore,
    coordinator: Coordinator<ClusterTransport>,
}

impl Cluster {
    /// Creates a cluster whose participants each start with `units`
    /// available, using the short test timeouts.
    pub fn new(names: &[&str], units: u64) -> Self {
        Self::with_config(
            names,
            units,
            Self::test_coordinator_config(),
            Self::test_participant_config(),
        )
    }

    /// Creates a cluster with explicit configurations.
    pub fn with_config(
        names: &[&str],
        units: u64,
        coordinator_config: CoordinatorConfig,
        participant_config: ParticipantConfig,
    ) -> Self {
        init_tracing();

        let transport = Arc::new(FaultyTransport::new(LocalTransport::new()));
        let mut nodes = BTreeMap::new();
        for name in names {
            let id = ParticipantId::new(*name);
            let resource = InventoryResource::new(units);
            let store = MemoryStore::new();
            let participant = Arc::new(Participant::new(
                id.clone(),
                participant_config.clone(),
                resource.clone(),
                Box::new(store.clone()),
            ));
            transport.inner().register(participant.clone());
            nodes.insert(
                id,
                Node {
                    participant,
                    resource,
                    store,
                },
            );
        }

        let coordinator_store = CrashableStore::new();
        let coordinator = Coordinator::new(
            coordinator_config.clone(),
            Arc::clone(&transport),
            Box::new(coordinator_store.clone()),
        );

        Self {
            coordinator_config,
            participant_config,
            transport,
            nodes,
            coordinator_store,
            coordinator,
        }
    }

    /// Coordinator settings with sub-second deadlines and a three-attempt,
    /// jitter-free retry budget.
    pub fn test_coordinator_config() -> CoordinatorConfig {
        CoordinatorConfig::default()
            .with_vote_timeout(Duration::from_millis(500))
            .with_precommit_timeout(Duration::from_millis(500))
            .with_decision_timeout(Duration::from_millis(500))
            .with_retry(
                RetryConfig::new(3)
                    .with_initial_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(100))
                    .with_jitter(false),
            )
    }

    /// Participant settings that give up on a silent coordinator after two
    /// seconds.
    pub fn test_participant_config() -> ParticipantConfig {
        ParticipantConfig::default()
            .with_prepare_timeout(Duration::from_secs(2))
            .with_timeout_scan_interval(Duration::from_millis(100))
    }

    /// Returns the coordinator.
    pub fn coordinator(&self) -> &Coordinator<ClusterTransport> {
        &self.coordinator
    }

    /// Returns the fault-injecting transport.
    pub fn transport(&self) -> &FaultyTransport<LocalTransport> {
        &self.transport
    }

    /// Returns the coordinator's store.
    pub fn coordinator_store(&self) -> &CrashableStore {
        &self.coordinator_store
    }

    /// Returns every participant ID, sorted.
    pub fn participant_ids(&self) -> Vec<ParticipantId> {
        self.nodes.keys().cloned().collect()
    }

    fn node(&self, name: &str) -> &Node {
        self.nodes
            .get(&ParticipantId::new(name))
            .unwrap_or_else(|| panic!("no participant named {name}"))
    }

    /// Returns a participant by name.
    ///
    /// # Panics
    ///
    /// Panics if there is no such participant.
    pub fn participant(&self, name: &str) -> Arc<ClusterParticipant> {
        Arc::clone(&self.node(name).participant)
    }

    /// Returns a participant's resource.
    ///
    /// # Panics
    ///
    /// Panics if there is no such participant.
    pub fn resource(&self, name: &str) -> InventoryResource {
        self.node(name).resource.clone()
    }

    /// Begins a transaction across every participant.
    pub fn begin_all(&self) -> CoordinatorResult<TransactionHandle> {
        self.coordinator.begin_transaction(self.participant_ids())
    }

    /// Runs a transaction across every participant.
    pub async fn submit_all(&self) -> CoordinatorResult<TransactionOutcome> {
        self.coordinator.submit(self.participant_ids()).await
    }

    /// Crashes the coordinator and starts a new one over whatever its log
    /// synced, then runs restart recovery.
    pub async fn restart_coordinator(&mut self) -> CoordinatorResult<CoordinatorRecovery> {
        let store = self.coordinator_store.reboot();
        info!(log_bytes = store.image().synced_len(), "restarting coordinator");
        self.coordinator = Coordinator::new(
            self.coordinator_config.clone(),
            Arc::clone(&self.transport),
            Box::new(store.clone()),
        );
        self.coordinator_store = store;
        self.coordinator.recover_on_restart().await
    }

    /// Crashes a participant and brings it back from its log.
    ///
    /// The resource keeps its ledger across the restart.
    ///
    /// # Panics
    ///
    /// Panics if there is no such participant.
    pub async fn restart_participant(&mut self, name: &str) -> ParticipantResult<ParticipantRecovery> {
        let id = ParticipantId::new(name);
        let config = self.participant_config.clone();
        let node = self
            .nodes
            .get_mut(&id)
            .unwrap_or_else(|| panic!("no participant named {name}"));

        self.transport.inner().unregister(&id);
        node.store.simulate_crash();
        info!(participant = %id, "restarting participant");

        let participant = Arc::new(Participant::new(
            id,
            config,
            node.resource.clone(),
            Box::new(node.store.clone()),
        ));
        let report = participant.recover().await?;
        self.transport.inner().register(participant.clone());
        node.participant = participant;
        Ok(report)
    }

    /// Starts every participant's timeout monitor.
    pub fn spawn_timeout_monitors(&self) -> Vec<JoinHandle<()>> {
        self.nodes
            .values()
            .map(|node| node.participant.spawn_timeout_monitor())
            .collect()
    }

    /// Returns each participant's local phase for `tx`.
    pub async fn local_phases(&self, tx: TransactionId) -> BTreeMap<ParticipantId, Option<ParticipantPhase>> {
        let mut phases = BTreeMap::new();
        for (id, node) in &self.nodes {
            phases.insert(id.clone(), node.participant.phase(tx).await);
        }
        phases
    }

    /// Returns the phase every participant is in, if they all agree.
    pub async fn agreed_phase(&self, tx: TransactionId) -> Option<ParticipantPhase> {
        let phases = self.local_phases(tx).await;
        let mut values = phases.into_values();
        let first = values.next()??;
        values.all(|p| p == Some(first)).then_some(first)
    }

    /// Returns true unless one participant committed `tx` while another
    /// aborted it.
    pub async fn is_atomic(&self, tx: TransactionId) -> bool {
        let phases = self.local_phases(tx).await;
        let committed = phases
            .values()
            .any(|p| *p == Some(ParticipantPhase::Committed));
        let aborted = phases
            .values()
            .any(|p| *p == Some(ParticipantPhase::Aborted));
        !(committed && aborted)
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("participants", &self.nodes.keys().collect::<Vec<_>>())
            .field("coordinator", &self.coordinator)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fresh_cluster_commits() {
        let cluster = Cluster::new(&["flights", "hotels"], 2);
        let outcome = cluster.submit_all().await.unwrap();
        assert!(outcome.is_committed());
        assert_eq!(
            cluster.agreed_phase(outcome.tx).await,
            Some(ParticipantPhase::Committed)
        );
        assert_eq!(cluster.resource("hotels").sold(), 1);
    }

    #[tokio::test]
    async fn restarted_participant_remembers_outcome() {
        let mut cluster = Cluster::new(&["flights"], 2);
        let outcome = cluster.submit_all().await.unwrap();

        let report = cluster.restart_participant("flights").await.unwrap();
        assert_eq!(report.terminal, 1);
        assert_eq!(
            cluster.participant("flights").phase(outcome.tx).await,
            Some(ParticipantPhase::Committed)
        );
    }
}
