//! Participant configuration.

use std::time::Duration;

/// Configuration for a participant.
#[derive(Debug, Clone)]
pub struct ParticipantConfig {
    /// How long a prepared transaction waits for the coordinator before the
    /// participant aborts it on its own.
    pub prepare_timeout: Duration,
    /// Whether every log append is synced.
    ///
    /// The `Prepared` and `PreCommitted` records are synced regardless.
    pub sync_on_write: bool,
    /// How often the timeout monitor scans for silent coordinators.
    pub timeout_scan_interval: Duration,
    /// How long a forgotten transaction's outcome is still remembered.
    ///
    /// Within this window a late `Prepare` or decision for it is answered
    /// from the remembered outcome instead of starting over.
    pub completed_retention: Duration,
}

impl ParticipantConfig {
    /// Sets the prepare timeout.
    pub fn with_prepare_timeout(mut self, timeout: Duration) -> Self {
        self.prepare_timeout = timeout;
        self
    }

    /// Sets whether every append is synced.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets the timeout monitor interval.
    pub fn with_timeout_scan_interval(mut self, interval: Duration) -> Self {
        self.timeout_scan_interval = interval;
        self
    }

    /// Sets how long forgotten outcomes are remembered.
    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }
}

impl Default for ParticipantConfig {
    fn default() -> Self {
        Self {
            prepare_timeout: Duration::from_secs(30),
            sync_on_write: true,
            timeout_scan_interval: Duration::from_secs(1),
            completed_retention: Duration::from_secs(3600),
        }
    }
}
