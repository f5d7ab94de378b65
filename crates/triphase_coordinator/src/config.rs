//! Configuration for the coordinator.

use rand::Rng;
use std::time::Duration;

/// Configuration for a coordinator.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// How long each participant has to answer `Prepare`.
    pub vote_timeout: Duration,
    /// How long each participant has to acknowledge `PreCommit`.
    pub precommit_timeout: Duration,
    /// How long each participant has to acknowledge the decision, per
    /// attempt.
    pub decision_timeout: Duration,
    /// Redelivery policy for precommit after the first ack, and for the
    /// final decision.
    pub retry: RetryConfig,
    /// Whether every log append is synced.
    pub sync_on_write: bool,
    /// How long finished transactions stay queryable before
    /// [`Coordinator::collect_garbage`](crate::Coordinator::collect_garbage)
    /// drops them.
    pub completed_retention: Duration,
}

impl CoordinatorConfig {
    /// Sets the vote timeout.
    pub fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    /// Sets the precommit timeout.
    pub fn with_precommit_timeout(mut self, timeout: Duration) -> Self {
        self.precommit_timeout = timeout;
        self
    }

    /// Sets the per-attempt decision timeout.
    pub fn with_decision_timeout(mut self, timeout: Duration) -> Self {
        self.decision_timeout = timeout;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Sets whether every append is synced.
    ///
    /// Turning this off trades durability for speed; recovery is then only
    /// as good as the last explicit sync.
    pub fn with_sync_on_write(mut self, sync: bool) -> Self {
        self.sync_on_write = sync;
        self
    }

    /// Sets how long finished transactions are retained in memory.
    pub fn with_completed_retention(mut self, retention: Duration) -> Self {
        self.completed_retention = retention;
        self
    }
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            vote_timeout: Duration::from_secs(5),
            precommit_timeout: Duration::from_secs(5),
            decision_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
            sync_on_write: true,
            completed_retention: Duration::from_secs(300),
        }
    }
}

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of delivery attempts, the first one included.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add up to 25% random jitter to delays.
    pub add_jitter: bool,
}

impl RetryConfig {
    /// Creates a retry configuration allowing `max_attempts` attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
        }
    }

    /// Creates a configuration with a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_multiplier: 1.0,
            add_jitter: false,
        }
    }

    /// Sets the initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets whether delays get jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.add_jitter = jitter;
        self
    }

    /// Calculates the delay before a given attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let base_delay = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let delay_secs = base_delay.min(self.max_delay.as_secs_f64());

        if self.add_jitter && delay_secs > 0.0 {
            let jitter = delay_secs * 0.25 * rand::thread_rng().gen::<f64>();
            Duration::from_secs_f64(delay_secs + jitter)
        } else {
            Duration::from_secs_f64(delay_secs)
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(5)
    }
}
