//! Coordinator counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Coordinator statistics.
///
/// All counters are atomic and can be read while transactions are in
/// progress.
#[derive(Debug, Default)]
pub struct CoordinatorStats {
    /// Transactions begun.
    started: AtomicU64,
    /// Transactions that reached `Committed`.
    committed: AtomicU64,
    /// Transactions that reached `Aborted`.
    aborted: AtomicU64,
    /// Transactions resumed from the log after a restart.
    recovered: AtomicU64,
    /// Redelivery attempts after a failed first attempt.
    retries: AtomicU64,
    /// Times the retry budget ran out.
    timeouts: AtomicU64,
}

impl CoordinatorStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_start(&self) {
        self.started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self) {
        self.committed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_abort(&self) {
        self.aborted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_recovered(&self) {
        self.recovered.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of every counter.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            started: self.started.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}

/// A copy of [`CoordinatorStats`] at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Transactions begun.
    pub started: u64,
    /// Transactions committed.
    pub committed: u64,
    /// Transactions aborted.
    pub aborted: u64,
    /// Transactions resumed after a restart.
    pub recovered: u64,
    /// Redelivery attempts.
    pub retries: u64,
    /// Exhausted retry budgets.
    pub timeouts: u64,
}

impl StatsSnapshot {
    /// Returns transactions begun but not yet finished.
    pub fn in_flight(&self) -> u64 {
        self.started
            .saturating_add(self.recovered)
            .saturating_sub(self.committed + self.aborted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let stats = CoordinatorStats::new();
        stats.record_start();
        stats.record_start();
        stats.record_commit();
        stats.record_retry();

        let snap = stats.snapshot();
        assert_eq!(snap.started, 2);
        assert_eq!(snap.committed, 1);
        assert_eq!(snap.retries, 1);
        assert_eq!(snap.in_flight(), 1);
    }
}
