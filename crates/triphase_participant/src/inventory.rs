//! Counter-backed resource with per-transaction holds.

use crate::error::ResourceError;
use crate::resource::{PrepareOutcome, ResourceManager, ResourceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use triphase_core::{ParticipantPhase, ReservationHandle};
use triphase_protocol::TransactionId;

#[derive(Debug, Default)]
struct Ledger {
    available: u64,
    sold: u64,
    default_demand: u64,
    demand: HashMap<TransactionId, u64>,
    holds: HashMap<TransactionId, u64>,
    committed: HashMap<TransactionId, u64>,
    commits_applied: u64,
    fail_commits: bool,
}

/// A pool of identical units (seats on a flight, rooms in a hotel) that
/// supports several concurrent tentative holds.
///
/// Every transaction asks for one unit unless [`InventoryResource::set_demand`]
/// says otherwise. Clones share the same ledger.
///
/// # Example
///
/// ```rust
/// use triphase_participant::InventoryResource;
///
/// let seats = InventoryResource::new(120);
/// assert_eq!(seats.available(), 120);
/// ```
#[derive(Debug, Clone)]
pub struct InventoryResource {
    ledger: Arc<Mutex<Ledger>>,
}

impl InventoryResource {
    /// Creates a pool with `units` available.
    #[must_use]
    pub fn new(units: u64) -> Self {
        Self {
            ledger: Arc::new(Mutex::new(Ledger {
                available: units,
                default_demand: 1,
                ..Ledger::default()
            })),
        }
    }

    /// Sets how many units `tx` will ask for.
    pub fn set_demand(&self, tx: TransactionId, units: u64) {
        self.ledger.lock().demand.insert(tx, units);
    }

    /// Makes every later `commit` fail.
    ///
    /// Test hook for the "resource refuses to commit after voting yes"
    /// contract violation.
    pub fn fail_commits(&self, fail: bool) {
        self.ledger.lock().fail_commits = fail;
    }

    /// Returns units neither held nor sold.
    #[must_use]
    pub fn available(&self) -> u64 {
        self.ledger.lock().available
    }

    /// Returns units currently held by undecided transactions.
    #[must_use]
    pub fn held(&self) -> u64 {
        self.ledger.lock().holds.values().sum()
    }

    /// Returns units sold by committed transactions.
    #[must_use]
    pub fn sold(&self) -> u64 {
        self.ledger.lock().sold
    }

    /// Returns how many times a commit actually moved units.
    #[must_use]
    pub fn commits_applied(&self) -> u64 {
        self.ledger.lock().commits_applied
    }

    /// Returns true if `tx` holds units.
    #[must_use]
    pub fn is_held(&self, tx: TransactionId) -> bool {
        self.ledger.lock().holds.contains_key(&tx)
    }

    fn units_in(handle: &ReservationHandle) -> ResourceResult<u64> {
        let bytes: [u8; 8] = handle
            .as_bytes()
            .try_into()
            .map_err(|_| ResourceError::new("malformed inventory handle"))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

#[async_trait]
impl ResourceManager for InventoryResource {
    async fn prepare(&self, tx: TransactionId) -> ResourceResult<PrepareOutcome> {
        let mut ledger = self.ledger.lock();

        if let Some(&units) = ledger.holds.get(&tx) {
            return Ok(PrepareOutcome::Reserved(ReservationHandle::new(
                units.to_le_bytes().to_vec(),
            )));
        }

        let units = ledger
            .demand
            .get(&tx)
            .copied()
            .unwrap_or(ledger.default_demand);

        if units > ledger.available {
            return Ok(PrepareOutcome::Refused {
                reason: format!("{units} requested, {} available", ledger.available),
            });
        }

        ledger.available -= units;
        ledger.holds.insert(tx, units);
        Ok(PrepareOutcome::Reserved(ReservationHandle::new(
            units.to_le_bytes().to_vec(),
        )))
    }

    async fn precommit(&self, tx: TransactionId, _handle: &ReservationHandle) -> ResourceResult<()> {
        let ledger = self.ledger.lock();
        if ledger.holds.contains_key(&tx) || ledger.committed.contains_key(&tx) {
            Ok(())
        } else {
            Err(ResourceError::new(format!("no hold for {tx}")))
        }
    }

    async fn commit(&self, tx: TransactionId, handle: &ReservationHandle) -> ResourceResult<()> {
        let mut ledger = self.ledger.lock();

        if ledger.committed.contains_key(&tx) {
            return Ok(());
        }
        if ledger.fail_commits {
            return Err(ResourceError::new("commit refused"));
        }

        let units = match ledger.holds.remove(&tx) {
            Some(units) => units,
            None => Self::units_in(handle)?,
        };
        ledger.sold += units;
        ledger.committed.insert(tx, units);
        ledger.commits_applied += 1;
        Ok(())
    }

    async fn abort(&self, tx: TransactionId, _handle: Option<&ReservationHandle>) -> ResourceResult<()> {
        let mut ledger = self.ledger.lock();
        if let Some(units) = ledger.holds.remove(&tx) {
            ledger.available += units;
        }
        ledger.demand.remove(&tx);
        Ok(())
    }

    async fn restore(
        &self,
        tx: TransactionId,
        handle: &ReservationHandle,
        _phase: ParticipantPhase,
    ) -> ResourceResult<()> {
        let units = Self::units_in(handle)?;
        let mut ledger = self.ledger.lock();
        if ledger.holds.contains_key(&tx) || ledger.committed.contains_key(&tx) {
            return Ok(());
        }
        if units > ledger.available {
            return Err(ResourceError::new(format!(
                "cannot restore {units} units for {tx}, {} available",
                ledger.available
            )));
        }
        ledger.available -= units;
        ledger.holds.insert(tx, units);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(n: u128) -> TransactionId {
        TransactionId::from_u128(n)
    }

    fn reserved(outcome: PrepareOutcome) -> ReservationHandle {
        match outcome {
            PrepareOutcome::Reserved(handle) => handle,
            PrepareOutcome::Refused { reason } => panic!("refused: {reason}"),
        }
    }

    #[tokio::test]
    async fn concurrent_holds_share_the_pool() {
        let seats = InventoryResource::new(3);
        reserved(seats.prepare(tx(1)).await.unwrap());
        reserved(seats.prepare(tx(2)).await.unwrap());

        assert_eq!(seats.available(), 1);
        assert_eq!(seats.held(), 2);
    }

    #[tokio::test]
    async fn refuses_when_exhausted() {
        let seats = InventoryResource::new(2);
        seats.set_demand(tx(1), 3);

        let outcome = seats.prepare(tx(1)).await.unwrap();
        assert!(matches!(outcome, PrepareOutcome::Refused { .. }));
        assert_eq!(seats.available(), 2);
    }

    #[tokio::test]
    async fn prepare_is_idempotent() {
        let seats = InventoryResource::new(5);
        let first = reserved(seats.prepare(tx(1)).await.unwrap());
        let second = reserved(seats.prepare(tx(1)).await.unwrap());
        assert_eq!(first, second);
        assert_eq!(seats.available(), 4);
    }

    #[tokio::test]
    async fn commit_applies_once() {
        let seats = InventoryResource::new(5);
        seats.set_demand(tx(1), 2);
        let handle = reserved(seats.prepare(tx(1)).await.unwrap());

        seats.commit(tx(1), &handle).await.unwrap();
        seats.commit(tx(1), &handle).await.unwrap();

        assert_eq!(seats.sold(), 2);
        assert_eq!(seats.commits_applied(), 1);
        assert_eq!(seats.available(), 3);
    }

    #[tokio::test]
    async fn abort_releases_hold() {
        let seats = InventoryResource::new(1);
        let handle = reserved(seats.prepare(tx(1)).await.unwrap());

        seats.abort(tx(1), Some(&handle)).await.unwrap();
        seats.abort(tx(1), Some(&handle)).await.unwrap();

        assert_eq!(seats.available(), 1);
        assert!(!seats.is_held(tx(1)));
    }

    #[tokio::test]
    async fn restore_reacquires_hold() {
        let seats = InventoryResource::new(10);
        let handle = ReservationHandle::new(4u64.to_le_bytes().to_vec());

        seats
            .restore(tx(1), &handle, ParticipantPhase::Precommitted)
            .await
            .unwrap();

        assert_eq!(seats.available(), 6);
        assert!(seats.is_held(tx(1)));
    }

    #[tokio::test]
    async fn failing_commit() {
        let seats = InventoryResource::new(1);
        let handle = reserved(seats.prepare(tx(1)).await.unwrap());
        seats.fail_commits(true);

        assert!(seats.commit(tx(1), &handle).await.is_err());
        assert!(seats.is_held(tx(1)));
    }
}
