//! The resource manager a participant wraps.

use crate::error::ResourceError;
use async_trait::async_trait;
use std::sync::Arc;
use triphase_core::{ParticipantPhase, ReservationHandle};
use triphase_protocol::TransactionId;

/// Result type for resource manager calls.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Result of asking a resource manager to reserve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepareOutcome {
    /// Resources are held; the handle identifies the hold.
    Reserved(ReservationHandle),
    /// The resource manager cannot commit this transaction.
    Refused {
        /// Why, for logs.
        reason: String,
    },
}

/// Local resource the participant makes atomic with the rest of the
/// transaction.
///
/// # Contract
///
/// - `prepare` must be reversible: a later `abort` releases whatever it held
/// - `precommit` returns only once the resource can survive a crash in the
///   precommitted state
/// - `commit` and `abort` are idempotent
/// - `restore` re-acquires a hold after a participant restart
///
/// A `commit` failure after `prepare` returned `Reserved` breaks the contract;
/// the participant reports it as a fatal inconsistency.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Tentatively reserves resources for `tx`.
    async fn prepare(&self, tx: TransactionId) -> ResourceResult<PrepareOutcome>;

    /// Makes the reservation durable ahead of commit.
    async fn precommit(&self, tx: TransactionId, handle: &ReservationHandle) -> ResourceResult<()>;

    /// Finalizes the reservation.
    async fn commit(&self, tx: TransactionId, handle: &ReservationHandle) -> ResourceResult<()>;

    /// Releases the reservation, if there is one.
    async fn abort(&self, tx: TransactionId, handle: Option<&ReservationHandle>) -> ResourceResult<()>;

    /// Re-acquires a hold found in the participant log after a restart.
    async fn restore(
        &self,
        _tx: TransactionId,
        _handle: &ReservationHandle,
        _phase: ParticipantPhase,
    ) -> ResourceResult<()> {
        Ok(())
    }
}

#[async_trait]
impl<R: ResourceManager + ?Sized> ResourceManager for Arc<R> {
    async fn prepare(&self, tx: TransactionId) -> ResourceResult<PrepareOutcome> {
        (**self).prepare(tx).await
    }

    async fn precommit(&self, tx: TransactionId, handle: &ReservationHandle) -> ResourceResult<()> {
        (**self).precommit(tx, handle).await
    }

    async fn commit(&self, tx: TransactionId, handle: &ReservationHandle) -> ResourceResult<()> {
        (**self).commit(tx, handle).await
    }

    async fn abort(&self, tx: TransactionId, handle: Option<&ReservationHandle>) -> ResourceResult<()> {
        (**self).abort(tx, handle).await
    }

    async fn restore(
        &self,
        tx: TransactionId,
        handle: &ReservationHandle,
        phase: ParticipantPhase,
    ) -> ResourceResult<()> {
        (**self).restore(tx, handle, phase).await
    }
}
