//! # Triphase Coordinator
//!
//! The coordinating side of three-phase commit.
//!
//! This crate provides:
//! - [`Coordinator`], which drives transactions through voting, pre-commit
//!   and decision delivery, write-ahead logging every phase change
//! - Restart recovery that finishes whatever the log shows as unfinished
//! - [`ParticipantTransport`] with an in-process [`LocalTransport`] and an
//!   [`HttpTransport`] over any [`HttpClient`]
//! - Retry with exponential backoff for pre-commit redelivery and decision
//!   delivery
//!
//! ## Key Invariants
//!
//! - A phase change is durable before any message that depends on it is sent
//! - Once any participant acknowledges pre-commit, the outcome is commit
//! - A transaction can be cancelled only before pre-commit
//! - Votes are never collected again after pre-commit starts
//!
//! ## Blocking
//!
//! A participant that has acknowledged pre-commit waits for the coordinator
//! however long it takes. If the coordinator is down for good, that
//! participant stays blocked; there is no peer-consultation termination
//! protocol.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use triphase_coordinator::{Coordinator, CoordinatorConfig, LocalTransport};
//! use triphase_participant::{InventoryResource, Participant, ParticipantConfig};
//! use triphase_storage::MemoryStore;
//!
//! # async fn demo() -> Result<(), triphase_coordinator::CoordinatorError> {
//! let transport = LocalTransport::new();
//! for name in ["flights", "hotels"] {
//!     transport.register(Arc::new(Participant::new(
//!         name,
//!         ParticipantConfig::default(),
//!         InventoryResource::new(10),
//!         Box::new(MemoryStore::new()),
//!     )));
//! }
//!
//! let coordinator = Coordinator::new(
//!     CoordinatorConfig::default(),
//!     transport,
//!     Box::new(MemoryStore::new()),
//! );
//! coordinator.recover_on_restart().await?;
//!
//! let outcome = coordinator
//!     .submit(vec!["flights".into(), "hotels".into()])
//!     .await?;
//! assert!(outcome.is_committed());
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod coordinator;
mod error;
mod http;
mod stats;
mod transport;

pub use config::{CoordinatorConfig, RetryConfig};
pub use coordinator::{
    Coordinator, PhaseOutcome, RecoveryReport, TransactionHandle, TransactionOutcome,
};
pub use error::{CoordinatorError, CoordinatorResult, TransportError, TransportResult};
pub use http::{HttpClient, HttpTransport, LoopbackClient, LoopbackServer};
pub use stats::{CoordinatorStats, StatsSnapshot};
pub use transport::{LocalTransport, ParticipantTransport};
