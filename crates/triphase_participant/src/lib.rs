//! # Triphase Participant
//!
//! The participant side of three-phase commit.
//!
//! A [`Participant`] wraps a [`ResourceManager`] and a durable log. It votes
//! on `Prepare`, promises on `PreCommit`, applies the final decision, and
//! aborts on its own when the coordinator goes silent before precommit.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use triphase_participant::{InventoryResource, Participant, ParticipantConfig};
//! use triphase_storage::MemoryStore;
//!
//! # async fn demo() -> Result<(), triphase_participant::ParticipantError> {
//! let flights = Arc::new(Participant::new(
//!     "flights",
//!     ParticipantConfig::default(),
//!     InventoryResource::new(120),
//!     Box::new(MemoryStore::new()),
//! ));
//! flights.recover().await?;
//! let _monitor = flights.spawn_timeout_monitor();
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

mod config;
mod error;
mod handler;
mod inventory;
mod participant;
mod resource;

pub use config::ParticipantConfig;
pub use error::{ParticipantError, ParticipantResult, ResourceError};
pub use handler::{path_for, ProtocolHandler, DECISION_PATH, PRECOMMIT_PATH, PREPARE_PATH};
pub use inventory::InventoryResource;
pub use participant::{GarbageReport, Participant, RecoveryReport, TimeoutAction};
pub use resource::{PrepareOutcome, ResourceManager, ResourceResult};
