//! # Triphase Testkit
//!
//! Test utilities for triphase.
//!
//! This crate provides:
//! - [`CrashableStore`], a durable store that dies after a chosen number of
//!   appends
//! - [`FaultyTransport`], which drops, delays or duplicates protocol
//!   requests for chosen participants
//! - [`Cluster`], a coordinator plus in-process participants wired together
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust,ignore
//! use triphase_testkit::prelude::*;
//!
//! #[tokio::test]
//! async fn commits() {
//!     let cluster = Cluster::new(&["flights", "hotels"], 10);
//!     let outcome = cluster.submit_all().await.unwrap();
//!     assert!(outcome.is_committed());
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod faults;
pub mod fixtures;
pub mod generators;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::faults::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
}

pub use crash::*;
pub use faults::*;
pub use fixtures::*;
pub use generators::*;
