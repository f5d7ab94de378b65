//! # Triphase Storage
//!
//! Durable byte stores for the triphase coordinator and participant logs.
//!
//! Stores are **opaque append-only byte sequences**. They know nothing about
//! log records, transactions or phases; `triphase_core` owns the framing.
//!
//! ## Durability Contract
//!
//! - `append` makes bytes readable immediately
//! - bytes become crash-safe only after `sync` returns
//! - a crash may drop any suffix written after the last `sync`
//!
//! The in-memory store models that contract explicitly so recovery paths can
//! be tested without touching the file system.
//!
//! ## Available Stores
//!
//! - [`MemoryStore`] - shared in-memory image with crash simulation
//! - [`FileStore`] - persistent store on top of OS file APIs
//!
//! ## Example
//!
//! ```rust
//! use triphase_storage::{DurableStore, MemoryStore};
//!
//! let mut store = MemoryStore::new();
//! let offset = store.append(b"precommitted").unwrap();
//! store.sync().unwrap();
//! assert_eq!(store.read_at(offset, 12).unwrap(), b"precommitted");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod file;
mod memory;
mod store;

pub use error::{StorageError, StorageResult};
pub use file::FileStore;
pub use memory::MemoryStore;
pub use store::DurableStore;
