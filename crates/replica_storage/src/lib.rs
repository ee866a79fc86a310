//! # Replica Storage
//!
//! The storage engine as seen by replication.
//!
//! Replication never interprets storage files. It consumes the engine only
//! through [`StorageEngine`]: apply an operation, drop a database, take a
//! point-in-time image of a database, load snapshot documents, and keep a
//! small amount of per-node state in the never-replicated `local` database.
//!
//! ## Available Engines
//!
//! - [`MemoryStorage`] - For testing and ephemeral nodes
//! - [`FileStorage`] - One directory per database, persisted on `flush`
//!
//! ## Example
//!
//! ```rust
//! use replica_protocol::{Document, NewOperation, OpTime};
//! use replica_storage::{MemoryStorage, StorageEngine};
//!
//! let storage = MemoryStorage::new();
//! let entry = NewOperation::insert("app", "users", Document::with_id("u1")).at(OpTime::new(1, 1));
//! storage.apply(&entry).unwrap();
//! assert_eq!(storage.count("app", "users").unwrap(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod data;
mod engine;
mod error;
mod file;
mod memory;

pub use data::{CollectionData, DatabaseData};
pub use engine::{DatabaseImage, StorageEngine};
pub use error::{StorageError, StorageResult};
pub use file::{FileStorage, RepairReport};
pub use memory::MemoryStorage;
