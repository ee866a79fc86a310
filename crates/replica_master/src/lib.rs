//! # Replica Master
//!
//! The master side of replication.
//!
//! This crate provides:
//! - The bounded [`OperationLog`] with eviction and gap reporting
//! - [`MasterNode`], which applies writes and logs them atomically
//! - Point-in-time snapshots for resyncing slaves ([`SnapshotProvider`])
//! - A message-level [`MasterServer`]
//!
//! # Retention
//!
//! The log holds at most `oplog_capacity_bytes` of encoded entries. Once
//! that is exceeded the oldest entries are evicted and the log's
//! `oldest_retained` watermark advances. A slave reading from a cursor
//! behind the watermark receives a gap and must perform a full resync:
//!
//! 1. Slave opens a snapshot of each database
//! 2. Master captures the image together with the latest op time
//! 3. Slave loads the image and tails the log from that op time

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod config;
mod error;
mod handler;
mod master;
mod oplog;
mod server;
mod snapshot;

pub use config::{MasterConfig, DEFAULT_OPLOG_CAPACITY};
pub use error::{MasterError, MasterResult};
pub use handler::RequestHandler;
pub use master::{MasterNode, OplogStats};
pub use oplog::OperationLog;
pub use server::MasterServer;
pub use snapshot::{SnapshotHandle, SnapshotProvider};
