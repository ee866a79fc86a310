//! # Replica Slave
//!
//! Slave side of master/slave replication.
//!
//! This crate provides:
//! - Replication state (mode, sync source, last applied position),
//!   persisted in the `local` database
//! - The applier, which tails the master's log and applies it in order
//! - The resync controller, which detects unrecoverable gaps and drives a
//!   full copy from master snapshots
//! - Transport abstraction with retry and backoff
//! - Admin commands (`resync`, `serverStatus`, `listDatabases`, `top`)
//! - Per-namespace usage statistics
//!
//! ## Architecture
//!
//! A slave tails the master's bounded operation log from its last applied
//! position. When that position has been evicted, incremental tailing can
//! no longer resume: the slave drops its copy of each replicated database,
//! loads a point-in-time snapshot from the master, and resumes tailing from
//! the snapshot's as-of time.
//!
//! ## Key Invariants
//!
//! - Entries are applied to each database in strictly increasing op time order
//! - No entry is skipped unless local data already contains it
//! - The applier and a running resync never write local data at the same time
//! - Only one resync runs at a time; concurrent requests are rejected
//! - The persisted position never leads the persisted data

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod applier;
mod commands;
mod config;
mod context;
mod error;
mod resync;
mod retry;
mod rpc;
mod slave;
mod state;
mod stats;
mod transport;

pub use applier::{Applier, ApplierState, StepOutcome};
pub use commands::{AdminCommands, CommandReply};
pub use config::{RetryConfig, SlaveConfig, SyncSource};
pub use error::{RejectReason, ReplError, ReplResult};
pub use resync::{ResyncController, ResyncOutcome, ResyncReason, ResyncRequest, ResyncTrigger};
pub use rpc::RpcTransport;
pub use slave::SlaveNode;
pub use state::{
    load_persisted_states, GapInfo, ReplMode, ReplStateHandle, ReplicationState,
    SOURCES_COLLECTION,
};
pub use stats::{
    CollectionUsage, LockKind, OpCounters, OpCountersSnapshot, SnapshotRing, Top, UsageData,
    UsageDelta, UsageKind, UsageMap, UsageSnapshot,
};
pub use transport::{MasterTransport, MockTransport};
