//! # Replica Protocol
//!
//! Wire types and CBOR codecs shared by the master and slave sides of
//! replica's master/slave replication.
//!
//! This crate provides:
//! - [`OpTime`] and [`OpTimeClock`] for totally ordering log entries
//! - [`LogCursor`], [`TailInfo`] and [`LogRead`] for tailing the operation log
//! - [`Document`] and [`OperationEntry`] describing replicated writes
//! - Protocol messages (handshake, log read, tail info, snapshot)
//! - CBOR encoding/decoding
//! - [`RpcClient`], the byte-level channel both sides plug into
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod codec;
mod cursor;
mod document;
mod error;
mod messages;
mod operation;
mod optime;
mod rpc;

pub use codec::{from_cbor, to_cbor};
pub use cursor::{LogCursor, LogRead, TailInfo};
pub use document::{Document, DocumentId};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    HandshakeRequest, HandshakeResponse, LogReadRequest, ReplMessage, SnapshotBatch, SnapshotEnd,
    SnapshotRequest, SnapshotRow, PROTOCOL_VERSION,
};
pub use operation::{NewOperation, OpKind, OpPayload, OperationEntry};
pub use optime::{OpTime, OpTimeClock};
pub use rpc::RpcClient;

/// Name of the per-node database that is never replicated.
pub const LOCAL_DATABASE: &str = "local";
