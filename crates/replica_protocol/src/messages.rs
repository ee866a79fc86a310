//! Protocol messages exchanged between a slave and its master.

use crate::codec::{from_cbor, to_cbor};
use crate::cursor::{LogCursor, LogRead, TailInfo};
use crate::document::Document;
use crate::error::{ProtocolError, ProtocolResult};
use crate::optime::OpTime;
use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: u16 = 1;

/// A replication protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body")]
pub enum ReplMessage {
    /// Handshake request.
    HandshakeRequest(HandshakeRequest),
    /// Handshake response.
    HandshakeResponse(HandshakeResponse),
    /// Log read request.
    LogReadRequest(LogReadRequest),
    /// Log read response.
    LogReadResponse(LogRead),
    /// Tail info request.
    TailInfoRequest,
    /// Tail info response.
    TailInfoResponse(TailInfo),
    /// Snapshot batch request.
    SnapshotRequest(SnapshotRequest),
    /// Snapshot batch response.
    SnapshotBatch(SnapshotBatch),
    /// The request failed on the master.
    Error {
        /// Failure description.
        message: String,
    },
}

impl ReplMessage {
    /// Returns the message type code.
    pub fn type_code(&self) -> u8 {
        match self {
            ReplMessage::HandshakeRequest(_) => 1,
            ReplMessage::HandshakeResponse(_) => 2,
            ReplMessage::LogReadRequest(_) => 3,
            ReplMessage::LogReadResponse(_) => 4,
            ReplMessage::TailInfoRequest => 5,
            ReplMessage::TailInfoResponse(_) => 6,
            ReplMessage::SnapshotRequest(_) => 7,
            ReplMessage::SnapshotBatch(_) => 8,
            ReplMessage::Error { .. } => 255,
        }
    }

    /// Returns the message type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            ReplMessage::HandshakeRequest(_) => "HandshakeRequest",
            ReplMessage::HandshakeResponse(_) => "HandshakeResponse",
            ReplMessage::LogReadRequest(_) => "LogReadRequest",
            ReplMessage::LogReadResponse(_) => "LogReadResponse",
            ReplMessage::TailInfoRequest => "TailInfoRequest",
            ReplMessage::TailInfoResponse(_) => "TailInfoResponse",
            ReplMessage::SnapshotRequest(_) => "SnapshotRequest",
            ReplMessage::SnapshotBatch(_) => "SnapshotBatch",
            ReplMessage::Error { .. } => "Error",
        }
    }

    /// Encodes to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Builds the error for a response of the wrong kind.
    pub fn unexpected(&self, expected: &'static str) -> ProtocolError {
        ProtocolError::UnexpectedMessage {
            expected,
            actual: self.type_name(),
        }
    }
}

/// Handshake request from a slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Protocol version.
    pub protocol_version: u16,
    /// Human readable slave name, for master-side logs.
    pub slave_name: String,
}

impl HandshakeRequest {
    /// Creates a new handshake request.
    pub fn new(slave_name: impl Into<String>) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            slave_name: slave_name.into(),
        }
    }
}

/// Handshake response from the master.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeResponse {
    /// Whether the handshake succeeded.
    pub success: bool,
    /// Whether the peer keeps an operation log that can be tailed.
    pub is_master: bool,
    /// Master's current log retention window.
    pub tail: TailInfo,
    /// Databases present on the master.
    pub databases: Vec<String>,
    /// Error message if failed.
    pub error: Option<String>,
}

impl HandshakeResponse {
    /// Creates a successful handshake response.
    pub fn success(tail: TailInfo, databases: Vec<String>) -> Self {
        Self {
            success: true,
            is_master: true,
            tail,
            databases,
            error: None,
        }
    }

    /// Creates a failed handshake response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            is_master: false,
            tail: TailInfo::default(),
            databases: Vec::new(),
            error: Some(message.into()),
        }
    }
}

/// Request to read the log after a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LogReadRequest {
    /// Position to read after.
    pub cursor: LogCursor,
    /// Maximum number of entries to return.
    pub limit: u32,
}

impl LogReadRequest {
    /// Creates a new log read request.
    pub fn new(cursor: LogCursor, limit: u32) -> Self {
        Self { cursor, limit }
    }
}

/// Request for the next batch of a database snapshot.
///
/// The first request for a database carries no `snapshot_id`; the master
/// opens a point-in-time snapshot and returns its id with the first batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Database to snapshot.
    pub database: String,
    /// Snapshot being continued, `None` to open a new one.
    pub snapshot_id: Option<u64>,
    /// Maximum number of documents per batch.
    pub batch_size: u32,
}

impl SnapshotRequest {
    /// Creates a request opening a new snapshot.
    pub fn open(database: impl Into<String>, batch_size: u32) -> Self {
        Self {
            database: database.into(),
            snapshot_id: None,
            batch_size,
        }
    }

    /// Creates a request continuing an open snapshot.
    pub fn next(database: impl Into<String>, snapshot_id: u64, batch_size: u32) -> Self {
        Self {
            database: database.into(),
            snapshot_id: Some(snapshot_id),
            batch_size,
        }
    }
}

/// One document of a snapshot, tagged with its collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRow {
    /// Collection holding the document.
    pub collection: String,
    /// The document.
    pub document: Document,
}

/// Terminal marker of a snapshot stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEnd {
    /// Op time as of which the snapshot is consistent.
    pub as_of: OpTime,
    /// Total number of documents streamed.
    pub document_count: u64,
}

/// A batch of snapshot documents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotBatch {
    /// Snapshot this batch belongs to.
    pub snapshot_id: u64,
    /// Documents in this batch.
    pub documents: Vec<SnapshotRow>,
    /// Set on the last batch.
    pub end: Option<SnapshotEnd>,
}

impl SnapshotBatch {
    /// Returns true if this is the last batch of the snapshot.
    pub fn is_last(&self) -> bool {
        self.end.is_some()
    }
}
