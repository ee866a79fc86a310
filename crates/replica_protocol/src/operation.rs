//! Replicated write operations.

use crate::codec::{from_cbor, to_cbor};
use crate::document::{Document, DocumentId};
use crate::error::ProtocolResult;
use crate::optime::OpTime;
use serde::{Deserialize, Serialize};

/// Coarse classification of an operation, used for usage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    /// Document insert.
    Insert,
    /// Document replacement.
    Update,
    /// Document removal.
    Delete,
    /// Collection or database level command.
    Command,
}

/// The write an operation log entry describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpPayload {
    /// Insert a document.
    Insert {
        /// Target collection.
        collection: String,
        /// Inserted document.
        document: Document,
    },
    /// Replace a document wholesale, creating it if absent.
    Update {
        /// Target collection.
        collection: String,
        /// New document contents.
        document: Document,
    },
    /// Remove a document.
    Delete {
        /// Target collection.
        collection: String,
        /// Removed document.
        id: DocumentId,
    },
    /// Drop a whole collection.
    DropCollection {
        /// Dropped collection.
        collection: String,
    },
    /// Drop the whole database.
    DropDatabase,
}

impl OpPayload {
    /// Returns the operation kind.
    pub fn kind(&self) -> OpKind {
        match self {
            OpPayload::Insert { .. } => OpKind::Insert,
            OpPayload::Update { .. } => OpKind::Update,
            OpPayload::Delete { .. } => OpKind::Delete,
            OpPayload::DropCollection { .. } | OpPayload::DropDatabase => OpKind::Command,
        }
    }

    /// Returns the collection touched, if the operation targets one.
    pub fn collection(&self) -> Option<&str> {
        match self {
            OpPayload::Insert { collection, .. }
            | OpPayload::Update { collection, .. }
            | OpPayload::Delete { collection, .. }
            | OpPayload::DropCollection { collection } => Some(collection),
            OpPayload::DropDatabase => None,
        }
    }
}

/// An operation that has not been assigned an op time yet.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOperation {
    /// Database the operation applies to.
    pub database: String,
    /// The write itself.
    pub payload: OpPayload,
}

impl NewOperation {
    /// Creates a new operation.
    pub fn new(database: impl Into<String>, payload: OpPayload) -> Self {
        Self {
            database: database.into(),
            payload,
        }
    }

    /// Creates an insert operation.
    pub fn insert(database: impl Into<String>, collection: impl Into<String>, document: Document) -> Self {
        Self::new(
            database,
            OpPayload::Insert {
                collection: collection.into(),
                document,
            },
        )
    }

    /// Creates an update operation.
    pub fn update(database: impl Into<String>, collection: impl Into<String>, document: Document) -> Self {
        Self::new(
            database,
            OpPayload::Update {
                collection: collection.into(),
                document,
            },
        )
    }

    /// Creates a delete operation.
    pub fn delete(database: impl Into<String>, collection: impl Into<String>, id: DocumentId) -> Self {
        Self::new(
            database,
            OpPayload::Delete {
                collection: collection.into(),
                id,
            },
        )
    }

    /// Stamps the operation with its op time.
    pub fn at(self, op_time: OpTime) -> OperationEntry {
        OperationEntry {
            op_time,
            database: self.database,
            payload: self.payload,
        }
    }
}

/// An entry in the operation log.
///
/// Entries are immutable once appended. Ordering by `op_time` is total and
/// matches apply order on every slave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationEntry {
    /// Logical timestamp, unique and strictly increasing per master.
    pub op_time: OpTime,
    /// Database the operation applies to.
    pub database: String,
    /// The write itself.
    pub payload: OpPayload,
}

impl OperationEntry {
    /// Returns the `database.collection` namespace, or the database name
    /// for database-level commands.
    pub fn namespace(&self) -> String {
        match self.payload.collection() {
            Some(collection) => format!("{}.{}", self.database, collection),
            None => self.database.clone(),
        }
    }

    /// Encodes to CBOR bytes.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes from CBOR bytes.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }

    /// Returns the encoded size in bytes, used for log capacity accounting.
    pub fn encoded_len(&self) -> ProtocolResult<usize> {
        Ok(self.encode()?.len())
    }
}
