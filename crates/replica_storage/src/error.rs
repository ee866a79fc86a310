//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A database file could not be encoded or decoded.
    #[error("codec error: {0}")]
    Codec(#[from] replica_protocol::ProtocolError),

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// Another process holds the storage directory.
    #[error("storage locked: another process has exclusive access to {0}")]
    Locked(String),

    /// The database name cannot be used as a storage unit.
    #[error("invalid database name: {0:?}")]
    InvalidName(String),

    /// The database does not exist.
    #[error("unknown database: {0}")]
    UnknownDatabase(String),
}

impl StorageError {
    /// Returns true if the error indicates unrecoverable on-disk damage.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::Corrupted(_) | StorageError::Codec(_))
    }
}
