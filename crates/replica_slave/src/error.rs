//! Error types for the slave.

use replica_protocol::{OpTime, ProtocolError};
use replica_storage::StorageError;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Result type for replication operations.
pub type ReplResult<T> = Result<T, ReplError>;

/// Why a resync request was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// The node does not replicate from a master.
    NotSlave,
    /// The slave is caught up with its master and has no gap.
    AlreadyInSync,
    /// A resync is already pending or running.
    InProgress,
}

impl RejectReason {
    /// Returns the reason as reported by admin commands.
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::NotSlave => "not-slave",
            RejectReason::AlreadyInSync => "already-in-sync",
            RejectReason::InProgress => "in-progress",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors that can occur during replication.
#[derive(Error, Debug)]
pub enum ReplError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// Not connected.
    #[error("not connected to sync source")]
    NotConnected,

    /// A message could not be encoded or decoded, or had the wrong type.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The local storage engine failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// The master answered a request with an error.
    #[error("master error: {0}")]
    Master(String),

    /// The master refused the handshake.
    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    /// The log evicted past a snapshot while it was being copied.
    #[error("stale snapshot: as of {as_of}, log now starts at {oldest_retained}")]
    StaleSnapshot {
        /// The snapshot's as-of time.
        as_of: OpTime,
        /// The log's oldest retained position at verification time.
        oldest_retained: OpTime,
    },

    /// A resync request was refused.
    #[error("resync rejected: {0}")]
    ResyncRejected(RejectReason),

    /// Replication cannot continue without operator intervention.
    #[error("fatal replication error: {0}")]
    Fatal(String),
}

impl ReplError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error is a transient I/O failure that can be
    /// retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplError::Transport { retryable, .. } => *retryable,
            ReplError::Timeout | ReplError::NotConnected => true,
            _ => false,
        }
    }

    /// Returns true if this error must move the slave to FAULT.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReplError::Fatal(_) => true,
            ReplError::Storage(e) => e.is_corruption(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_errors() {
        assert!(ReplError::transport_retryable("connection lost").is_retryable());
        assert!(!ReplError::transport_fatal("bad frame").is_retryable());
        assert!(ReplError::Timeout.is_retryable());
        assert!(ReplError::NotConnected.is_retryable());
        assert!(!ReplError::Master("unknown snapshot".into()).is_retryable());
        assert!(!ReplError::StaleSnapshot {
            as_of: OpTime::new(1, 1),
            oldest_retained: OpTime::new(2, 1),
        }
        .is_retryable());
    }

    #[test]
    fn fatal_errors() {
        assert!(ReplError::Fatal("retry budget exhausted".into()).is_fatal());
        assert!(ReplError::Storage(StorageError::Corrupted("x".into())).is_fatal());
        assert!(!ReplError::Storage(StorageError::InvalidName("x".into())).is_fatal());
        assert!(!ReplError::ResyncRejected(RejectReason::InProgress).is_fatal());
    }

    #[test]
    fn reject_reason_names() {
        assert_eq!(RejectReason::NotSlave.to_string(), "not-slave");
        assert_eq!(
            serde_json::to_value(RejectReason::AlreadyInSync).unwrap(),
            serde_json::json!("already-in-sync")
        );
    }

    #[test]
    fn error_display() {
        let err = ReplError::StaleSnapshot {
            as_of: OpTime::new(5, 1),
            oldest_retained: OpTime::new(9, 2),
        };
        let msg = err.to_string();
        assert!(msg.contains("5:1"));
        assert!(msg.contains("9:2"));
    }
}
