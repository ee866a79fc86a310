//! Error types for the master.

use replica_protocol::ProtocolError;
use replica_storage::StorageError;
use thiserror::Error;

/// Result type for master operations.
pub type MasterResult<T> = Result<T, MasterError>;

/// Errors that can occur on the master.
#[derive(Error, Debug)]
pub enum MasterError {
    /// Invalid request format.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Protocol version mismatch.
    #[error("protocol version mismatch: {0}")]
    ProtocolMismatch(String),

    /// The snapshot id is not open.
    #[error("unknown snapshot: {0}")]
    UnknownSnapshot(u64),

    /// Snapshots are disabled by a zero session limit.
    #[error("too many open snapshots (limit {0})")]
    TooManySnapshots(usize),

    /// Encoding or decoding failed.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// The storage engine failed.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

impl MasterError {
    /// Returns true if the request itself was at fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            MasterError::InvalidRequest(_)
                | MasterError::ProtocolMismatch(_)
                | MasterError::UnknownSnapshot(_)
        )
    }

    /// Returns true if the master failed to serve a valid request.
    pub fn is_server_error(&self) -> bool {
        !self.is_client_error()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_classification() {
        assert!(MasterError::UnknownSnapshot(3).is_client_error());
        assert!(MasterError::TooManySnapshots(8).is_server_error());
        assert!(!MasterError::InvalidRequest("bad".into()).is_server_error());
    }

    #[test]
    fn error_display() {
        let msg = MasterError::TooManySnapshots(16).to_string();
        assert!(msg.contains("16"));
    }
}
