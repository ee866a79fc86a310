//! Error types for protocol encoding.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol values.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// CBOR serialization failed.
    #[error("encode error: {0}")]
    Encode(String),

    /// CBOR deserialization failed.
    #[error("decode error: {0}")]
    Decode(String),

    /// Message decoded but does not have the expected shape.
    #[error("unexpected message: expected {expected}, got {actual}")]
    UnexpectedMessage {
        /// Message kind the caller expected.
        expected: &'static str,
        /// Message kind actually received.
        actual: &'static str,
    },

    /// A document body was not a JSON object.
    #[error("invalid document: {0}")]
    InvalidDocument(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ProtocolError::UnexpectedMessage {
            expected: "LogReadResponse",
            actual: "Error",
        };
        let msg = err.to_string();
        assert!(msg.contains("LogReadResponse"));
        assert!(msg.contains("Error"));
    }
}
