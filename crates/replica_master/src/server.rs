//! Message-level master server.

use crate::config::MasterConfig;
use crate::error::MasterResult;
use crate::handler::RequestHandler;
use crate::master::MasterNode;
use replica_protocol::{ReplMessage, RpcClient};
use replica_storage::StorageEngine;
use std::sync::Arc;

/// The replication server of a master.
///
/// Dispatches [`ReplMessage`] requests to the [`RequestHandler`]. Any byte
/// transport (a socket, an HTTP body, an in-process loopback) can call
/// [`MasterServer::handle_bytes`] with a CBOR frame.
///
/// # Example
///
/// ```
/// use replica_master::{MasterConfig, MasterServer};
/// use replica_protocol::{HandshakeRequest, ReplMessage};
/// use replica_storage::MemoryStorage;
/// use std::sync::Arc;
///
/// let server = MasterServer::new(Arc::new(MemoryStorage::new()), MasterConfig::default());
/// let reply = server.handle_message(ReplMessage::HandshakeRequest(HandshakeRequest::new("s")));
/// assert!(matches!(reply, ReplMessage::HandshakeResponse(_)));
/// ```
pub struct MasterServer {
    handler: RequestHandler,
    node: Arc<MasterNode>,
}

impl MasterServer {
    /// Creates a server with a new master over `storage`.
    pub fn new(storage: Arc<dyn StorageEngine>, config: MasterConfig) -> Self {
        Self::with_node(Arc::new(MasterNode::new(storage, config)))
    }

    /// Creates a server for an existing master.
    pub fn with_node(node: Arc<MasterNode>) -> Self {
        let handler = RequestHandler::new(Arc::clone(&node));
        Self { handler, node }
    }

    /// Returns the master node.
    pub fn node(&self) -> &Arc<MasterNode> {
        &self.node
    }

    /// Handles a request message.
    ///
    /// Failures are reported as [`ReplMessage::Error`].
    pub fn handle_message(&self, message: ReplMessage) -> ReplMessage {
        let result = match message {
            ReplMessage::HandshakeRequest(req) => self
                .handler
                .handle_handshake(req)
                .map(ReplMessage::HandshakeResponse),
            ReplMessage::LogReadRequest(req) => {
                Ok(ReplMessage::LogReadResponse(self.handler.handle_log_read(req)))
            }
            ReplMessage::TailInfoRequest => {
                Ok(ReplMessage::TailInfoResponse(self.handler.handle_tail_info()))
            }
            ReplMessage::SnapshotRequest(req) => self
                .handler
                .handle_snapshot(req)
                .map(ReplMessage::SnapshotBatch),
            other => {
                return ReplMessage::Error {
                    message: format!("unexpected message type: {}", other.type_name()),
                }
            }
        };

        result.unwrap_or_else(|e| {
            tracing::warn!(error = %e, "request failed");
            ReplMessage::Error {
                message: e.to_string(),
            }
        })
    }

    /// Handles a CBOR-encoded request and returns the encoded response.
    ///
    /// Undecodable requests get an encoded [`ReplMessage::Error`]; only a
    /// failure to encode the response itself is returned as an error.
    pub fn handle_bytes(&self, request: &[u8]) -> MasterResult<Vec<u8>> {
        let response = match ReplMessage::decode(request) {
            Ok(message) => self.handle_message(message),
            Err(e) => ReplMessage::Error {
                message: format!("invalid request: {e}"),
            },
        };
        Ok(response.encode()?)
    }
}

/// In-process loopback: a slave can talk to a master in the same process
/// through `RpcTransport<Arc<MasterServer>>`.
impl RpcClient for MasterServer {
    fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, String> {
        self.handle_bytes(&request).map_err(|e| e.to_string())
    }

    fn is_healthy(&self) -> bool {
        true
    }
}
