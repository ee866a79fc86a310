//! Request handlers for replication endpoints.

use crate::error::MasterResult;
use crate::master::MasterNode;
use crate::snapshot::SnapshotProvider;
use replica_protocol::{
    HandshakeRequest, HandshakeResponse, LogRead, LogReadRequest, SnapshotBatch,
    SnapshotRequest, TailInfo, PROTOCOL_VERSION,
};
use std::sync::Arc;

/// Handler for replication requests.
pub struct RequestHandler {
    node: Arc<MasterNode>,
}

impl RequestHandler {
    /// Creates a new request handler.
    pub fn new(node: Arc<MasterNode>) -> Self {
        Self { node }
    }

    /// Returns the master served by this handler.
    pub fn node(&self) -> &Arc<MasterNode> {
        &self.node
    }

    /// Handles a handshake request.
    pub fn handle_handshake(&self, request: HandshakeRequest) -> MasterResult<HandshakeResponse> {
        if request.protocol_version != PROTOCOL_VERSION {
            return Ok(HandshakeResponse::error(format!(
                "Unsupported protocol version: {}",
                request.protocol_version
            )));
        }

        let tail = self.node.tail_info();
        let databases = self.node.database_names()?;
        tracing::info!(
            slave = %request.slave_name,
            latest = %tail.latest,
            oldest_retained = %tail.oldest_retained,
            "slave handshake"
        );
        Ok(HandshakeResponse::success(tail, databases))
    }

    /// Handles a log read request.
    ///
    /// The requested limit is capped by the configured maximum batch; a
    /// zero limit asks for the maximum.
    pub fn handle_log_read(&self, request: LogReadRequest) -> LogRead {
        let max = self.node.config().max_read_batch;
        let limit = if request.limit == 0 {
            max
        } else {
            request.limit.min(max)
        };
        let read = self.node.read_from(request.cursor, limit as usize);
        if let LogRead::Gap {
            requested,
            oldest_retained,
        } = &read
        {
            tracing::debug!(
                requested = %requested.op_time,
                oldest_retained = %oldest_retained,
                "log read behind retention window"
            );
        }
        read
    }

    /// Handles a tail info request.
    pub fn handle_tail_info(&self) -> TailInfo {
        self.node.tail_info()
    }

    /// Handles a snapshot request, opening the snapshot on the first call.
    pub fn handle_snapshot(&self, request: SnapshotRequest) -> MasterResult<SnapshotBatch> {
        let max = self.node.config().snapshot_batch_size;
        let batch_size = if request.batch_size == 0 {
            max
        } else {
            request.batch_size.min(max)
        } as usize;

        let id = match request.snapshot_id {
            Some(id) => id,
            None => self.node.open_snapshot(&request.database)?.id,
        };
        self.node.next_batch(id, batch_size)
    }
}
