//! Message transport over a byte-level RPC client.
//!
//! The actual channel is abstracted by [`RpcClient`], so the same
//! transport runs over TCP, HTTP, or an in-process loopback to a
//! `MasterServer`.

use crate::config::SyncSource;
use crate::error::{ReplError, ReplResult};
use crate::transport::MasterTransport;
use parking_lot::RwLock;
use replica_protocol::{
    HandshakeRequest, HandshakeResponse, LogRead, LogReadRequest, ReplMessage, RpcClient,
    SnapshotBatch, SnapshotRequest, TailInfo,
};
use std::sync::atomic::{AtomicBool, Ordering};

/// CBOR-framed [`MasterTransport`] over an [`RpcClient`].
pub struct RpcTransport<C: RpcClient> {
    source: SyncSource,
    client: C,
    /// Whether the last round-trip reached the master.
    reachable: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: RpcClient> RpcTransport<C> {
    /// Creates a new transport to `source`.
    pub fn new(source: SyncSource, client: C) -> Self {
        Self {
            source,
            client,
            reachable: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Returns the sync source.
    pub fn source(&self) -> &SyncSource {
        &self.source
    }

    /// Returns the client.
    pub fn client(&self) -> &C {
        &self.client
    }

    /// Returns the last error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    fn round_trip(&self, request: ReplMessage) -> ReplResult<ReplMessage> {
        let body = request.encode()?;

        let response = self.client.call(body).map_err(|e| {
            *self.last_error.write() = Some(e.clone());
            self.reachable.store(false, Ordering::SeqCst);
            ReplError::transport_retryable(e)
        })?;

        self.reachable.store(true, Ordering::SeqCst);
        *self.last_error.write() = None;

        match ReplMessage::decode(&response)? {
            ReplMessage::Error { message } => Err(ReplError::Master(message)),
            message => Ok(message),
        }
    }
}

impl<C: RpcClient> MasterTransport for RpcTransport<C> {
    fn handshake(&self, request: &HandshakeRequest) -> ReplResult<HandshakeResponse> {
        match self.round_trip(ReplMessage::HandshakeRequest(request.clone()))? {
            ReplMessage::HandshakeResponse(response) => Ok(response),
            other => Err(other.unexpected("HandshakeResponse").into()),
        }
    }

    fn read_log(&self, request: &LogReadRequest) -> ReplResult<LogRead> {
        match self.round_trip(ReplMessage::LogReadRequest(*request))? {
            ReplMessage::LogReadResponse(read) => Ok(read),
            other => Err(other.unexpected("LogReadResponse").into()),
        }
    }

    fn tail_info(&self) -> ReplResult<TailInfo> {
        match self.round_trip(ReplMessage::TailInfoRequest)? {
            ReplMessage::TailInfoResponse(tail) => Ok(tail),
            other => Err(other.unexpected("TailInfoResponse").into()),
        }
    }

    fn snapshot_batch(&self, request: &SnapshotRequest) -> ReplResult<SnapshotBatch> {
        match self.round_trip(ReplMessage::SnapshotRequest(request.clone()))? {
            ReplMessage::SnapshotBatch(batch) => Ok(batch),
            other => Err(other.unexpected("SnapshotBatch").into()),
        }
    }

    fn is_connected(&self) -> bool {
        self.reachable.load(Ordering::SeqCst) && self.client.is_healthy()
    }
}
