//! Transport layer abstraction for talking to the master.

use crate::error::{ReplError, ReplResult};
use parking_lot::Mutex;
use replica_protocol::{
    HandshakeRequest, HandshakeResponse, LogRead, LogReadRequest, SnapshotBatch, SnapshotRequest,
    TailInfo,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

/// A transport handles communication with the master.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (any byte-level RPC via [`crate::RpcTransport`], mocks
/// for testing, etc.).
pub trait MasterTransport: Send + Sync {
    /// Performs a handshake with the master.
    fn handshake(&self, request: &HandshakeRequest) -> ReplResult<HandshakeResponse>;

    /// Reads the master's log after a cursor.
    fn read_log(&self, request: &LogReadRequest) -> ReplResult<LogRead>;

    /// Returns the master's log retention window.
    fn tail_info(&self) -> ReplResult<TailInfo>;

    /// Fetches one batch of a database snapshot.
    fn snapshot_batch(&self, request: &SnapshotRequest) -> ReplResult<SnapshotBatch>;

    /// Checks if the transport is connected.
    fn is_connected(&self) -> bool;
}

impl<T: MasterTransport + ?Sized> MasterTransport for Arc<T> {
    fn handshake(&self, request: &HandshakeRequest) -> ReplResult<HandshakeResponse> {
        (**self).handshake(request)
    }

    fn read_log(&self, request: &LogReadRequest) -> ReplResult<LogRead> {
        (**self).read_log(request)
    }

    fn tail_info(&self) -> ReplResult<TailInfo> {
        (**self).tail_info()
    }

    fn snapshot_batch(&self, request: &SnapshotRequest) -> ReplResult<SnapshotBatch> {
        (**self).snapshot_batch(request)
    }

    fn is_connected(&self) -> bool {
        (**self).is_connected()
    }
}

/// A scripted transport for testing.
///
/// Log reads and snapshot batches are served from queues; an empty log
/// queue answers with no entries at the requested cursor.
#[derive(Debug, Default)]
pub struct MockTransport {
    connected: AtomicBool,
    failures: AtomicU32,
    rejections: AtomicU32,
    handshake_response: Mutex<Option<HandshakeResponse>>,
    tail: Mutex<TailInfo>,
    log_reads: Mutex<VecDeque<LogRead>>,
    snapshots: Mutex<HashMap<String, VecDeque<SnapshotBatch>>>,
    calls: Mutex<Vec<&'static str>>,
}

impl MockTransport {
    /// Creates a new mock transport.
    pub fn new() -> Self {
        Self {
            connected: AtomicBool::new(true),
            ..Self::default()
        }
    }

    /// Sets the handshake response.
    pub fn set_handshake_response(&self, response: HandshakeResponse) {
        *self.handshake_response.lock() = Some(response);
    }

    /// Sets the tail info response.
    pub fn set_tail(&self, tail: TailInfo) {
        *self.tail.lock() = tail;
    }

    /// Queues a log read response.
    pub fn push_log_read(&self, read: LogRead) {
        self.log_reads.lock().push_back(read);
    }

    /// Queues a snapshot batch for a database.
    pub fn push_snapshot_batch(&self, database: &str, batch: SnapshotBatch) {
        self.snapshots
            .lock()
            .entry(database.to_string())
            .or_default()
            .push_back(batch);
    }

    /// Makes the next `count` calls fail with a retryable transport error.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` calls fail with a non-retryable master error.
    pub fn reject_next(&self, count: u32) {
        self.rejections.store(count, Ordering::SeqCst);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Returns the names of the calls made so far.
    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    fn enter(&self, call: &'static str) -> ReplResult<()> {
        self.calls.lock().push(call);
        if !self.is_connected() {
            return Err(ReplError::NotConnected);
        }
        let failed = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(ReplError::transport_retryable(format!("injected {call} failure")));
        }
        let rejected = self
            .rejections
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if rejected {
            return Err(ReplError::Master(format!("injected {call} rejection")));
        }
        Ok(())
    }
}

impl MasterTransport for MockTransport {
    fn handshake(&self, _request: &HandshakeRequest) -> ReplResult<HandshakeResponse> {
        self.enter("handshake")?;
        self.handshake_response
            .lock()
            .clone()
            .ok_or_else(|| ReplError::Master("no mock handshake response set".into()))
    }

    fn read_log(&self, request: &LogReadRequest) -> ReplResult<LogRead> {
        self.enter("read_log")?;
        Ok(self
            .log_reads
            .lock()
            .pop_front()
            .unwrap_or(LogRead::Entries {
                entries: Vec::new(),
                new_cursor: request.cursor,
                has_more: false,
            }))
    }

    fn tail_info(&self) -> ReplResult<TailInfo> {
        self.enter("tail_info")?;
        Ok(*self.tail.lock())
    }

    fn snapshot_batch(&self, request: &SnapshotRequest) -> ReplResult<SnapshotBatch> {
        self.enter("snapshot_batch")?;
        self.snapshots
            .lock()
            .get_mut(&request.database)
            .and_then(|queue| queue.pop_front())
            .ok_or_else(|| {
                ReplError::Master(format!("no mock snapshot for {}", request.database))
            })
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_protocol::{LogCursor, OpTime};

    #[test]
    fn mock_transport_connection() {
        let transport = MockTransport::new();
        assert!(transport.is_connected());

        transport.set_connected(false);
        assert!(!transport.is_connected());
        assert!(matches!(
            transport.tail_info(),
            Err(ReplError::NotConnected)
        ));
    }

    #[test]
    fn mock_transport_injected_failures() {
        let transport = MockTransport::new();
        transport.fail_next(2);
        assert!(transport.tail_info().unwrap_err().is_retryable());
        assert!(transport.tail_info().is_err());
        assert!(transport.tail_info().is_ok());
        assert_eq!(transport.calls().len(), 3);
    }

    #[test]
    fn mock_transport_empty_log_read() {
        let transport = MockTransport::new();
        let cursor = LogCursor::at(OpTime::new(3, 1));
        let read = transport
            .read_log(&LogReadRequest::new(cursor, 10))
            .unwrap();
        assert_eq!(
            read,
            LogRead::Entries {
                entries: Vec::new(),
                new_cursor: cursor,
                has_more: false,
            }
        );
    }

    #[test]
    fn mock_transport_handshake() {
        let transport = MockTransport::new();
        assert!(transport.handshake(&HandshakeRequest::new("s")).is_err());

        transport.set_handshake_response(HandshakeResponse::success(
            TailInfo::default(),
            vec!["db".into()],
        ));
        let response = transport.handshake(&HandshakeRequest::new("s")).unwrap();
        assert!(response.success);
    }
}
