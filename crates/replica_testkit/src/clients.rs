//! In-process RPC clients with fault injection.

use parking_lot::Mutex;
use replica_master::MasterServer;
use replica_protocol::{ReplMessage, RpcClient};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

type Hook = Box<dyn FnMut(&MasterServer, &ReplMessage) + Send>;

/// Loopback client calling a [`MasterServer`] in the same process.
///
/// Can fail the next N calls, report itself down, and run a hook after
/// each request has been served (for example to write to the master in
/// the middle of a snapshot copy).
pub struct LoopbackClient {
    server: Arc<MasterServer>,
    failures: AtomicU32,
    down: AtomicBool,
    calls: AtomicU64,
    hook: Mutex<Option<Hook>>,
}

impl LoopbackClient {
    /// Creates a client for `server`.
    pub fn new(server: Arc<MasterServer>) -> Self {
        Self {
            server,
            failures: AtomicU32::new(0),
            down: AtomicBool::new(false),
            calls: AtomicU64::new(0),
            hook: Mutex::new(None),
        }
    }

    /// Returns the server.
    pub fn server(&self) -> &Arc<MasterServer> {
        &self.server
    }

    /// Fails the next `count` calls as if the network dropped them.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Fails every call until set back to `false`.
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Number of calls made, failed ones included.
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Installs a hook run after each successfully served request.
    pub fn on_request<F>(&self, hook: F)
    where
        F: FnMut(&MasterServer, &ReplMessage) + Send + 'static,
    {
        *self.hook.lock() = Some(Box::new(hook));
    }

    /// Removes the hook.
    pub fn clear_hook(&self) {
        *self.hook.lock() = None;
    }
}

impl RpcClient for LoopbackClient {
    fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err("connection refused".into());
        }
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err("injected network failure".into());
        }

        let response = self.server.handle_bytes(&request).map_err(|e| e.to_string())?;

        if let Some(hook) = self.hook.lock().as_mut() {
            if let Ok(message) = ReplMessage::decode(&request) {
                hook(&self.server, &message);
            }
        }
        Ok(response)
    }

    fn is_healthy(&self) -> bool {
        !self.down.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use replica_master::MasterConfig;
    use replica_storage::MemoryStorage;

    fn client() -> LoopbackClient {
        LoopbackClient::new(Arc::new(MasterServer::new(
            Arc::new(MemoryStorage::new()),
            MasterConfig::default(),
        )))
    }

    fn tail_request() -> Vec<u8> {
        ReplMessage::TailInfoRequest.encode().unwrap()
    }

    #[test]
    fn injected_failures_then_success() {
        let client = client();
        client.fail_next(2);
        assert!(client.call(tail_request()).is_err());
        assert!(client.call(tail_request()).is_err());
        assert!(client.call(tail_request()).is_ok());
        assert_eq!(client.calls(), 3);
    }

    #[test]
    fn down_client_is_unhealthy() {
        let client = client();
        client.set_down(true);
        assert!(!client.is_healthy());
        assert!(client.call(tail_request()).is_err());
        client.set_down(false);
        assert!(client.call(tail_request()).is_ok());
    }

    #[test]
    fn hook_sees_served_requests() {
        let client = client();
        let seen = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&seen);
        client.on_request(move |_, message| {
            if matches!(message, ReplMessage::TailInfoRequest) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.call(tail_request()).unwrap();
        client.fail_next(1);
        let _ = client.call(tail_request());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
