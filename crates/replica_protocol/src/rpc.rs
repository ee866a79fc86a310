//! Byte-level request/response client abstraction.

use std::sync::Arc;

/// A request/response channel to a master.
///
/// Implement this trait to carry CBOR frames over any transport (TCP,
/// HTTP, an in-process loopback). Errors are plain strings; the slave
/// treats every client error as a transient transport failure.
pub trait RpcClient: Send + Sync {
    /// Sends one encoded request and returns the encoded response.
    fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

impl<C: RpcClient + ?Sized> RpcClient for Arc<C> {
    fn call(&self, request: Vec<u8>) -> Result<Vec<u8>, String> {
        (**self).call(request)
    }

    fn is_healthy(&self) -> bool {
        (**self).is_healthy()
    }
}
