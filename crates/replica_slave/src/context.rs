//! Explicit per-slave context shared by the applier and the controller.

use crate::config::SlaveConfig;
use crate::state::ReplStateHandle;
use crate::stats::{OpCounters, Top};
use parking_lot::{Condvar, Mutex};
use replica_storage::StorageEngine;
use std::sync::Arc;
use std::time::Duration;

/// Everything one slave's replication tasks share.
///
/// Each slave owns exactly one context; nothing here is process-global.
pub(crate) struct SlaveContext<T> {
    pub(crate) config: SlaveConfig,
    pub(crate) transport: Arc<T>,
    pub(crate) storage: Arc<dyn StorageEngine>,
    pub(crate) state: Arc<ReplStateHandle>,
    /// Held by the applier for each batch and by the controller for a whole
    /// resync, so the two never write local data at the same time.
    pub(crate) write_gate: Arc<Mutex<()>>,
    pub(crate) top: Arc<Top>,
    pub(crate) counters: Arc<OpCounters>,
}

impl<T> Clone for SlaveContext<T> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            transport: Arc::clone(&self.transport),
            storage: Arc::clone(&self.storage),
            state: Arc::clone(&self.state),
            write_gate: Arc::clone(&self.write_gate),
            top: Arc::clone(&self.top),
            counters: Arc::clone(&self.counters),
        }
    }
}

/// Wakes a background task early.
#[derive(Debug, Default)]
pub(crate) struct Notifier {
    signalled: Mutex<bool>,
    cond: Condvar,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn notify(&self) {
        *self.signalled.lock() = true;
        self.cond.notify_all();
    }

    /// Waits until notified or `timeout` passes. Returns true if notified.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let mut signalled = self.signalled.lock();
        if !*signalled {
            let _ = self.cond.wait_for(&mut signalled, timeout);
        }
        std::mem::replace(&mut *signalled, false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn notify_before_wait_is_not_lost() {
        let notifier = Notifier::new();
        notifier.notify();
        let start = Instant::now();
        assert!(notifier.wait(Duration::from_secs(5)));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!notifier.wait(Duration::from_millis(1)));
    }

    #[test]
    fn notify_from_other_thread() {
        let notifier = Arc::new(Notifier::new());
        let other = Arc::clone(&notifier);
        let handle = std::thread::spawn(move || other.notify());
        assert!(notifier.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }
}
