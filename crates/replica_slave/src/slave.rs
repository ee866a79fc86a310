//! The slave runtime.

use crate::applier::{Applier, StepOutcome};
use crate::commands::{AdminCommands, CommandReply};
use crate::config::SlaveConfig;
use crate::context::{Notifier, SlaveContext};
use crate::error::{ReplError, ReplResult};
use crate::resync::{
    ResyncController, ResyncOutcome, ResyncReason, ResyncRequest, ResyncTrigger,
};
use crate::state::{ReplStateHandle, ReplicationState};
use crate::stats::{OpCounters, SnapshotRing, Top};
use crate::transport::MasterTransport;
use parking_lot::Mutex;
use replica_storage::StorageEngine;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

struct NodeInner<T> {
    ctx: SlaveContext<T>,
    applier: Applier<T>,
    controller: Arc<ResyncController<T>>,
    admin: AdminCommands,
    usage: Arc<SnapshotRing>,
    running: AtomicBool,
    applier_wake: Notifier,
    resync_wake: Notifier,
}

impl<T: MasterTransport + 'static> NodeInner<T> {
    fn run_resync(&self) -> ReplResult<Option<ResyncOutcome>> {
        let outcome = self.controller.run_pending()?;
        if outcome.is_some() {
            self.applier_wake.notify();
        }
        Ok(outcome)
    }

    fn step(&self) -> ReplResult<StepOutcome> {
        let outcome = self.applier.step()?;
        if let StepOutcome::Gap(_) = outcome {
            self.controller.on_gap()?;
            if self.controller.is_pending() {
                self.resync_wake.notify();
            }
        }
        Ok(outcome)
    }

    fn tail_loop(&self) {
        tracing::info!(source = %self.ctx.config.source, "applier started");
        let interval = self.ctx.config.usage_snapshot_interval;
        let mut last_usage = Instant::now();
        self.usage.add(self.ctx.top.snapshot());

        while self.running.load(Ordering::SeqCst) {
            if last_usage.elapsed() >= interval {
                self.usage.add(self.ctx.top.snapshot());
                last_usage = Instant::now();
            }

            match self.step() {
                Ok(StepOutcome::Applied { .. }) => continue,
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "applier step failed"),
            }
            self.applier_wake.wait(self.ctx.config.idle_poll_interval);
        }
        tracing::info!("applier stopped");
    }

    fn resync_loop(&self) {
        while self.running.load(Ordering::SeqCst) {
            if let Err(e) = self.run_resync() {
                tracing::error!(error = %e, "resync failed");
            }
            self.resync_wake.wait(self.ctx.config.idle_poll_interval);
        }
    }
}

/// A slave: replication state, applier, resync controller and admin
/// commands for one sync source.
///
/// Either call [`SlaveNode::start`] to run the applier and the resync
/// worker on background threads, or drive the node step by step with
/// [`SlaveNode::poll_once`] and [`SlaveNode::sync_until_idle`].
pub struct SlaveNode<T: MasterTransport + 'static> {
    inner: Arc<NodeInner<T>>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: MasterTransport + 'static> SlaveNode<T> {
    /// Opens a slave over `storage`, restoring persisted state.
    ///
    /// A slave that never completed a copy, or whose copy was interrupted,
    /// starts with a resync pending.
    pub fn open(
        config: SlaveConfig,
        transport: T,
        storage: Arc<dyn StorageEngine>,
    ) -> ReplResult<Self> {
        let state = Arc::new(ReplStateHandle::open(
            Arc::clone(&storage),
            config.source.clone(),
        )?);
        let usage = Arc::new(SnapshotRing::new(config.usage_history));
        let ctx = SlaveContext {
            config,
            transport: Arc::new(transport),
            storage: Arc::clone(&storage),
            state: Arc::clone(&state),
            write_gate: Arc::new(Mutex::new(())),
            top: Arc::new(Top::new()),
            counters: Arc::new(OpCounters::new()),
        };

        let controller = Arc::new(ResyncController::new(ctx.clone()));
        controller.recover()?;

        let admin = AdminCommands::slave(
            storage,
            state,
            Arc::clone(&controller) as Arc<dyn ResyncTrigger>,
            Arc::clone(&ctx.top),
            Arc::clone(&ctx.counters),
            Arc::clone(&usage),
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                applier: Applier::new(ctx.clone()),
                ctx,
                controller,
                admin,
                usage,
                running: AtomicBool::new(false),
                applier_wake: Notifier::new(),
                resync_wake: Notifier::new(),
            }),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SlaveConfig {
        &self.inner.ctx.config
    }

    /// Returns the transport.
    pub fn transport(&self) -> &Arc<T> {
        &self.inner.ctx.transport
    }

    /// Returns the storage engine.
    pub fn storage(&self) -> &Arc<dyn StorageEngine> {
        &self.inner.ctx.storage
    }

    /// Returns a copy of the replication state.
    pub fn state(&self) -> ReplicationState {
        self.inner.ctx.state.snapshot()
    }

    /// Returns the applier.
    pub fn applier(&self) -> &Applier<T> {
        &self.inner.applier
    }

    /// Returns the resync controller.
    pub fn controller(&self) -> &ResyncController<T> {
        &self.inner.controller
    }

    /// Returns the usage tracker.
    pub fn top(&self) -> &Top {
        &self.inner.ctx.top
    }

    /// Returns the admin command dispatcher.
    pub fn admin(&self) -> &AdminCommands {
        &self.inner.admin
    }

    /// Runs an admin command.
    pub fn run_command(&self, name: &str) -> CommandReply {
        let reply = self.inner.admin.run(name);
        if name == "resync" && reply.ok {
            self.inner.resync_wake.notify();
        }
        reply
    }

    /// Requests a resync for `reason`.
    pub fn request_resync(&self, reason: ResyncReason) -> ReplResult<()> {
        self.inner
            .controller
            .request_resync(ResyncRequest::new(reason))?;
        self.inner.resync_wake.notify();
        Ok(())
    }

    /// Runs a pending resync, then one applier step.
    pub fn poll_once(&self) -> ReplResult<StepOutcome> {
        self.inner.run_resync()?;
        self.inner.step()
    }

    /// Polls until the slave is caught up or paused with nothing pending.
    pub fn sync_until_idle(&self) -> ReplResult<StepOutcome> {
        loop {
            match self.poll_once()? {
                StepOutcome::Applied { .. } => {}
                StepOutcome::Gap(_) | StepOutcome::Paused if self.inner.controller.is_pending() => {}
                outcome => return Ok(outcome),
            }
        }
    }

    /// Starts the applier and resync threads.
    pub fn start(&self) -> ReplResult<()> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let mut threads = self.threads.lock();
        let inner = Arc::clone(&self.inner);
        threads.push(spawn("replica-applier", move || inner.tail_loop())?);
        let inner = Arc::clone(&self.inner);
        threads.push(spawn("replica-resync", move || inner.resync_loop())?);
        Ok(())
    }

    /// Returns true if the background threads are running.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Stops the background threads and flushes storage.
    ///
    /// A resync in progress runs to completion first.
    pub fn shutdown(&self) -> ReplResult<()> {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.applier_wake.notify();
        self.inner.resync_wake.notify();

        for handle in self.threads.lock().drain(..) {
            if handle.join().is_err() {
                tracing::error!("replication thread panicked");
            }
        }
        self.inner.ctx.storage.flush()?;
        Ok(())
    }
}

impl<T: MasterTransport + 'static> Drop for SlaveNode<T> {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            tracing::error!(error = %e, "error stopping slave");
        }
    }
}

fn spawn<F>(name: &str, f: F) -> ReplResult<JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(f)
        .map_err(|e| ReplError::Fatal(format!("cannot spawn {name}: {e}")))
}
