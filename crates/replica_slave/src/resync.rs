//! Full resynchronization.
//!
//! The controller decides whether a resync may start and runs it: every
//! replicated database is dropped locally, copied from a point-in-time
//! snapshot on the master, and tailing resumes from the oldest snapshot's
//! as-of time. A copy is only accepted if the master's log still retains
//! everything after that time once the copy is complete; otherwise the
//! resync is retried, and after `max_resync_attempts` the slave faults.
//!
//! # States
//!
//! ```text
//! STEADY ──request_resync──▶ RESYNCING ──copy verified──▶ STEADY
//!                                │
//!                                └──retries exhausted / fatal──▶ FAULT
//! ```
//!
//! Only one resync runs at a time; requests made while one is pending or
//! running are rejected, not queued.

use crate::context::SlaveContext;
use crate::error::{RejectReason, ReplError, ReplResult};
use crate::retry::retry_transient;
use crate::state::ReplMode;
use crate::transport::MasterTransport;
use parking_lot::{Mutex, RwLock};
use replica_protocol::{Document, HandshakeRequest, HandshakeResponse, OpTime, SnapshotRequest};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime};

/// Why a resync was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResyncReason {
    /// An operator issued the `resync` command.
    Manual,
    /// The applier found its position evicted from the master's log.
    GapDetected,
    /// The slave has never completed a copy, or a copy was interrupted.
    Initial,
}

impl ResyncReason {
    /// Returns the reason name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResyncReason::Manual => "manual",
            ResyncReason::GapDetected => "gap-detected",
            ResyncReason::Initial => "initial",
        }
    }
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncRequest {
    /// When the request was made.
    pub requested_at: SystemTime,
    /// Why it was made.
    pub reason: ResyncReason,
}

impl ResyncRequest {
    /// Creates a request made now.
    pub fn new(reason: ResyncReason) -> Self {
        Self {
            requested_at: SystemTime::now(),
            reason,
        }
    }

    /// Creates a manual request.
    pub fn manual() -> Self {
        Self::new(ResyncReason::Manual)
    }
}

/// Summary of a completed resync.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncOutcome {
    /// Why the resync ran.
    pub reason: ResyncReason,
    /// Attempts made, the successful one included.
    pub attempts: u32,
    /// As-of time of each copied database.
    pub databases: BTreeMap<String, OpTime>,
    /// Position tailing resumed from.
    pub resume_from: OpTime,
    /// Documents copied in the successful attempt.
    pub documents: u64,
    /// Wall time of the whole resync.
    pub elapsed: Duration,
}

/// Something that accepts resync requests.
///
/// Lets the admin command surface trigger resyncs without knowing the
/// slave's transport type.
pub trait ResyncTrigger: Send + Sync {
    /// Requests a resync. Rejections come back as
    /// [`ReplError::ResyncRejected`].
    fn request_resync(&self, request: ResyncRequest) -> ReplResult<()>;
}

/// Drives full resynchronization of one slave.
pub struct ResyncController<T> {
    ctx: SlaveContext<T>,
    pending: Mutex<Option<ResyncRequest>>,
    running: AtomicBool,
    last_outcome: RwLock<Option<ResyncOutcome>>,
}

struct Attempt {
    databases: BTreeMap<String, OpTime>,
    resume_from: OpTime,
    documents: u64,
}

impl<T: MasterTransport> ResyncController<T> {
    pub(crate) fn new(ctx: SlaveContext<T>) -> Self {
        Self {
            ctx,
            pending: Mutex::new(None),
            running: AtomicBool::new(false),
            last_outcome: RwLock::new(None),
        }
    }

    /// Returns true if a request is waiting to run.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Returns true if a resync is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Returns the summary of the last successful resync.
    pub fn last_outcome(&self) -> Option<ResyncOutcome> {
        self.last_outcome.read().clone()
    }

    /// Requests a resync.
    ///
    /// An accepted request moves the slave to RESYNCING immediately; the
    /// copy itself runs in [`Self::run_pending`].
    ///
    /// # Errors
    ///
    /// [`ReplError::ResyncRejected`] with [`RejectReason::InProgress`] if a
    /// resync is pending or running, or [`RejectReason::AlreadyInSync`] for
    /// a manual request while the slave is caught up and has no gap.
    pub fn request_resync(&self, request: ResyncRequest) -> ReplResult<()> {
        if self.is_pending() || self.is_running() {
            return Err(self.reject_in_progress(&request));
        }

        // Asking the master may take a whole retry budget, so it happens
        // before the pending slot is locked.
        if request.reason == ResyncReason::Manual && self.is_caught_up() {
            tracing::info!("resync rejected: already in sync");
            return Err(ReplError::ResyncRejected(RejectReason::AlreadyInSync));
        }

        let mut pending = self.pending.lock();
        if pending.is_some() || self.is_running() {
            return Err(self.reject_in_progress(&request));
        }

        self.ctx.state.begin_resync()?;
        tracing::info!(reason = %request.reason, "resync requested");
        *pending = Some(request);
        Ok(())
    }

    fn reject_in_progress(&self, request: &ResyncRequest) -> ReplError {
        tracing::info!(reason = %request.reason, "resync rejected: already in progress");
        ReplError::ResyncRejected(RejectReason::InProgress)
    }

    fn is_caught_up(&self) -> bool {
        let state = self.ctx.state.snapshot();
        if state.mode != ReplMode::Tailing || !state.initialized || state.gap.is_some() {
            return false;
        }
        match retry_transient(&self.ctx.config.retry, "tail_info", || {
            self.ctx.transport.tail_info()
        }) {
            Ok(tail) => state.last_applied >= tail.latest && state.last_applied >= tail.oldest_retained,
            Err(e) => {
                tracing::warn!(error = %e, "cannot reach master to check sync position");
                false
            }
        }
    }

    /// Handles a gap reported by the applier.
    ///
    /// With auto-resync on, a resync is requested at once; otherwise the
    /// slave stays halted until an operator runs `resync`.
    pub fn on_gap(&self) -> ReplResult<()> {
        if !self.ctx.config.auto_resync {
            tracing::warn!("replication halted on gap; run resync to recover");
            return Ok(());
        }
        match self.request_resync(ResyncRequest::new(ResyncReason::GapDetected)) {
            Ok(()) | Err(ReplError::ResyncRejected(RejectReason::InProgress)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Restores pending work after a restart.
    ///
    /// A persisted RESYNCING mode means a copy was interrupted and its
    /// databases cannot be trusted, so the copy is redone. A slave that
    /// never finished a copy starts one. FAULT is left for the operator.
    pub fn recover(&self) -> ReplResult<()> {
        let state = self.ctx.state.snapshot();
        match state.mode {
            ReplMode::Resyncing => {
                tracing::warn!(
                    invalid = ?state.invalid_databases,
                    "resync was interrupted, restarting it"
                );
                *self.pending.lock() = Some(ResyncRequest::new(ResyncReason::Initial));
                Ok(())
            }
            ReplMode::Fault => {
                tracing::warn!(
                    fault = state.fault.as_deref().unwrap_or("unknown"),
                    "slave is faulted; run resync to recover"
                );
                Ok(())
            }
            ReplMode::Tailing if !state.initialized => {
                self.request_resync(ResyncRequest::new(ResyncReason::Initial))
            }
            ReplMode::Tailing if state.gap.is_some() => self.on_gap(),
            ReplMode::Tailing => Ok(()),
        }
    }

    /// Runs the pending resync, if any.
    ///
    /// Returns `Ok(None)` when nothing was pending. On failure the slave
    /// is in FAULT and the error is returned.
    pub fn run_pending(&self) -> ReplResult<Option<ResyncOutcome>> {
        let request = {
            let mut pending = self.pending.lock();
            match pending.take() {
                Some(request) => {
                    self.running.store(true, Ordering::SeqCst);
                    request
                }
                None => return Ok(None),
            }
        };

        let result = self.run(&request);
        self.running.store(false, Ordering::SeqCst);

        let outcome = result?;
        *self.last_outcome.write() = Some(outcome.clone());
        Ok(Some(outcome))
    }

    fn run(&self, request: &ResyncRequest) -> ReplResult<ResyncOutcome> {
        let _gate = self.ctx.write_gate.lock();
        let started = Instant::now();
        let max_attempts = self.ctx.config.max_resync_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            tracing::info!(reason = %request.reason, attempt, max_attempts, "starting resync");

            match self.attempt() {
                Ok(done) => {
                    self.ctx
                        .state
                        .complete_resync(done.resume_from, &done.databases)?;
                    tracing::info!(
                        resume_from = %done.resume_from,
                        databases = done.databases.len(),
                        documents = done.documents,
                        attempt,
                        "resync complete"
                    );
                    return Ok(ResyncOutcome {
                        reason: request.reason,
                        attempts: attempt,
                        databases: done.databases,
                        resume_from: done.resume_from,
                        documents: done.documents,
                        elapsed: started.elapsed(),
                    });
                }
                Err(ReplError::StaleSnapshot {
                    as_of,
                    oldest_retained,
                }) if attempt < max_attempts => {
                    tracing::warn!(
                        as_of = %as_of,
                        oldest_retained = %oldest_retained,
                        attempt,
                        "snapshot went stale during copy, retrying"
                    );
                }
                Err(e) => {
                    let reason = match &e {
                        ReplError::StaleSnapshot { .. } => {
                            format!("resync gave up after {attempt} attempts: {e}")
                        }
                        _ => format!("resync failed: {e}"),
                    };
                    self.ctx.state.fail(reason)?;
                    return Err(e);
                }
            }
        }
    }

    fn attempt(&self) -> ReplResult<Attempt> {
        let mut handshake = self.handshake()?;
        let mut wanted: BTreeSet<String> = self.replicated(&handshake);

        for local in self.ctx.storage.database_names()? {
            if self.ctx.config.replicates(&local) && !wanted.contains(&local) {
                tracing::info!(database = %local, "dropping database missing on master");
                self.ctx.storage.drop_database(&local)?;
                self.ctx.state.forget_database(&local)?;
            }
        }

        let mut databases = BTreeMap::new();
        let mut documents = 0;
        loop {
            let todo: Vec<String> = wanted
                .iter()
                .filter(|db| !databases.contains_key(*db))
                .cloned()
                .collect();
            if todo.is_empty() {
                break;
            }
            for database in todo {
                let (as_of, count) = self.copy_database(&database)?;
                databases.insert(database, as_of);
                documents += count;
            }
            // Databases created on the master while copying.
            handshake = self.handshake()?;
            wanted.extend(self.replicated(&handshake));
        }

        self.ctx.storage.flush()?;

        let resume_from = databases
            .values()
            .min()
            .copied()
            .unwrap_or(handshake.tail.latest);

        let tail = retry_transient(&self.ctx.config.retry, "tail_info", || {
            self.ctx.transport.tail_info()
        })?;
        if resume_from < tail.oldest_retained {
            return Err(ReplError::StaleSnapshot {
                as_of: resume_from,
                oldest_retained: tail.oldest_retained,
            });
        }

        Ok(Attempt {
            databases,
            resume_from,
            documents,
        })
    }

    fn handshake(&self) -> ReplResult<HandshakeResponse> {
        let request = HandshakeRequest::new(self.ctx.config.slave_name.clone());
        let response = retry_transient(&self.ctx.config.retry, "handshake", || {
            self.ctx.transport.handshake(&request)
        })?;
        if !response.success {
            return Err(ReplError::HandshakeFailed(
                response
                    .error
                    .unwrap_or_else(|| "handshake refused".to_string()),
            ));
        }
        if !response.is_master {
            return Err(ReplError::HandshakeFailed(
                "sync source is not a master".to_string(),
            ));
        }
        Ok(response)
    }

    fn replicated(&self, handshake: &HandshakeResponse) -> BTreeSet<String> {
        handshake
            .databases
            .iter()
            .filter(|db| self.ctx.config.replicates(db))
            .cloned()
            .collect()
    }

    /// Copies one database, restarting the copy from a fresh snapshot on
    /// transient failures. Returns the snapshot's as-of time and the
    /// number of documents copied.
    fn copy_database(&self, database: &str) -> ReplResult<(OpTime, u64)> {
        self.ctx.state.mark_invalid(database)?;
        retry_transient(&self.ctx.config.retry, "snapshot", || {
            self.copy_snapshot(database)
        })
    }

    fn copy_snapshot(&self, database: &str) -> ReplResult<(OpTime, u64)> {
        self.ctx.storage.drop_database(database)?;

        let batch_size = self.ctx.config.snapshot_batch_size;
        let mut request = SnapshotRequest::open(database, batch_size);
        let mut copied = 0u64;

        loop {
            let batch = self.ctx.transport.snapshot_batch(&request)?;

            let mut by_collection: BTreeMap<String, Vec<Document>> = BTreeMap::new();
            for row in batch.documents {
                by_collection
                    .entry(row.collection)
                    .or_default()
                    .push(row.document);
            }
            for (collection, documents) in by_collection {
                copied += documents.len() as u64;
                self.ctx
                    .storage
                    .insert_many(database, &collection, documents)?;
            }

            if let Some(end) = batch.end {
                tracing::info!(
                    database = %database,
                    as_of = %end.as_of,
                    documents = copied,
                    "copied snapshot"
                );
                return Ok((end.as_of, copied));
            }
            request = SnapshotRequest::next(database, batch.snapshot_id, batch_size);
        }
    }
}

impl<T: MasterTransport> ResyncTrigger for ResyncController<T> {
    fn request_resync(&self, request: ResyncRequest) -> ReplResult<()> {
        ResyncController::request_resync(self, request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SlaveConfig, SyncSource};
    use crate::state::ReplStateHandle;
    use crate::stats::{OpCounters, Top};
    use crate::transport::MockTransport;
    use replica_protocol::{SnapshotBatch, SnapshotEnd, SnapshotRow, TailInfo};
    use replica_storage::{MemoryStorage, StorageEngine};
    use std::sync::Arc;

    struct Fixture {
        transport: Arc<MockTransport>,
        storage: Arc<MemoryStorage>,
        ctx: SlaveContext<MockTransport>,
    }

    fn fixture(config: SlaveConfig) -> Fixture {
        let transport = Arc::new(MockTransport::new());
        let storage = Arc::new(MemoryStorage::new());
        let dyn_storage: Arc<dyn StorageEngine> = storage.clone();
        let state = Arc::new(
            ReplStateHandle::open(Arc::clone(&dyn_storage), config.source.clone()).unwrap(),
        );
        Fixture {
            transport: Arc::clone(&transport),
            storage,
            ctx: SlaveContext {
                config,
                transport,
                storage: dyn_storage,
                state,
                write_gate: Arc::new(parking_lot::Mutex::new(())),
                top: Arc::new(Top::new()),
                counters: Arc::new(OpCounters::new()),
            },
        }
    }

    fn config() -> SlaveConfig {
        SlaveConfig::new(SyncSource::new("m", 1)).with_retry(
            RetryConfig::new(2)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn tail(oldest: u32, latest: u32) -> TailInfo {
        TailInfo {
            oldest_retained: OpTime::new(oldest, 1),
            latest: OpTime::new(latest, 1),
        }
    }

    fn one_batch(id: u64, ids: &[&str], as_of: u32) -> SnapshotBatch {
        SnapshotBatch {
            snapshot_id: id,
            documents: ids
                .iter()
                .map(|doc| SnapshotRow {
                    collection: "c".into(),
                    document: Document::with_id(*doc),
                })
                .collect(),
            end: Some(SnapshotEnd {
                as_of: OpTime::new(as_of, 1),
                document_count: ids.len() as u64,
            }),
        }
    }

    fn master(f: &Fixture, databases: &[&str], tail_info: TailInfo) {
        f.transport.set_handshake_response(HandshakeResponse::success(
            tail_info,
            databases.iter().map(|d| d.to_string()).collect(),
        ));
        f.transport.set_tail(tail_info);
    }

    #[test]
    fn initial_resync_copies_and_resumes() {
        let f = fixture(config());
        master(&f, &["app"], tail(1, 5));
        f.transport.push_snapshot_batch("app", one_batch(1, &["a", "b"], 5));

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        assert!(controller.is_pending());
        assert_eq!(f.ctx.state.mode(), ReplMode::Resyncing);

        let outcome = controller.run_pending().unwrap().unwrap();
        assert_eq!(outcome.reason, ResyncReason::Initial);
        assert_eq!(outcome.resume_from, OpTime::new(5, 1));
        assert_eq!(outcome.documents, 2);

        let state = f.ctx.state.snapshot();
        assert_eq!(state.mode, ReplMode::Tailing);
        assert_eq!(state.last_applied, OpTime::new(5, 1));
        assert!(state.initialized);
        assert!(state.invalid_databases.is_empty());
        assert_eq!(f.storage.count("app", "c").unwrap(), 2);
        assert!(controller.run_pending().unwrap().is_none());
    }

    #[test]
    fn manual_rejected_when_caught_up() {
        let f = fixture(config());
        master(&f, &[], tail(1, 5));
        f.ctx
            .state
            .complete_resync(OpTime::new(5, 1), &BTreeMap::new())
            .unwrap();

        let controller = ResyncController::new(f.ctx.clone());
        let err = controller.request_resync(ResyncRequest::manual()).unwrap_err();
        assert!(matches!(
            err,
            ReplError::ResyncRejected(RejectReason::AlreadyInSync)
        ));
        assert_eq!(f.ctx.state.mode(), ReplMode::Tailing);
        assert!(!controller.is_pending());
    }

    #[test]
    fn manual_accepted_when_behind() {
        let f = fixture(config());
        master(&f, &[], tail(1, 9));
        f.ctx
            .state
            .complete_resync(OpTime::new(5, 1), &BTreeMap::new())
            .unwrap();

        let controller = ResyncController::new(f.ctx.clone());
        controller.request_resync(ResyncRequest::manual()).unwrap();
        assert_eq!(f.ctx.state.mode(), ReplMode::Resyncing);

        let err = controller.request_resync(ResyncRequest::manual()).unwrap_err();
        assert!(matches!(
            err,
            ReplError::ResyncRejected(RejectReason::InProgress)
        ));
    }

    #[test]
    fn sync_check_runs_outside_the_pending_lock() {
        let f = fixture(
            config().with_retry(
                RetryConfig::new(4)
                    .with_initial_delay(Duration::from_millis(100))
                    .with_jitter(false),
            ),
        );
        master(&f, &[], tail(1, 5));
        f.ctx
            .state
            .complete_resync(OpTime::new(5, 1), &BTreeMap::new())
            .unwrap();
        f.transport.set_connected(false);

        let controller = ResyncController::new(f.ctx.clone());
        std::thread::scope(|scope| {
            let request = scope.spawn(|| controller.request_resync(ResyncRequest::manual()));
            while !f.transport.calls().contains(&"tail_info") {
                std::thread::yield_now();
            }
            // The master is unreachable, so the request is still backing off.
            assert!(controller.pending.try_lock().is_some());
            assert!(!request.is_finished());
            request.join().unwrap().unwrap();
        });

        // An unreachable master cannot prove the slave is in sync.
        assert!(controller.is_pending());
        assert_eq!(f.ctx.state.mode(), ReplMode::Resyncing);
    }

    #[test]
    fn stale_snapshot_exhausts_attempts_and_faults() {
        let f = fixture(config().with_max_resync_attempts(2));
        master(&f, &["app"], tail(8, 9));
        f.transport.push_snapshot_batch("app", one_batch(1, &["a"], 5));
        f.transport.push_snapshot_batch("app", one_batch(2, &["a"], 6));

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        let err = controller.run_pending().unwrap_err();
        assert!(matches!(err, ReplError::StaleSnapshot { .. }));

        let state = f.ctx.state.snapshot();
        assert_eq!(state.mode, ReplMode::Fault);
        assert!(state.fault.unwrap().contains("2 attempts"));
        assert!(!controller.is_running());
    }

    #[test]
    fn stale_snapshot_retry_succeeds() {
        let f = fixture(config().with_max_resync_attempts(3));
        master(&f, &["app"], tail(6, 9));
        f.transport.push_snapshot_batch("app", one_batch(1, &["a"], 5));
        f.transport.push_snapshot_batch("app", one_batch(2, &["a", "b"], 7));

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        let outcome = controller.run_pending().unwrap().unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.resume_from, OpTime::new(7, 1));
        assert_eq!(f.storage.count("app", "c").unwrap(), 2);
    }

    #[test]
    fn databases_missing_on_master_are_dropped() {
        let f = fixture(config());
        f.storage
            .insert_many("gone", "c", vec![Document::with_id("x")])
            .unwrap();
        master(&f, &["app"], tail(1, 5));
        f.transport.push_snapshot_batch("app", one_batch(1, &["a"], 5));

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        controller.run_pending().unwrap();
        assert_eq!(f.storage.count("gone", "c").unwrap(), 0);
        assert!(!f.storage.database_names().unwrap().contains(&"gone".to_string()));
    }

    #[test]
    fn multiple_databases_resume_from_oldest_snapshot() {
        let f = fixture(config());
        master(&f, &["a", "b"], tail(1, 8));
        f.transport.push_snapshot_batch("a", one_batch(1, &["x"], 4));
        f.transport.push_snapshot_batch("b", one_batch(2, &["y"], 7));

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        let outcome = controller.run_pending().unwrap().unwrap();
        assert_eq!(outcome.resume_from, OpTime::new(4, 1));
        assert_eq!(f.ctx.state.watermark("b"), Some(OpTime::new(7, 1)));
        assert_eq!(f.ctx.state.watermark("a"), None);
    }

    #[test]
    fn refused_handshake_faults() {
        let f = fixture(config());
        f.transport
            .set_handshake_response(HandshakeResponse::error("protocol mismatch"));

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        let err = controller.run_pending().unwrap_err();
        assert!(matches!(err, ReplError::HandshakeFailed(_)));
        assert_eq!(f.ctx.state.mode(), ReplMode::Fault);
    }

    #[test]
    fn gap_without_auto_resync_halts() {
        let f = fixture(config());
        let controller = ResyncController::new(f.ctx.clone());
        controller.on_gap().unwrap();
        assert!(!controller.is_pending());

        let f = fixture(config().with_auto_resync(true));
        f.ctx
            .state
            .complete_resync(OpTime::new(1, 1), &BTreeMap::new())
            .unwrap();
        let controller = ResyncController::new(f.ctx.clone());
        controller.on_gap().unwrap();
        assert!(controller.is_pending());
        controller.on_gap().unwrap();
    }

    #[test]
    fn fault_can_be_resynced_manually() {
        let f = fixture(config());
        master(&f, &[], tail(1, 5));
        f.ctx.state.fail("disk full").unwrap();

        let controller = ResyncController::new(f.ctx.clone());
        controller.recover().unwrap();
        assert!(!controller.is_pending());
        controller.request_resync(ResyncRequest::manual()).unwrap();
        controller.run_pending().unwrap();
        assert_eq!(f.ctx.state.mode(), ReplMode::Tailing);
        assert_eq!(f.ctx.state.last_applied(), OpTime::new(5, 1));
    }
}
