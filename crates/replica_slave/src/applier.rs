//! Log tailing and in-order application.
//!
//! The applier reads the master's log from the slave's last applied
//! position and applies each entry to local storage in op time order.
//! It never skips an entry it has not seen: entries are only passed over
//! when they are already contained in local data (at or below
//! `last_applied` or a database watermark) or belong to a database this
//! slave does not replicate.

use crate::context::SlaveContext;
use crate::error::{ReplError, ReplResult};
use crate::retry::retry_transient;
use crate::state::{GapInfo, ReplMode};
use crate::stats::{LockKind, UsageKind};
use crate::transport::MasterTransport;
use parking_lot::RwLock;
use replica_protocol::{LogCursor, LogRead, LogReadRequest, OperationEntry, LOCAL_DATABASE};
use std::time::Instant;

/// State of the applier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplierState {
    /// Not tailing: the slave is resyncing, faulted, or never synced.
    Idle,
    /// Tailing the master's log.
    Tailing,
    /// Halted on a gap until a resync completes.
    Gap,
}

/// Result of one applier step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    /// A batch was read and applied.
    Applied {
        /// Entries applied to storage.
        count: usize,
        /// Whether the master has more entries past this batch.
        has_more: bool,
    },
    /// No entries past the current position.
    CaughtUp,
    /// The slave's position is no longer covered by the master's log.
    Gap(GapInfo),
    /// Tailing is paused by a resync, a fault, or a recorded gap.
    Paused,
}

/// Applies the master's log to local storage.
pub struct Applier<T> {
    ctx: SlaveContext<T>,
    status: RwLock<ApplierState>,
}

impl<T: MasterTransport> Applier<T> {
    pub(crate) fn new(ctx: SlaveContext<T>) -> Self {
        Self {
            ctx,
            status: RwLock::new(ApplierState::Idle),
        }
    }

    /// Returns the applier's state.
    pub fn status(&self) -> ApplierState {
        *self.status.read()
    }

    fn set_status(&self, status: ApplierState) {
        let mut current = self.status.write();
        if *current != status {
            tracing::debug!(from = ?*current, to = ?status, "applier state change");
            *current = status;
        }
    }

    /// Reads one batch from the master and applies it.
    ///
    /// Transient read failures are retried with backoff. If the retry
    /// budget runs out, or the read or an apply fails for good, the slave
    /// moves to FAULT and a [`ReplError::Fatal`] is returned.
    pub fn step(&self) -> ReplResult<StepOutcome> {
        let _gate = self.ctx.write_gate.lock();

        let state = self.ctx.state.snapshot();
        if state.gap.is_some() {
            self.set_status(ApplierState::Gap);
            return Ok(StepOutcome::Paused);
        }
        if state.mode != ReplMode::Tailing || !state.initialized {
            self.set_status(ApplierState::Idle);
            return Ok(StepOutcome::Paused);
        }
        self.set_status(ApplierState::Tailing);

        let request = LogReadRequest::new(
            LogCursor::at(state.last_applied),
            self.ctx.config.pull_batch_size,
        );
        let read = match retry_transient(&self.ctx.config.retry, "read_log", || {
            self.ctx.transport.read_log(&request)
        }) {
            Ok(read) => read,
            Err(e) => {
                let reason = if e.is_retryable() {
                    format!("log read retries exhausted: {e}")
                } else {
                    format!("log read failed: {e}")
                };
                return Err(self.fault(reason)?);
            }
        };

        match read {
            LogRead::Gap {
                requested,
                oldest_retained,
            } => {
                let gap = GapInfo {
                    requested: requested.op_time,
                    oldest_retained,
                };
                tracing::warn!(
                    requested = %gap.requested,
                    oldest_retained = %gap.oldest_retained,
                    "slave fell behind the master's log"
                );
                self.ctx.state.record_gap(gap)?;
                self.set_status(ApplierState::Gap);
                Ok(StepOutcome::Gap(gap))
            }
            LogRead::Entries {
                entries, has_more, ..
            } => {
                if entries.is_empty() {
                    return Ok(StepOutcome::CaughtUp);
                }
                let count = self.apply_batch(&entries)?;
                Ok(StepOutcome::Applied { count, has_more })
            }
        }
    }

    fn apply_batch(&self, entries: &[OperationEntry]) -> ReplResult<usize> {
        let mut last = self.ctx.state.last_applied();
        let mut applied = 0;

        for entry in entries {
            if self.ctx.state.mode() != ReplMode::Tailing {
                tracing::debug!("mode changed mid-batch, stopping");
                break;
            }
            if entry.op_time <= last {
                continue;
            }

            if self.should_apply(entry) {
                let started = Instant::now();
                if let Err(e) = self.ctx.storage.apply(entry) {
                    // Keep what was applied before the failing entry.
                    self.ctx.state.checkpoint()?;
                    return Err(self.fault(format!(
                        "cannot apply {} at {}: {e}",
                        entry.namespace(),
                        entry.op_time
                    ))?);
                }
                let kind = UsageKind::from(entry.payload.kind());
                self.ctx.top.record(
                    &entry.namespace(),
                    kind,
                    LockKind::Write,
                    started.elapsed().as_micros() as u64,
                );
                self.ctx.counters.record(kind);
                applied += 1;
            }

            self.ctx.state.advance_to(entry.op_time);
            last = entry.op_time;
        }

        self.ctx.state.checkpoint()?;
        tracing::debug!(applied, last_applied = %last, "applied batch");
        Ok(applied)
    }

    /// Moves the slave to FAULT and returns the error to surface.
    fn fault(&self, reason: String) -> ReplResult<ReplError> {
        self.ctx.state.fail(reason.clone())?;
        self.set_status(ApplierState::Idle);
        Ok(ReplError::Fatal(reason))
    }

    fn should_apply(&self, entry: &OperationEntry) -> bool {
        if entry.database == LOCAL_DATABASE || !self.ctx.config.replicates(&entry.database) {
            return false;
        }
        match self.ctx.state.watermark(&entry.database) {
            Some(watermark) => entry.op_time > watermark,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{RetryConfig, SlaveConfig, SyncSource};
    use crate::state::ReplStateHandle;
    use crate::stats::{OpCounters, Top};
    use crate::transport::MockTransport;
    use parking_lot::Mutex;
    use replica_protocol::{Document, NewOperation, OpTime};
    use replica_storage::{MemoryStorage, StorageEngine};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

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
        let ctx = SlaveContext {
            config,
            transport: Arc::clone(&transport),
            storage: dyn_storage,
            state,
            write_gate: Arc::new(Mutex::new(())),
            top: Arc::new(Top::new()),
            counters: Arc::new(OpCounters::new()),
        };
        Fixture {
            transport,
            storage,
            ctx,
        }
    }

    fn config() -> SlaveConfig {
        SlaveConfig::new(SyncSource::new("m", 1)).with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(1))
                .with_jitter(false),
        )
    }

    fn insert(db: &str, secs: u32, id: &str) -> OperationEntry {
        NewOperation::insert(db, "c", Document::with_id(id).set("v", secs)).at(OpTime::new(secs, 1))
    }

    fn entries(entries: Vec<OperationEntry>, has_more: bool) -> LogRead {
        let new_cursor = LogCursor::at(entries.last().map(|e| e.op_time).unwrap_or_default());
        LogRead::Entries {
            entries,
            new_cursor,
            has_more,
        }
    }

    fn initialize(f: &Fixture, at: OpTime, copied: &[(&str, OpTime)]) {
        let copied: BTreeMap<String, OpTime> =
            copied.iter().map(|(db, t)| (db.to_string(), *t)).collect();
        f.ctx.state.complete_resync(at, &copied).unwrap();
    }

    #[test]
    fn paused_until_initialized() {
        let f = fixture(config());
        let applier = Applier::new(f.ctx.clone());
        assert_eq!(applier.step().unwrap(), StepOutcome::Paused);
        assert_eq!(applier.status(), ApplierState::Idle);
        assert!(f.transport.calls().is_empty());
    }

    #[test]
    fn applies_in_order_and_advances() {
        let f = fixture(config());
        initialize(&f, OpTime::ZERO, &[]);
        f.transport
            .push_log_read(entries(vec![insert("app", 1, "a"), insert("app", 2, "b")], true));

        let applier = Applier::new(f.ctx.clone());
        assert_eq!(
            applier.step().unwrap(),
            StepOutcome::Applied {
                count: 2,
                has_more: true
            }
        );
        assert_eq!(f.ctx.state.last_applied(), OpTime::new(2, 1));
        assert_eq!(f.storage.count("app", "c").unwrap(), 2);
        assert_eq!(applier.step().unwrap(), StepOutcome::CaughtUp);
        assert_eq!(f.ctx.counters.snapshot().insert, 2);
        assert_eq!(f.ctx.top.usage()["app.c"].insert.count, 2);
    }

    #[test]
    fn redelivered_entries_are_skipped() {
        let f = fixture(config());
        initialize(&f, OpTime::new(2, 1), &[]);
        f.transport
            .push_log_read(entries(vec![insert("app", 1, "a"), insert("app", 3, "c")], false));

        let applier = Applier::new(f.ctx.clone());
        let outcome = applier.step().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Applied {
                count: 1,
                has_more: false
            }
        );
        assert!(f.storage.get("app", "c", &"a".into()).unwrap().is_none());
    }

    #[test]
    fn filtered_and_watermarked_entries_advance_without_applying() {
        let f = fixture(config().with_only("app"));
        initialize(&f, OpTime::new(1, 1), &[("app", OpTime::new(3, 1))]);
        f.transport.push_log_read(entries(
            vec![
                insert("other", 2, "x"),
                insert("app", 3, "y"),
                insert("app", 4, "z"),
            ],
            false,
        ));

        let applier = Applier::new(f.ctx.clone());
        assert_eq!(
            applier.step().unwrap(),
            StepOutcome::Applied {
                count: 1,
                has_more: false
            }
        );
        assert_eq!(f.ctx.state.last_applied(), OpTime::new(4, 1));
        assert_eq!(f.storage.count("other", "c").unwrap(), 0);
        assert_eq!(f.storage.count("app", "c").unwrap(), 1);
        assert_eq!(f.ctx.state.watermark("app"), None);
    }

    #[test]
    fn gap_is_recorded_and_pauses() {
        let f = fixture(config());
        initialize(&f, OpTime::new(1, 1), &[]);
        f.transport.push_log_read(LogRead::Gap {
            requested: LogCursor::at(OpTime::new(1, 1)),
            oldest_retained: OpTime::new(9, 1),
        });

        let applier = Applier::new(f.ctx.clone());
        let outcome = applier.step().unwrap();
        assert_eq!(
            outcome,
            StepOutcome::Gap(GapInfo {
                requested: OpTime::new(1, 1),
                oldest_retained: OpTime::new(9, 1),
            })
        );
        assert_eq!(applier.status(), ApplierState::Gap);
        assert!(f.ctx.state.gap().is_some());

        assert_eq!(applier.step().unwrap(), StepOutcome::Paused);
        assert_eq!(f.transport.calls().len(), 1);
    }

    #[test]
    fn transient_failures_within_budget() {
        let f = fixture(config());
        initialize(&f, OpTime::ZERO, &[]);
        f.transport.fail_next(2);
        f.transport
            .push_log_read(entries(vec![insert("app", 1, "a")], false));

        let applier = Applier::new(f.ctx.clone());
        assert!(matches!(
            applier.step().unwrap(),
            StepOutcome::Applied { count: 1, .. }
        ));
        assert_eq!(f.ctx.state.mode(), ReplMode::Tailing);
    }

    #[test]
    fn exhausted_retries_fault() {
        let f = fixture(config());
        initialize(&f, OpTime::ZERO, &[]);
        f.transport.fail_next(3);

        let applier = Applier::new(f.ctx.clone());
        let err = applier.step().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.ctx.state.mode(), ReplMode::Fault);
        assert_eq!(applier.step().unwrap(), StepOutcome::Paused);
    }

    #[test]
    fn rejected_log_read_faults_without_retrying() {
        let f = fixture(config());
        initialize(&f, OpTime::ZERO, &[]);
        f.transport.reject_next(1);

        let applier = Applier::new(f.ctx.clone());
        let err = applier.step().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(f.transport.calls(), vec!["read_log"]);

        let state = f.ctx.state.snapshot();
        assert_eq!(state.mode, ReplMode::Fault);
        assert!(state.fault.unwrap().contains("log read failed"));
        assert_eq!(applier.step().unwrap(), StepOutcome::Paused);
        assert_eq!(f.transport.calls().len(), 1);
    }

    #[test]
    fn storage_rejection_faults_and_keeps_earlier_entries() {
        let f = fixture(config());
        initialize(&f, OpTime::ZERO, &[]);
        let bad = NewOperation::insert("bad.db", "c", Document::with_id("x")).at(OpTime::new(2, 1));
        f.transport
            .push_log_read(entries(vec![insert("app", 1, "a"), bad], false));

        let applier = Applier::new(f.ctx.clone());
        assert!(applier.step().unwrap_err().is_fatal());
        assert_eq!(f.ctx.state.mode(), ReplMode::Fault);
        assert_eq!(f.ctx.state.last_applied(), OpTime::new(1, 1));
        assert_eq!(f.storage.count("app", "c").unwrap(), 1);
    }

    #[test]
    fn local_database_is_never_applied() {
        let f = fixture(config());
        initialize(&f, OpTime::ZERO, &[]);
        f.transport
            .push_log_read(entries(vec![insert(LOCAL_DATABASE, 1, "a")], false));

        let applier = Applier::new(f.ctx.clone());
        assert!(matches!(
            applier.step().unwrap(),
            StepOutcome::Applied { count: 0, .. }
        ));
        assert_eq!(f.storage.count(LOCAL_DATABASE, "c").unwrap(), 0);
    }
}
