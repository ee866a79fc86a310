//! Per-namespace usage statistics.
//!
//! [`Top`] accumulates time and count per `db.collection` for every
//! operation the slave performs, plus a global aggregate. Periodic
//! [`UsageSnapshot`]s are kept in a bounded [`SnapshotRing`] so that
//! `serverStatus` can report activity over a recent window rather than
//! since startup.

use parking_lot::Mutex;
use replica_protocol::OpKind;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Accumulated time and count for one counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UsageData {
    /// Total time spent, in microseconds.
    #[serde(rename = "time")]
    pub time_micros: u64,
    /// Number of operations.
    pub count: u64,
}

impl UsageData {
    fn inc(&mut self, micros: u64) {
        self.time_micros += micros;
        self.count += 1;
    }

    fn since(&self, older: &UsageData) -> UsageData {
        UsageData {
            time_micros: self.time_micros.saturating_sub(older.time_micros),
            count: self.count.saturating_sub(older.count),
        }
    }
}

/// Usage counters for one namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionUsage {
    /// Every recorded operation.
    pub total: UsageData,
    /// Operations run under a read lock.
    pub read_lock: UsageData,
    /// Operations run under the write lock.
    pub write_lock: UsageData,
    /// Queries.
    pub queries: UsageData,
    /// Cursor continuations.
    pub getmore: UsageData,
    /// Inserts.
    pub insert: UsageData,
    /// Updates.
    pub update: UsageData,
    /// Removes.
    pub remove: UsageData,
    /// Collection and database commands.
    pub commands: UsageData,
}

impl CollectionUsage {
    fn record(&mut self, kind: UsageKind, lock: LockKind, micros: u64) {
        self.total.inc(micros);

        match lock {
            LockKind::Write => self.write_lock.inc(micros),
            LockKind::Read => self.read_lock.inc(micros),
            LockKind::None => {}
        }

        match kind {
            UsageKind::Query => self.queries.inc(micros),
            UsageKind::GetMore => self.getmore.inc(micros),
            UsageKind::Insert => self.insert.inc(micros),
            UsageKind::Update => self.update.inc(micros),
            UsageKind::Remove => self.remove.inc(micros),
            UsageKind::Command => self.commands.inc(micros),
            UsageKind::Other => {}
        }
    }

    fn since(&self, older: &CollectionUsage) -> CollectionUsage {
        CollectionUsage {
            total: self.total.since(&older.total),
            read_lock: self.read_lock.since(&older.read_lock),
            write_lock: self.write_lock.since(&older.write_lock),
            queries: self.queries.since(&older.queries),
            getmore: self.getmore.since(&older.getmore),
            insert: self.insert.since(&older.insert),
            update: self.update.since(&older.update),
            remove: self.remove.since(&older.remove),
            commands: self.commands.since(&older.commands),
        }
    }
}

/// Kind of operation being recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageKind {
    /// A query.
    Query,
    /// A cursor continuation.
    GetMore,
    /// An insert.
    Insert,
    /// An update.
    Update,
    /// A remove.
    Remove,
    /// A command.
    Command,
    /// Anything else; counted in the totals only.
    Other,
}

impl From<OpKind> for UsageKind {
    fn from(kind: OpKind) -> Self {
        match kind {
            OpKind::Insert => UsageKind::Insert,
            OpKind::Update => UsageKind::Update,
            OpKind::Delete => UsageKind::Remove,
            OpKind::Command => UsageKind::Command,
        }
    }
}

/// Lock an operation held while it ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// No lock.
    None,
}

/// Usage of every namespace, keyed by `db.collection`.
pub type UsageMap = BTreeMap<String, CollectionUsage>;

#[derive(Debug, Default)]
struct TopInner {
    usage: UsageMap,
    global: CollectionUsage,
}

/// Usage tracker for all namespaces.
#[derive(Debug)]
pub struct Top {
    inner: Mutex<TopInner>,
    started: Instant,
}

impl Top {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(TopInner::default()),
            started: Instant::now(),
        }
    }

    /// Records one operation against `ns`.
    pub fn record(&self, ns: &str, kind: UsageKind, lock: LockKind, micros: u64) {
        let mut inner = self.inner.lock();
        inner
            .usage
            .entry(ns.to_string())
            .or_default()
            .record(kind, lock, micros);
        inner.global.record(kind, lock, micros);
    }

    /// Returns a copy of the per-namespace usage.
    pub fn usage(&self) -> UsageMap {
        self.inner.lock().usage.clone()
    }

    /// Returns the global aggregate.
    pub fn global(&self) -> CollectionUsage {
        self.inner.lock().global
    }

    /// Captures all counters at this instant.
    pub fn snapshot(&self) -> UsageSnapshot {
        let inner = self.inner.lock();
        UsageSnapshot {
            taken_at_micros: self.started.elapsed().as_micros() as u64,
            write_locked_micros: inner.global.write_lock.time_micros,
            global: inner.global,
            usage: inner.usage.clone(),
        }
    }
}

impl Default for Top {
    fn default() -> Self {
        Self::new()
    }
}

/// All usage counters at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct UsageSnapshot {
    /// Microseconds since the tracker was created.
    pub taken_at_micros: u64,
    /// Total time spent under the write lock.
    pub write_locked_micros: u64,
    /// Global aggregate.
    pub global: CollectionUsage,
    /// Per-namespace usage.
    pub usage: UsageMap,
}

/// Activity between two snapshots.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageDelta {
    /// Start of the window, in microseconds since the tracker was created.
    pub start_micros: u64,
    /// Window length in microseconds.
    pub elapsed_micros: u64,
    /// Time spent under the write lock during the window.
    pub write_locked_micros: u64,
    /// Global activity during the window.
    pub global: CollectionUsage,
    /// Per-namespace activity during the window.
    pub usage: UsageMap,
}

impl UsageDelta {
    /// Computes the activity from `older` to `newer`.
    ///
    /// Namespaces that first appear in `newer` count from zero.
    pub fn between(older: &UsageSnapshot, newer: &UsageSnapshot) -> Self {
        let usage = newer
            .usage
            .iter()
            .map(|(ns, now)| {
                let before = older.usage.get(ns).copied().unwrap_or_default();
                (ns.clone(), now.since(&before))
            })
            .collect();

        Self {
            start_micros: older.taken_at_micros,
            elapsed_micros: newer.taken_at_micros.saturating_sub(older.taken_at_micros),
            write_locked_micros: newer
                .write_locked_micros
                .saturating_sub(older.write_locked_micros),
            global: newer.global.since(&older.global),
            usage,
        }
    }

    /// Fraction of the window spent under the write lock.
    pub fn percent_write_locked(&self) -> f64 {
        if self.elapsed_micros == 0 {
            return 0.0;
        }
        self.write_locked_micros as f64 / self.elapsed_micros as f64
    }
}

/// Bounded history of usage snapshots, newest last.
#[derive(Debug)]
pub struct SnapshotRing {
    capacity: usize,
    snapshots: Mutex<VecDeque<UsageSnapshot>>,
}

impl SnapshotRing {
    /// Creates a ring keeping at most `capacity` snapshots (at least two).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(2);
        Self {
            capacity,
            snapshots: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    /// Adds a snapshot, dropping the oldest when full.
    pub fn add(&self, snapshot: UsageSnapshot) {
        let mut snapshots = self.snapshots.lock();
        if snapshots.len() == self.capacity {
            snapshots.pop_front();
        }
        snapshots.push_back(snapshot);
    }

    /// Number of deltas that can be computed.
    pub fn num_deltas(&self) -> usize {
        self.snapshots.lock().len().saturating_sub(1)
    }

    /// Returns the snapshot `num_back` positions before the newest.
    pub fn get_prev(&self, num_back: usize) -> Option<UsageSnapshot> {
        let snapshots = self.snapshots.lock();
        let index = snapshots.len().checked_sub(num_back + 1)?;
        snapshots.get(index).cloned()
    }

    /// Computes the delta between the snapshot `num_back` before the newest
    /// and the one just before it.
    pub fn compute_delta(&self, num_back: usize) -> Option<UsageDelta> {
        let snapshots = self.snapshots.lock();
        let newer = snapshots.len().checked_sub(num_back + 1)?;
        let older = newer.checked_sub(1)?;
        Some(UsageDelta::between(&snapshots[older], &snapshots[newer]))
    }
}

/// Global operation counters reported by `serverStatus`.
#[derive(Debug, Default)]
pub struct OpCounters {
    insert: AtomicU64,
    query: AtomicU64,
    update: AtomicU64,
    delete: AtomicU64,
    getmore: AtomicU64,
    command: AtomicU64,
}

/// Point-in-time copy of [`OpCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OpCountersSnapshot {
    /// Inserts.
    pub insert: u64,
    /// Queries.
    pub query: u64,
    /// Updates.
    pub update: u64,
    /// Deletes.
    pub delete: u64,
    /// Cursor continuations.
    pub getmore: u64,
    /// Commands.
    pub command: u64,
}

impl OpCounters {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts one operation.
    pub fn record(&self, kind: UsageKind) {
        let counter = match kind {
            UsageKind::Insert => &self.insert,
            UsageKind::Query => &self.query,
            UsageKind::Update => &self.update,
            UsageKind::Remove => &self.delete,
            UsageKind::GetMore => &self.getmore,
            UsageKind::Command => &self.command,
            UsageKind::Other => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the current counts.
    pub fn snapshot(&self) -> OpCountersSnapshot {
        OpCountersSnapshot {
            insert: self.insert.load(Ordering::Relaxed),
            query: self.query.load(Ordering::Relaxed),
            update: self.update.load(Ordering::Relaxed),
            delete: self.delete.load(Ordering::Relaxed),
            getmore: self.getmore.load(Ordering::Relaxed),
            command: self.command.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_updates_namespace_and_global() {
        let top = Top::new();
        top.record("app.users", UsageKind::Insert, LockKind::Write, 10);
        top.record("app.users", UsageKind::Query, LockKind::Read, 4);
        top.record("app.orders", UsageKind::Remove, LockKind::Write, 6);

        let usage = top.usage();
        let users = usage["app.users"];
        assert_eq!(users.total, UsageData { time_micros: 14, count: 2 });
        assert_eq!(users.insert.count, 1);
        assert_eq!(users.queries.count, 1);
        assert_eq!(users.write_lock.time_micros, 10);
        assert_eq!(users.read_lock.time_micros, 4);

        let global = top.global();
        assert_eq!(global.total.count, 3);
        assert_eq!(global.write_lock.time_micros, 16);
    }

    #[test]
    fn other_kind_only_counts_totals() {
        let top = Top::new();
        top.record("app.x", UsageKind::Other, LockKind::None, 3);
        let usage = top.global();
        assert_eq!(usage.total.count, 1);
        assert_eq!(usage, CollectionUsage { total: usage.total, ..Default::default() });
    }

    #[test]
    fn delta_between_snapshots() {
        let top = Top::new();
        top.record("app.a", UsageKind::Insert, LockKind::Write, 5);
        let older = top.snapshot();
        top.record("app.a", UsageKind::Insert, LockKind::Write, 7);
        top.record("app.b", UsageKind::Update, LockKind::Write, 1);
        let newer = top.snapshot();

        let delta = UsageDelta::between(&older, &newer);
        assert_eq!(delta.usage["app.a"].insert, UsageData { time_micros: 7, count: 1 });
        assert_eq!(delta.usage["app.b"].update.count, 1);
        assert_eq!(delta.global.total.count, 2);
        assert_eq!(delta.write_locked_micros, 8);
    }

    #[test]
    fn percent_write_locked() {
        let snapshot = |at, locked| UsageSnapshot {
            taken_at_micros: at,
            write_locked_micros: locked,
            global: CollectionUsage::default(),
            usage: UsageMap::new(),
        };
        let delta = UsageDelta::between(&snapshot(1_000, 100), &snapshot(3_000, 600));
        assert!((delta.percent_write_locked() - 0.25).abs() < f64::EPSILON);

        let empty = UsageDelta::between(&snapshot(5, 0), &snapshot(5, 0));
        assert_eq!(empty.percent_write_locked(), 0.0);
    }

    #[test]
    fn ring_is_bounded() {
        let top = Top::new();
        let ring = SnapshotRing::new(3);
        assert!(ring.compute_delta(0).is_none());

        for i in 0..5 {
            top.record("app.a", UsageKind::Insert, LockKind::Write, i);
            ring.add(top.snapshot());
        }
        assert_eq!(ring.num_deltas(), 2);
        assert_eq!(ring.get_prev(0).unwrap().global.total.count, 5);
        assert_eq!(ring.get_prev(2).unwrap().global.total.count, 3);
        assert!(ring.get_prev(3).is_none());

        let delta = ring.compute_delta(1).unwrap();
        assert_eq!(delta.global.total.count, 1);
        assert!(ring.compute_delta(2).is_none());
    }

    #[test]
    fn op_counters() {
        let counters = OpCounters::new();
        counters.record(UsageKind::Insert);
        counters.record(UsageKind::Insert);
        counters.record(UsageKind::Remove);
        counters.record(UsageKind::Other);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.insert, 2);
        assert_eq!(snapshot.delete, 1);
        assert_eq!(snapshot.query, 0);
    }

    #[test]
    fn usage_serializes_like_top() {
        let top = Top::new();
        top.record("app.a", UsageKind::Insert, LockKind::Write, 2);
        let json = serde_json::to_value(top.usage()).unwrap();
        assert_eq!(json["app.a"]["writeLock"]["time"], 2);
        assert_eq!(json["app.a"]["insert"]["count"], 1);
    }
}
