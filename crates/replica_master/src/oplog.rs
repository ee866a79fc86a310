//! Bounded operation log.
//!
//! The log is an ordered append-only sequence of [`OperationEntry`] values
//! with an eviction watermark. When the encoded size of the retained
//! entries exceeds the configured capacity, entries are dropped from the
//! front and [`TailInfo::oldest_retained`] moves forward. A reader whose
//! cursor lies before the watermark gets [`LogRead::Gap`] and must resync.

use crate::error::MasterResult;
use replica_protocol::{
    LogCursor, LogRead, NewOperation, OpTime, OpTimeClock, OperationEntry, TailInfo,
};
use std::collections::VecDeque;

#[derive(Debug, Clone)]
struct Retained {
    entry: OperationEntry,
    size: usize,
}

/// Master-side operation log with bounded byte capacity.
///
/// The log is not internally synchronized; the owner serializes access
/// (see [`crate::MasterNode`]).
///
/// # Invariants
///
/// - op times are unique and strictly increasing
/// - `oldest_retained` never decreases
/// - `used_bytes <= capacity` whenever more than one entry is retained
/// - the newest entry is never evicted
#[derive(Debug)]
pub struct OperationLog {
    capacity: usize,
    entries: VecDeque<Retained>,
    used: usize,
    oldest_retained: OpTime,
    clock: OpTimeClock,
    evicted: u64,
}

impl OperationLog {
    /// Creates an empty log holding at most `capacity` encoded bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: VecDeque::new(),
            used: 0,
            oldest_retained: OpTime::ZERO,
            clock: OpTimeClock::new(),
            evicted: 0,
        }
    }

    /// Appends an operation stamped with the next op time from the
    /// system clock.
    ///
    /// # Errors
    ///
    /// Fails only if the entry cannot be encoded for size accounting.
    pub fn append(&mut self, op: NewOperation) -> MasterResult<OpTime> {
        let op_time = self.clock.next_now();
        self.push(op.at(op_time))
    }

    /// Appends an operation using `now_secs` as the wall-clock second.
    ///
    /// The issued op time is still strictly greater than every earlier one.
    pub fn append_at(&mut self, op: NewOperation, now_secs: u32) -> MasterResult<OpTime> {
        let op_time = self.clock.next(now_secs);
        self.push(op.at(op_time))
    }

    /// Stamps an operation, hands the entry to `apply`, and logs it only
    /// if `apply` succeeds.
    pub fn append_with<F>(&mut self, op: NewOperation, apply: F) -> MasterResult<OpTime>
    where
        F: FnOnce(&OperationEntry) -> MasterResult<()>,
    {
        let entry = op.at(self.clock.next_now());
        apply(&entry)?;
        self.push(entry)
    }

    fn push(&mut self, entry: OperationEntry) -> MasterResult<OpTime> {
        let size = entry.encoded_len()?;
        let op_time = entry.op_time;
        self.entries.push_back(Retained { entry, size });
        self.used += size;
        self.evict();
        Ok(op_time)
    }

    /// Drops entries from the front until the log fits its capacity.
    ///
    /// Each entry is evicted at most once, so appends are amortized O(1).
    fn evict(&mut self) {
        let mut evicted_now = 0u64;
        while self.used > self.capacity && self.entries.len() > 1 {
            if let Some(old) = self.entries.pop_front() {
                self.used -= old.size;
                evicted_now += 1;
            }
        }
        if evicted_now > 0 {
            if let Some(front) = self.entries.front() {
                self.oldest_retained = front.entry.op_time;
            }
            self.evicted += evicted_now;
            tracing::trace!(
                evicted = evicted_now,
                oldest_retained = %self.oldest_retained,
                used = self.used,
                "evicted log entries"
            );
        }
    }

    /// Returns every entry after `cursor`, or a gap.
    pub fn read_from(&self, cursor: LogCursor) -> LogRead {
        self.read_from_limited(cursor, usize::MAX)
    }

    /// Returns at most `limit` entries after `cursor`, or a gap.
    ///
    /// A cursor older than the oldest retained entry, or newer than the
    /// latest entry (a history this log never produced), is a gap.
    pub fn read_from_limited(&self, cursor: LogCursor, limit: usize) -> LogRead {
        if cursor.op_time < self.oldest_retained || cursor.op_time > self.latest() {
            return LogRead::Gap {
                requested: cursor,
                oldest_retained: self.oldest_retained,
            };
        }

        let start = self
            .entries
            .partition_point(|r| r.entry.op_time <= cursor.op_time);
        let end = start.saturating_add(limit).min(self.entries.len());
        let entries: Vec<OperationEntry> = self
            .entries
            .range(start..end)
            .map(|r| r.entry.clone())
            .collect();
        let new_cursor = entries
            .last()
            .map(|e| LogCursor::at(e.op_time))
            .unwrap_or(cursor);

        LogRead::Entries {
            entries,
            new_cursor,
            has_more: end < self.entries.len(),
        }
    }

    /// Returns the retention window.
    pub fn tail_info(&self) -> TailInfo {
        TailInfo {
            oldest_retained: self.oldest_retained,
            latest: self.latest(),
        }
    }

    /// Returns the op time of the newest entry, or zero if empty.
    pub fn latest(&self) -> OpTime {
        self.entries
            .back()
            .map(|r| r.entry.op_time)
            .unwrap_or(OpTime::ZERO)
    }

    /// Returns the oldest retained position.
    pub fn oldest_retained(&self) -> OpTime {
        self.oldest_retained
    }

    /// Returns the configured capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the encoded size of retained entries.
    pub fn used_bytes(&self) -> usize {
        self.used
    }

    /// Returns the number of retained entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the number of entries evicted so far.
    pub fn evicted_count(&self) -> u64 {
        self.evicted
    }
}
