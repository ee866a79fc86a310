//! Tailing positions and log read results.

use crate::operation::OperationEntry;
use crate::optime::OpTime;
use serde::{Deserialize, Serialize};

/// An opaque position in the operation log.
///
/// A cursor is a comparison key only: reading from a cursor returns the
/// entries strictly after its op time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogCursor {
    /// Op time of the last entry the reader has consumed.
    pub op_time: OpTime,
}

impl LogCursor {
    /// A cursor before every entry.
    pub fn start() -> Self {
        Self { op_time: OpTime::ZERO }
    }

    /// A cursor positioned at `op_time`.
    pub fn at(op_time: OpTime) -> Self {
        Self { op_time }
    }
}

/// Retention window of an operation log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailInfo {
    /// Oldest position a reader may resume from.
    ///
    /// Zero until the log evicts for the first time.
    pub oldest_retained: OpTime,
    /// Op time of the newest entry, zero for an empty log.
    pub latest: OpTime,
}

impl TailInfo {
    /// Returns true if a reader at `cursor` can resume without a gap.
    pub fn covers(&self, cursor: LogCursor) -> bool {
        cursor.op_time >= self.oldest_retained && cursor.op_time <= self.latest
    }
}

/// Result of reading the log from a cursor.
///
/// A gap is a first-class outcome, not an error: it tells the reader its
/// starting point has been evicted and a resync is required.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum LogRead {
    /// Entries after the cursor, in op time order.
    Entries {
        /// The entries read.
        entries: Vec<OperationEntry>,
        /// Cursor to resume from.
        new_cursor: LogCursor,
        /// Whether more entries remain past `new_cursor`.
        has_more: bool,
    },
    /// The requested cursor is no longer covered by the log.
    Gap {
        /// The cursor that was requested.
        requested: LogCursor,
        /// The log's oldest retained position at the time of the read.
        oldest_retained: OpTime,
    },
}

impl LogRead {
    /// Returns true if this read reported a gap.
    pub fn is_gap(&self) -> bool {
        matches!(self, LogRead::Gap { .. })
    }
}
