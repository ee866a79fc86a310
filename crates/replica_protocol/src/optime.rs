//! Logical operation timestamps.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// A logical timestamp that totally orders operation log entries.
///
/// An `OpTime` is a wall-clock second plus an increment that
/// disambiguates operations within the same second. Ordering is
/// lexicographic on `(secs, inc)`.
///
/// [`OpTime::ZERO`] is the null time: a slave whose last-applied time is
/// zero has never synced.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct OpTime {
    secs: u32,
    inc: u32,
}

impl OpTime {
    /// The null op time.
    pub const ZERO: OpTime = OpTime { secs: 0, inc: 0 };

    /// Creates an op time from its parts.
    pub const fn new(secs: u32, inc: u32) -> Self {
        Self { secs, inc }
    }

    /// Returns the seconds component.
    pub fn secs(&self) -> u32 {
        self.secs
    }

    /// Returns the increment component.
    pub fn inc(&self) -> u32 {
        self.inc
    }

    /// Returns true if this is the null op time.
    pub fn is_null(&self) -> bool {
        *self == Self::ZERO
    }
}

impl fmt::Display for OpTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.secs, self.inc)
    }
}

/// Generates strictly increasing op times.
///
/// Within a second, or when the wall clock moves backwards, the increment
/// is bumped instead of the seconds.
#[derive(Debug, Clone, Default)]
pub struct OpTimeClock {
    last: OpTime,
}

impl OpTimeClock {
    /// Creates a clock that has issued nothing yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the last issued op time.
    pub fn last(&self) -> OpTime {
        self.last
    }

    /// Issues the next op time given the current wall-clock second.
    pub fn next(&mut self, now_secs: u32) -> OpTime {
        let next = if now_secs > self.last.secs {
            OpTime::new(now_secs, 1)
        } else if self.last.inc == u32::MAX {
            OpTime::new(self.last.secs.saturating_add(1), 1)
        } else {
            OpTime::new(self.last.secs, self.last.inc + 1)
        };
        self.last = next;
        next
    }

    /// Issues the next op time using the system clock.
    pub fn next_now(&mut self) -> OpTime {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as u32)
            .unwrap_or(0);
        self.next(now)
    }
}
