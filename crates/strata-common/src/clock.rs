//! Hybrid logical clock
//!
//! Transaction ids are HLC timestamps: wall-clock milliseconds paired with a
//! logical counter so that one clock instance never hands out the same or a
//! smaller value twice, even if the system clock stalls or steps backwards.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// HLC timestamp, ordered by logical time then counter
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct HlcTimestamp {
    /// Physical component, milliseconds since the Unix epoch
    pub logical_time: i64,
    /// Tie-breaker within one millisecond
    pub counter: u32,
}

impl HlcTimestamp {
    /// Create a timestamp from its parts
    #[must_use]
    pub const fn new(logical_time: i64, counter: u32) -> Self {
        Self {
            logical_time,
            counter,
        }
    }

    /// Total order over timestamps
    #[must_use]
    pub fn compare(&self, other: &Self) -> Ordering {
        self.cmp(other)
    }
}

impl fmt::Display for HlcTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.logical_time, self.counter)
    }
}

fn wall_clock_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Hybrid logical clock, monotonic per instance
pub struct HlcClock {
    last: Mutex<HlcTimestamp>,
    source: fn() -> i64,
}

impl HlcClock {
    /// Clock backed by the system wall clock
    #[must_use]
    pub fn new() -> Self {
        Self::with_source(wall_clock_millis)
    }

    /// Clock backed by a custom physical time source
    #[must_use]
    pub fn with_source(source: fn() -> i64) -> Self {
        Self {
            last: Mutex::new(HlcTimestamp::default()),
            source,
        }
    }

    /// Issue the next timestamp
    ///
    /// The counter resets to zero when physical time moves past the last
    /// issued logical time, otherwise it increments.
    pub fn now(&self) -> HlcTimestamp {
        let physical = (self.source)();
        let mut last = self.last.lock();
        let next = if physical > last.logical_time {
            HlcTimestamp::new(physical, 0)
        } else {
            HlcTimestamp::new(last.logical_time, last.counter + 1)
        };
        *last = next;
        next
    }

    /// Merge a timestamp observed from elsewhere and issue a later one
    pub fn update(&self, observed: HlcTimestamp) -> HlcTimestamp {
        let physical = (self.source)();
        let mut last = self.last.lock();
        let base = (*last).max(observed);
        let next = if physical > base.logical_time {
            HlcTimestamp::new(physical, 0)
        } else {
            HlcTimestamp::new(base.logical_time, base.counter + 1)
        };
        *last = next;
        next
    }

    /// Last timestamp issued by this clock
    pub fn last(&self) -> HlcTimestamp {
        *self.last.lock()
    }
}

impl Default for HlcClock {
    fn default() -> Self {
        Self::new()
    }
}
