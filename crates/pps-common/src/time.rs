//! Wall-clock time representation and clock sources.
//!
//! [`WallTime`] mirrors a `timespec`: whole seconds plus a nanosecond part
//! that is always kept in `[0, NSEC_PER_SEC)`. Constructing one from an
//! out-of-range nanosecond part carries into the seconds field, which is
//! how absolute deadlines such as `(sec + 1, offset - latency)` are built.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Nanoseconds in one second.
pub const NSEC_PER_SEC: i64 = 1_000_000_000;

/// A point on the wall clock with nanosecond resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct WallTime {
    sec: i64,
    nsec: i64,
}

impl WallTime {
    /// The clock epoch.
    pub const ZERO: WallTime = WallTime { sec: 0, nsec: 0 };

    /// Build a normalized time from seconds and a possibly out-of-range nanosecond part.
    #[must_use]
    pub const fn new(sec: i64, nsec: i64) -> Self {
        Self {
            sec: sec + nsec.div_euclid(NSEC_PER_SEC),
            nsec: nsec.rem_euclid(NSEC_PER_SEC),
        }
    }

    /// Build a time from nanoseconds since the epoch.
    #[must_use]
    pub const fn from_nanos(nanos: i64) -> Self {
        Self::new(0, nanos)
    }

    /// Whole seconds.
    #[inline]
    #[must_use]
    pub const fn sec(&self) -> i64 {
        self.sec
    }

    /// Nanoseconds into the current second, in `[0, NSEC_PER_SEC)`.
    #[inline]
    #[must_use]
    pub const fn nsec(&self) -> i64 {
        self.nsec
    }

    /// Total nanoseconds since the epoch.
    #[inline]
    #[must_use]
    pub const fn as_nanos(&self) -> i64 {
        self.sec * NSEC_PER_SEC + self.nsec
    }

    /// Signed nanoseconds elapsed from `earlier` to `self`.
    #[inline]
    #[must_use]
    pub const fn nanos_since(&self, earlier: WallTime) -> i64 {
        (self.sec - earlier.sec) * NSEC_PER_SEC + (self.nsec - earlier.nsec)
    }

    /// This time shifted by a signed number of nanoseconds.
    #[must_use]
    pub const fn add_nanos(&self, nanos: i64) -> Self {
        Self::new(self.sec, self.nsec + nanos)
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Source of wall-clock time.
///
/// Implementations must be cheap to read: the pulse loop spins on `now()`
/// while preemption is blocked.
pub trait WallClock: Send {
    /// Current wall-clock time.
    fn now(&self) -> WallTime;
}

/// Deterministic clock for tests and simulation.
///
/// Every read returns the current value and then advances it by
/// `step_ns`, so busy-wait loops driven by this clock always terminate.
/// Clones share the same underlying time.
#[derive(Debug, Clone)]
pub struct SimulatedClock {
    now_ns: Arc<AtomicI64>,
    step_ns: i64,
}

impl SimulatedClock {
    /// Create a clock starting at `start` that advances `step_ns` per read.
    pub fn new(start: WallTime, step_ns: i64) -> Self {
        Self {
            now_ns: Arc::new(AtomicI64::new(start.as_nanos())),
            step_ns,
        }
    }

    /// Move the clock forward (or backward, for negative values).
    pub fn advance(&self, nanos: i64) {
        self.now_ns.fetch_add(nanos, Ordering::AcqRel);
    }

    /// Jump the clock to an absolute time.
    pub fn set(&self, time: WallTime) {
        self.now_ns.store(time.as_nanos(), Ordering::Release);
    }

    /// Current time without advancing the clock.
    pub fn peek(&self) -> WallTime {
        WallTime::from_nanos(self.now_ns.load(Ordering::Acquire))
    }
}

impl WallClock for SimulatedClock {
    fn now(&self) -> WallTime {
        WallTime::from_nanos(self.now_ns.fetch_add(self.step_ns, Ordering::AcqRel))
    }
}
