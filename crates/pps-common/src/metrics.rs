//! Pulse statistics shared between the pulse loop and diagnostics.
//!
//! The pulse loop is the only writer. All updates are single relaxed
//! atomic stores or increments so recording never blocks the loop.

use crate::time::WallTime;
use serde::Serialize;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// Live counters for one output channel.
#[derive(Debug, Default)]
pub struct PulseStats {
    pulses: AtomicU64,
    missed: AtomicU64,
    rescheduled: AtomicU64,
    faults: AtomicU64,
    last_latency_ns: AtomicI64,
    last_pin_write_ns: AtomicI64,
    next_deadline_ns: AtomicI64,
}

impl PulseStats {
    /// Create zeroed statistics.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an emitted pulse and the pin-write cost measured with it.
    pub fn record_pulse(&self, pin_write_ns: i64) {
        self.pulses.fetch_add(1, Ordering::Relaxed);
        self.last_pin_write_ns.store(pin_write_ns, Ordering::Relaxed);
    }

    /// Record a cycle skipped because the wake-up came too late.
    pub fn record_missed(&self) {
        self.missed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a cycle deferred because the clock jumped forward.
    pub fn record_rescheduled(&self) {
        self.rescheduled.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a pin write failure during a pulse.
    pub fn record_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the dispatch latency observed on a wake-up.
    pub fn record_latency(&self, latency_ns: i64) {
        self.last_latency_ns.store(latency_ns, Ordering::Relaxed);
    }

    /// Record the deadline the timer was re-armed with.
    pub fn record_deadline(&self, deadline: WallTime) {
        self.next_deadline_ns.store(deadline.as_nanos(), Ordering::Relaxed);
    }

    /// Pulses emitted so far.
    #[must_use]
    pub fn pulses(&self) -> u64 {
        self.pulses.load(Ordering::Relaxed)
    }

    /// Cycles skipped after a late wake-up.
    #[must_use]
    pub fn missed(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// Cycles deferred after a forward clock jump.
    #[must_use]
    pub fn rescheduled(&self) -> u64 {
        self.rescheduled.load(Ordering::Relaxed)
    }

    /// Consistent-enough copy of all counters for reporting.
    #[must_use]
    pub fn snapshot(&self) -> PulseStatsSnapshot {
        PulseStatsSnapshot {
            pulses: self.pulses(),
            missed: self.missed(),
            rescheduled: self.rescheduled(),
            faults: self.faults.load(Ordering::Relaxed),
            last_latency_ns: self.last_latency_ns.load(Ordering::Relaxed),
            last_pin_write_ns: self.last_pin_write_ns.load(Ordering::Relaxed),
            next_deadline: WallTime::from_nanos(self.next_deadline_ns.load(Ordering::Relaxed)),
        }
    }
}

/// Point-in-time copy of [`PulseStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PulseStatsSnapshot {
    /// Pulses emitted.
    pub pulses: u64,
    /// Cycles skipped after a late wake-up.
    pub missed: u64,
    /// Cycles deferred after a forward clock jump.
    pub rescheduled: u64,
    /// Pin write failures.
    pub faults: u64,
    /// Most recent dispatch latency in nanoseconds.
    pub last_latency_ns: i64,
    /// Most recent measured pin-write duration in nanoseconds.
    pub last_pin_write_ns: i64,
    /// Deadline the timer is currently armed for.
    pub next_deadline: WallTime,
}

impl PulseStatsSnapshot {
    /// Cycles the loop has completed, whatever their outcome.
    #[must_use]
    pub fn cycles(&self) -> u64 {
        self.pulses + self.missed + self.rescheduled + self.faults
    }
}
