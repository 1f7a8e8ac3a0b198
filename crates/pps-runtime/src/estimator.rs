//! Smoothed estimates feeding the wake-up margin.
//!
//! Two quantities are tracked, both as signed nanoseconds with truncating
//! integer division:
//!
//! - the cost of one pin write, a stable low-variance value, smoothed as a
//!   plain running average of the previous estimate and the new sample;
//! - the timer dispatch latency, which jumps straight to any higher sample
//!   and decays toward lower ones at a quarter step per cycle.
//!
//! Underestimating dispatch latency means waking too late and dropping the
//! pulse; overestimating only spends a little more time spinning.

use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Largest pin-write sample folded into the estimate.
///
/// A wall-clock step between the two reads bracketing the falling edge
/// would otherwise push the edge offsets out of the second for good, since
/// the estimate is only refreshed by pulses that are produced.
pub const MAX_PIN_WRITE_SAMPLE_NS: i64 = 100_000_000;

/// Next pin-write estimate: `(old + sample) / 2`.
#[inline]
#[must_use]
pub const fn smooth_pin_write(old_ns: i64, sample_ns: i64) -> i64 {
    (old_ns + sample_ns) / 2
}

/// Next dispatch-latency estimate: jump up immediately, decay down slowly.
#[inline]
#[must_use]
pub const fn smooth_dispatch_latency(old_ns: i64, sample_ns: i64) -> i64 {
    if sample_ns > old_ns {
        sample_ns
    } else {
        (3 * old_ns + sample_ns) / 4
    }
}

/// Per-channel estimate of how long one pin write takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PinWriteEstimate {
    ns: i64,
}

impl PinWriteEstimate {
    /// Start from a calibrated value, clamped like any other sample.
    #[must_use]
    pub const fn new(initial_ns: i64) -> Self {
        Self {
            ns: clamp_sample(initial_ns),
        }
    }

    /// Current estimate in nanoseconds.
    #[inline]
    #[must_use]
    pub const fn get(&self) -> i64 {
        self.ns
    }

    /// Fold in a measured write duration and return the new estimate.
    #[inline]
    pub fn update(&mut self, sample_ns: i64) -> i64 {
        self.ns = smooth_pin_write(self.ns, clamp_sample(sample_ns));
        self.ns
    }
}

const fn clamp_sample(sample_ns: i64) -> i64 {
    if sample_ns < 0 {
        0
    } else if sample_ns > MAX_PIN_WRITE_SAMPLE_NS {
        MAX_PIN_WRITE_SAMPLE_NS
    } else {
        sample_ns
    }
}

/// Process-wide estimate of timer dispatch latency.
///
/// One handle is created per process and cloned into every channel's
/// pulse loop. Only the pulse loop writes it, from its single timer
/// thread; other holders read it for reporting.
#[derive(Debug, Clone)]
pub struct DispatchLatency {
    ns: Arc<CachePadded<AtomicI64>>,
}

impl DispatchLatency {
    /// Start from `initial_ns`.
    #[must_use]
    pub fn new(initial_ns: i64) -> Self {
        Self {
            ns: Arc::new(CachePadded::new(AtomicI64::new(initial_ns))),
        }
    }

    /// Current estimate in nanoseconds.
    #[inline]
    #[must_use]
    pub fn get(&self) -> i64 {
        self.ns.load(Ordering::Acquire)
    }

    /// Fold in an observed latency and return the new estimate.
    ///
    /// Negative samples (the wall clock stepped back between arming and
    /// firing) are treated as zero.
    #[inline]
    pub fn update(&self, sample_ns: i64) -> i64 {
        let next = smooth_dispatch_latency(self.get(), sample_ns.max(0));
        self.ns.store(next, Ordering::Release);
        next
    }
}

impl Default for DispatchLatency {
    fn default() -> Self {
        Self::new(crate::SAFETY_MARGIN_NS)
    }
}
