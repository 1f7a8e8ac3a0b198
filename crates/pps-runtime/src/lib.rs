#![doc = "Self-calibrating pulse-per-second loop: estimators, edge actuation, cycle scheduling, and deadline timers."]

pub mod actuation;
pub mod calibration;
pub mod clock;
pub mod critical;
pub mod cycle;
pub mod estimator;
pub mod generator;
pub mod realtime;
pub mod timer;

pub use actuation::*;
pub use calibration::*;
pub use clock::*;
pub use critical::*;
pub use cycle::*;
pub use estimator::*;
pub use generator::*;
pub use realtime::*;
pub use timer::*;

use pps_common::{MAX_PULSE_WIDTH_NS, NSEC_PER_SEC};
use static_assertions::const_assert;

/// Slack kept between a wake-up and the rising edge, on top of the
/// estimated dispatch latency. Also the initial latency estimate.
pub const SAFETY_MARGIN_NS: i64 = 10_000;

// The widest pulse plus the first-deadline margins must fit in one second.
const_assert!((MAX_PULSE_WIDTH_NS as i64) + 3 * SAFETY_MARGIN_NS < NSEC_PER_SEC);
