//! Startup measurement of the pin-write cost.

use crate::critical::{CriticalSection, PreemptionControl};
use pps_common::{PpsResult, WallClock};
use pps_gpio::{OutputPin, PinLevel};
use tracing::info;

/// Number of timed writes averaged at startup.
pub const CALIBRATION_LOOPS: i64 = 100;

/// Measure how long driving the line low takes.
///
/// Each of the [`CALIBRATION_LOOPS`] samples brackets a single write with
/// two clock reads inside its own critical section. The result is the
/// truncated mean and seeds the pin-write estimate before any pulse has
/// been produced.
///
/// # Errors
///
/// Returns the pin's error if any write fails.
pub fn calibrate_pin_write<P, C, M>(pin: &mut P, clock: &C, control: &M) -> PpsResult<i64>
where
    P: OutputPin + ?Sized,
    C: WallClock + ?Sized,
    M: PreemptionControl,
{
    let mut total_ns = 0i64;

    for _ in 0..CALIBRATION_LOOPS {
        let cs = CriticalSection::enter(control);
        let before = clock.now();
        pin.set_level(PinLevel::Low)?;
        let after = clock.now();
        cs.exit();

        total_ns += after.nanos_since(before);
    }

    let pin_write_ns = total_ns / CALIBRATION_LOOPS;
    info!(pin = %pin.label(), pin_write_ns, "PPS line write calibrated");
    Ok(pin_write_ns)
}
