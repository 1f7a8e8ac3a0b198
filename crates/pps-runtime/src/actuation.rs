//! Edge actuation: spin to each target offset and drive the line.

use crate::critical::{CriticalSection, PreemptionControl};
use pps_common::{PpsResult, PulseWidth, WallClock, WallTime, NSEC_PER_SEC};
use pps_gpio::{OutputPin, PinLevel};

/// Where in a given second the edges of one pulse should land.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTarget {
    /// Wall-clock second the pulse belongs to.
    pub target_second: i64,
    /// Offset of the rising edge into that second.
    pub assert_offset_ns: i64,
    /// Offset of the falling edge into that second.
    pub deassert_offset_ns: i64,
}

impl CycleTarget {
    /// Offsets for a pulse ending one pin write before the next second.
    ///
    /// The falling-edge write is issued `pin_write_ns` early so it takes
    /// effect at the boundary; the rising edge precedes it by the pulse width.
    /// The falling edge stays at least 1ns inside the second, so a coarse
    /// clock that calibrates a write as free still pulses.
    #[must_use]
    pub const fn new(target_second: i64, pin_write_ns: i64, width: PulseWidth) -> Self {
        let lead_ns = if pin_write_ns < 1 { 1 } else { pin_write_ns };
        let deassert_offset_ns = NSEC_PER_SEC - lead_ns;
        Self {
            target_second,
            assert_offset_ns: deassert_offset_ns - width.as_nanos(),
            deassert_offset_ns,
        }
    }

    /// `0 < assert < deassert < NSEC_PER_SEC`.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        0 < self.assert_offset_ns
            && self.assert_offset_ns < self.deassert_offset_ns
            && self.deassert_offset_ns < NSEC_PER_SEC
    }

    /// The same offsets one second later.
    #[must_use]
    pub const fn next_second(&self) -> Self {
        Self {
            target_second: self.target_second + 1,
            ..*self
        }
    }

    /// Timer deadline leaving `margin_ns` of slack before the rising edge.
    ///
    /// Never earlier than the start of the target second, so the wake-up
    /// always observes the second it is meant to pulse in.
    #[must_use]
    pub const fn wake_deadline(&self, margin_ns: i64) -> WallTime {
        let offset = self.assert_offset_ns - margin_ns;
        WallTime::new(self.target_second, if offset > 0 { offset } else { 0 })
    }
}

/// Timestamps captured while producing one pulse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeTiming {
    /// Last clock reading before the rising-edge write.
    pub rising: WallTime,
    /// Last clock reading before the falling-edge write.
    pub falling: WallTime,
    /// Measured cost of the falling-edge write.
    pub pin_write_ns: i64,
}

/// Spin until `target`'s rising edge, assert, spin until its falling edge, deassert.
///
/// Must run inside a critical section, which the `_cs` argument proves.
/// Each spin also ends if the clock leaves the target second, so a pulse
/// can be cut short but never extended into the next second. If the
/// rising-edge write fails a deassert is still attempted, and its error
/// takes precedence since the line may then be stuck high.
///
/// # Errors
///
/// Returns the pin's error if either write fails.
pub fn actuate_edges<P, C, M>(
    _cs: &CriticalSection<'_, M>,
    pin: &mut P,
    clock: &C,
    target: &CycleTarget,
) -> PpsResult<EdgeTiming>
where
    P: OutputPin + ?Sized,
    C: WallClock + ?Sized,
    M: PreemptionControl,
{
    let rising = spin_until(clock, target.target_second, target.assert_offset_ns);
    if let Err(e) = pin.set_level(PinLevel::High) {
        // A failed deassert here may leave the line high; report that first.
        pin.set_level(PinLevel::Low)?;
        return Err(e);
    }

    let falling = spin_until(clock, target.target_second, target.deassert_offset_ns);
    if let Err(e) = pin.set_level(PinLevel::Low) {
        // One retry: a line left high is worse than a late edge.
        pin.set_level(PinLevel::Low).map_err(|_| e)?;
    }
    let done = clock.now();

    Ok(EdgeTiming {
        rising,
        falling,
        pin_write_ns: done.nanos_since(falling),
    })
}

#[inline(always)]
fn spin_until<C: WallClock + ?Sized>(clock: &C, second: i64, offset_ns: i64) -> WallTime {
    loop {
        let now = clock.now();
        if now.sec() != second || now.nsec() >= offset_ns {
            return now;
        }
        std::hint::spin_loop();
    }
}
