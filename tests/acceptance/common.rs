//! Shared harness for whole-loop tests on simulated hardware.
//!
//! The rig wires a [`PpsGenerator`] to a simulated clock, a simulated pin
//! whose writes cost a fixed time on that clock, and a manually fired
//! timer. Each test drives the loop by placing the clock where the timer
//! "woke up" and firing it.

#![allow(dead_code)] // Not every test uses every helper

use pps_common::{PulseStatsSnapshot, PulseWidth, SimulatedClock, WallTime, NSEC_PER_SEC};
use pps_gpio::{Edge, PinLevel, SimulatedPin};
use pps_runtime::{DispatchLatency, ManualTimer, NoPreemption, PpsGenerator, PulseCycle};

pub type SimCycle = PulseCycle<SimulatedPin, SimulatedClock, NoPreemption>;
pub type SimGenerator = PpsGenerator<SimulatedPin, SimulatedClock, NoPreemption, ManualTimer<SimCycle>>;

/// Cost of one simulated pin write.
pub const WRITE_COST_NS: i64 = 300;
/// Simulated clock advance per read.
pub const CLOCK_STEP_NS: i64 = 10;
/// Calibrated pin-write cost: one clock read plus the write.
pub const CALIBRATED_NS: i64 = WRITE_COST_NS + CLOCK_STEP_NS;

pub const START: WallTime = WallTime::new(1_700_000_000, 200_000_000);

pub struct SimRig {
    pub clock: SimulatedClock,
    pub pin: SimulatedPin,
    pub timer: ManualTimer<SimCycle>,
    pub latency: DispatchLatency,
    pub width_ns: i64,
    pub generator: SimGenerator,
}

impl SimRig {
    /// Attach a generator with the given pulse width at [`START`].
    pub fn attach(width_ns: u64) -> Self {
        let clock = SimulatedClock::new(START, CLOCK_STEP_NS);
        let pin = SimulatedPin::with_write_cost(clock.clone(), WRITE_COST_NS);
        let timer = ManualTimer::new();
        let latency = DispatchLatency::default();

        let generator = PpsGenerator::attach(
            pin.clone(),
            clock.clone(),
            NoPreemption,
            timer.clone(),
            PulseWidth::from_nanos(width_ns).expect("valid width"),
            latency.clone(),
        )
        .expect("attach");

        Self {
            clock,
            pin,
            timer,
            latency,
            width_ns: width_ns as i64,
            generator,
        }
    }

    /// Deadline the timer is armed for.
    pub fn deadline(&self) -> WallTime {
        self.timer.deadline().expect("timer armed")
    }

    /// Fire the timer as if it woke at `observed`.
    pub fn fire_at(&self, observed: WallTime) -> Option<WallTime> {
        self.clock.set(observed);
        self.timer.fire()
    }

    /// Fire the timer `latency_ns` after its deadline.
    pub fn fire_late_by(&self, latency_ns: i64) -> Option<WallTime> {
        self.fire_at(self.deadline().add_nanos(latency_ns))
    }

    pub fn stats(&self) -> PulseStatsSnapshot {
        self.generator.stats().snapshot()
    }

    /// Rising/falling edge pairs written after calibration.
    pub fn pulses(&self) -> Vec<(Edge, Edge)> {
        let edges = self.pin.edges();
        let first_high = edges
            .iter()
            .position(|e| e.level == PinLevel::High)
            .unwrap_or(edges.len());
        edges[first_high..]
            .chunks(2)
            .filter(|pair| pair.len() == 2)
            .map(|pair| (pair[0], pair[1]))
            .collect()
    }
}

/// Check one pulse lands where it should within `second`.
pub fn assert_pulse_on_time(rise: &Edge, fall: &Edge, second: i64, width_ns: i64) {
    assert_eq!(rise.level, PinLevel::High);
    assert_eq!(fall.level, PinLevel::Low);

    let rise_at = rise.at.expect("timestamped");
    let fall_at = fall.at.expect("timestamped");
    assert_eq!(rise_at.sec(), second, "rising edge in wrong second");
    assert_eq!(fall_at.sec(), second, "falling edge issued in wrong second");

    let width = fall_at.nanos_since(rise_at);
    assert!(
        (width - width_ns).abs() <= CLOCK_STEP_NS,
        "pulse width {width}ns, expected {width_ns}ns"
    );

    // The falling edge takes effect one write later, on the second boundary.
    let boundary = WallTime::new(second + 1, 0);
    let effective = fall_at.add_nanos(WRITE_COST_NS);
    let error = effective.nanos_since(boundary);
    assert!(
        (0..=CLOCK_STEP_NS).contains(&error),
        "falling edge {error}ns off the boundary"
    );
    assert!(fall_at.nsec() < NSEC_PER_SEC);
}
