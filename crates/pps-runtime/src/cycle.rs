//! The per-second pulse callback.
//!
//! Each timer expiry runs one cycle:
//! 1. Check lateness with preemption blocked
//! 2. Produce the pulse, or skip it
//! 3. Feed the observed dispatch latency back
//! 4. Return the deadline for the next second
//!
//! Every branch ends by producing a next deadline, so the timer is always
//! left armed and all outcomes are symmetric.

use crate::actuation::{actuate_edges, CycleTarget, EdgeTiming};
use crate::critical::{CriticalSection, PreemptionControl};
use crate::estimator::{DispatchLatency, PinWriteEstimate};
use crate::timer::{ExpiryHandler, TimerAction};
use crate::SAFETY_MARGIN_NS;
use pps_common::{PpsError, PulseStats, PulseWidth, WallClock, WallTime};
use pps_gpio::OutputPin;
use std::sync::Arc;
use tracing::{trace, warn};

/// What happened on one timer expiry.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// Pulse produced on time.
    OnTime(EdgeTiming),
    /// Woke too late for this second; pulse skipped.
    Missed {
        /// Deadline the timer was armed for.
        requested: WallTime,
        /// Clock reading on wake-up.
        observed: WallTime,
    },
    /// Wall clock is already past the requested second; pulse deferred.
    Rescheduled {
        /// Deadline the timer was armed for.
        requested: WallTime,
        /// Clock reading on wake-up.
        observed: WallTime,
    },
    /// A pin write failed mid-pulse; pulse dropped.
    Faulted(PpsError),
}

/// Result of one cycle, including the deadline to re-arm with.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    /// Edge offsets used for this cycle.
    pub target: CycleTarget,
    /// Outcome of this cycle.
    pub outcome: CycleOutcome,
    /// Dispatch latency fed to the estimator, if any.
    pub observed_latency_ns: Option<i64>,
    /// Absolute deadline for the next wake-up.
    pub next_deadline: WallTime,
}

/// Channel state driven by the timer: pin, clock, and both estimators.
pub struct PulseCycle<P, C, M> {
    pin: P,
    clock: C,
    control: M,
    width: PulseWidth,
    pin_write: PinWriteEstimate,
    latency: DispatchLatency,
    stats: Arc<PulseStats>,
}

impl<P, C, M> PulseCycle<P, C, M>
where
    P: OutputPin,
    C: WallClock,
    M: PreemptionControl,
{
    /// Assemble the cycle state from a calibrated pin-write cost.
    pub fn new(
        pin: P,
        clock: C,
        control: M,
        width: PulseWidth,
        pin_write_ns: i64,
        latency: DispatchLatency,
        stats: Arc<PulseStats>,
    ) -> Self {
        Self {
            pin,
            clock,
            control,
            width,
            pin_write: PinWriteEstimate::new(pin_write_ns),
            latency,
            stats,
        }
    }

    /// Current pin-write estimate in nanoseconds.
    pub fn pin_write_ns(&self) -> i64 {
        self.pin_write.get()
    }

    /// Shared dispatch-latency estimate.
    pub fn latency(&self) -> &DispatchLatency {
        &self.latency
    }

    /// Give back the pin once the timer no longer owns this cycle.
    pub fn into_pin(self) -> P {
        self.pin
    }

    fn wake_margin(&self) -> i64 {
        self.latency.get() + SAFETY_MARGIN_NS
    }

    /// Run one cycle for a timer armed at `requested`.
    pub fn run(&mut self, requested: WallTime) -> CycleReport {
        let target = CycleTarget::new(requested.sec(), self.pin_write.get(), self.width);

        let cs = CriticalSection::enter(&self.control);
        let observed = self.clock.now();

        if observed.sec() > requested.sec() {
            cs.exit();
            let next_deadline = CycleTarget {
                target_second: observed.sec(),
                ..target
            }
            .next_second()
            .wake_deadline(self.wake_margin());
            self.stats.record_rescheduled();
            self.stats.record_deadline(next_deadline);
            warn!(
                requested = %requested,
                observed = %observed,
                next = %next_deadline,
                "Wall clock ahead of requested second, deferring pulse"
            );
            return CycleReport {
                target,
                outcome: CycleOutcome::Rescheduled {
                    requested,
                    observed,
                },
                observed_latency_ns: None,
                next_deadline,
            };
        }

        let late = observed.sec() != requested.sec() || observed.nsec() > target.assert_offset_ns;
        let outcome = if late || !target.is_valid() {
            cs.exit();
            self.stats.record_missed();
            warn!(
                requested = %requested,
                observed = %observed,
                assert_offset_ns = target.assert_offset_ns,
                "Missed PPS deadline, skipping pulse"
            );
            CycleOutcome::Missed {
                requested,
                observed,
            }
        } else {
            let result = actuate_edges(&cs, &mut self.pin, &self.clock, &target);
            cs.exit();
            match result {
                Ok(timing) => {
                    self.pin_write.update(timing.pin_write_ns);
                    self.stats.record_pulse(timing.pin_write_ns);
                    trace!(
                        second = target.target_second,
                        rising = %timing.rising,
                        pin_write_ns = timing.pin_write_ns,
                        "PPS pulse"
                    );
                    CycleOutcome::OnTime(timing)
                }
                Err(e) => {
                    self.stats.record_fault();
                    warn!(error = %e, second = target.target_second, "PPS line write failed, pulse dropped");
                    CycleOutcome::Faulted(e)
                }
            }
        };

        let latency_ns = observed.nanos_since(requested);
        self.latency.update(latency_ns);
        self.stats.record_latency(latency_ns);

        let next_deadline = target.next_second().wake_deadline(self.wake_margin());
        self.stats.record_deadline(next_deadline);

        CycleReport {
            target,
            outcome,
            observed_latency_ns: Some(latency_ns),
            next_deadline,
        }
    }
}

impl<P, C, M> ExpiryHandler for PulseCycle<P, C, M>
where
    P: OutputPin + 'static,
    C: WallClock + 'static,
    M: PreemptionControl + 'static,
{
    fn on_expiry(&mut self, requested: WallTime) -> TimerAction {
        TimerAction::Rearm(self.run(requested).next_deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::critical::tests::CountingControl;
    use crate::critical::NoPreemption;
    use pps_common::{SimulatedClock, NSEC_PER_SEC};
    use pps_gpio::{PinLevel, SimulatedPin};
    use proptest::prelude::*;

    const WIDTH_NS: i64 = 30_000;
    const PIN_WRITE_NS: i64 = 500;

    struct Rig {
        clock: SimulatedClock,
        pin: SimulatedPin,
        control: CountingControl,
        stats: Arc<PulseStats>,
        cycle: PulseCycle<SimulatedPin, SimulatedClock, CountingControl>,
    }

    fn rig(start: WallTime, latency_ns: i64) -> Rig {
        let clock = SimulatedClock::new(start, 10);
        let pin = SimulatedPin::with_write_cost(clock.clone(), PIN_WRITE_NS);
        let control = CountingControl::default();
        let stats = Arc::new(PulseStats::new());
        let cycle = PulseCycle::new(
            pin.clone(),
            clock.clone(),
            control.clone(),
            PulseWidth::from_nanos(WIDTH_NS as u64).unwrap(),
            PIN_WRITE_NS,
            DispatchLatency::new(latency_ns),
            Arc::clone(&stats),
        );
        Rig {
            clock,
            pin,
            control,
            stats,
            cycle,
        }
    }

    fn assert_offset() -> i64 {
        NSEC_PER_SEC - PIN_WRITE_NS - WIDTH_NS
    }

    #[test]
    fn test_on_time_cycle_pulses_and_rearms() {
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(requested.add_nanos(3_000), 10_000);

        let report = rig.cycle.run(requested);

        let CycleOutcome::OnTime(timing) = report.outcome else {
            panic!("expected on-time pulse, got {:?}", report.outcome);
        };
        assert_eq!(report.target.assert_offset_ns, assert_offset());
        assert_eq!(report.target.deassert_offset_ns, NSEC_PER_SEC - PIN_WRITE_NS);
        assert_eq!(timing.rising.sec(), 100);

        let edges = rig.pin.edges();
        assert_eq!(edges.len(), 2);
        assert_eq!(edges[0].level, PinLevel::High);
        assert_eq!(edges[1].level, PinLevel::Low);
        let width = edges[1].at.unwrap().nanos_since(edges[0].at.unwrap());
        assert!((WIDTH_NS - 20..=WIDTH_NS + 20).contains(&width), "width {width}");

        // 3_000 > 10_000 is false, so the estimate decays: (30_000 + 3_000) / 4.
        assert_eq!(report.observed_latency_ns, Some(3_000));
        assert_eq!(rig.cycle.latency().get(), 8_250);
        assert_eq!(
            report.next_deadline,
            WallTime::new(101, assert_offset() - 8_250 - SAFETY_MARGIN_NS)
        );
        assert_eq!(rig.stats.pulses(), 1);
        assert_eq!(rig.control.depth(), 0);
        assert_eq!(rig.control.entries(), 1);
    }

    #[test]
    fn test_pin_write_feedback_moves_next_offsets() {
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(requested, 10_000);

        let report = rig.cycle.run(requested);
        let CycleOutcome::OnTime(timing) = report.outcome else {
            panic!("expected on-time pulse");
        };
        assert_eq!(
            rig.cycle.pin_write_ns(),
            (PIN_WRITE_NS + timing.pin_write_ns) / 2
        );

        // Next cycle uses the updated estimate for its edge offsets.
        rig.clock.set(report.next_deadline);
        let second = rig.cycle.run(report.next_deadline);
        assert_eq!(
            second.target.deassert_offset_ns,
            NSEC_PER_SEC - (PIN_WRITE_NS + timing.pin_write_ns) / 2
        );
    }

    #[test]
    fn test_late_wake_skips_pulse_and_rearms_next_second() {
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(WallTime::new(100, assert_offset() + 1), 10_000);

        let report = rig.cycle.run(requested);

        assert!(matches!(report.outcome, CycleOutcome::Missed { .. }));
        assert_eq!(rig.pin.write_count(), 0);
        assert_eq!(rig.stats.missed(), 1);
        // Latency 20_001 jumps the estimate.
        assert_eq!(rig.cycle.latency().get(), 20_001);
        assert_eq!(report.next_deadline.sec(), 101);
        assert_eq!(
            report.next_deadline,
            WallTime::new(101, assert_offset() - 20_001 - SAFETY_MARGIN_NS)
        );
        assert_eq!(rig.control.depth(), 0);
    }

    #[test]
    fn test_previous_second_wake_counts_as_missed() {
        // Clock stepped back below the requested second.
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(WallTime::new(99, 500_000_000), 10_000);

        let report = rig.cycle.run(requested);

        assert!(matches!(report.outcome, CycleOutcome::Missed { .. }));
        assert_eq!(rig.pin.write_count(), 0);
        // Negative latency is clamped to zero before smoothing.
        assert_eq!(rig.cycle.latency().get(), 7_500);
        assert_eq!(report.next_deadline.sec(), 101);
    }

    #[test]
    fn test_forward_jump_defers_one_second_without_feedback() {
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(WallTime::new(105, 1_000), 10_000);

        let report = rig.cycle.run(requested);

        assert!(matches!(report.outcome, CycleOutcome::Rescheduled { .. }));
        assert_eq!(rig.pin.write_count(), 0);
        assert_eq!(report.observed_latency_ns, None);
        assert_eq!(rig.cycle.latency().get(), 10_000);
        assert_eq!(rig.cycle.pin_write_ns(), PIN_WRITE_NS);
        assert_eq!(
            report.next_deadline,
            WallTime::new(106, assert_offset() - 10_000 - SAFETY_MARGIN_NS)
        );
        assert_eq!(rig.stats.rescheduled(), 1);
        assert_eq!(rig.control.depth(), 0);
    }

    #[test]
    fn test_write_failure_drops_pulse_but_keeps_loop() {
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(requested, 10_000);
        rig.pin.set_fail_writes(true);

        let report = rig.cycle.run(requested);

        assert!(matches!(report.outcome, CycleOutcome::Faulted(PpsError::Gpio(_))));
        assert_eq!(rig.cycle.pin_write_ns(), PIN_WRITE_NS);
        assert_eq!(report.next_deadline.sec(), 101);
        assert_eq!(rig.stats.snapshot().faults, 1);
        assert_eq!(rig.control.depth(), 0);
    }

    #[test]
    fn test_zero_calibration_still_pulses() {
        // A clock too coarse to see a write measures it as free.
        let coarse = SimulatedClock::new(WallTime::new(99, 0), 0);
        let mut free_pin = SimulatedPin::with_write_cost(coarse.clone(), 0);
        let calibrated =
            crate::calibration::calibrate_pin_write(&mut free_pin, &coarse, &NoPreemption).unwrap();
        assert_eq!(calibrated, 0);

        let clock = SimulatedClock::new(WallTime::ZERO, 10);
        let pin = SimulatedPin::with_write_cost(clock.clone(), 0);
        let stats = Arc::new(PulseStats::new());
        let mut cycle = PulseCycle::new(
            pin.clone(),
            clock.clone(),
            NoPreemption,
            PulseWidth::from_nanos(WIDTH_NS as u64).unwrap(),
            calibrated,
            DispatchLatency::new(1_000),
            Arc::clone(&stats),
        );

        let mut requested = WallTime::new(100, NSEC_PER_SEC - 1 - WIDTH_NS - 20_000);
        for _ in 0..5 {
            clock.set(requested.add_nanos(1_000));
            let report = cycle.run(requested);
            assert!(
                matches!(report.outcome, CycleOutcome::OnTime(_)),
                "expected a pulse, got {:?}",
                report.outcome
            );
            assert!(report.target.is_valid());
            requested = report.next_deadline;
        }

        assert_eq!(stats.pulses(), 5);
        assert_eq!(stats.missed(), 0);
        assert_eq!(pin.rising_edges().len(), 5);
    }

    #[test]
    fn test_expiry_handler_rearms() {
        let requested = WallTime::new(100, assert_offset() - 20_000);
        let mut rig = rig(requested, 10_000);

        match rig.cycle.on_expiry(requested) {
            TimerAction::Rearm(next) => assert_eq!(next.sec(), 101),
            TimerAction::Stop => panic!("pulse loop must stay armed"),
        }
    }

    proptest! {
        #[test]
        fn prop_edge_spacing_equals_width(width_ns in 1u64..=100_000, pin_write_ns in 0i64..50_000) {
            let width = PulseWidth::from_nanos(width_ns).unwrap();
            let target = CycleTarget::new(1_700_000_000, pin_write_ns, width);
            prop_assert_eq!(target.deassert_offset_ns - target.assert_offset_ns, width_ns as i64);
            prop_assert!(target.is_valid());
        }

        #[test]
        fn prop_on_time_offsets_are_ordered(
            width_ns in 1u64..=100_000,
            latency_ns in 0i64..200_000,
            lateness_ns in 0i64..5_000,
        ) {
            let clock = SimulatedClock::new(WallTime::ZERO, 10);
            let pin = SimulatedPin::with_write_cost(clock.clone(), PIN_WRITE_NS);
            let mut cycle = PulseCycle::new(
                pin,
                clock.clone(),
                crate::critical::NoPreemption,
                PulseWidth::from_nanos(width_ns).unwrap(),
                PIN_WRITE_NS,
                DispatchLatency::new(latency_ns),
                Arc::new(PulseStats::new()),
            );
            let target = CycleTarget::new(50, PIN_WRITE_NS, PulseWidth::from_nanos(width_ns).unwrap());
            let requested = target.wake_deadline(latency_ns + SAFETY_MARGIN_NS);
            clock.set(requested.add_nanos(lateness_ns));

            let report = cycle.run(requested);
            if let CycleOutcome::OnTime(_) = report.outcome {
                prop_assert!(report.target.assert_offset_ns < report.target.deassert_offset_ns);
                prop_assert!(report.target.deassert_offset_ns < NSEC_PER_SEC);
            }
            prop_assert_eq!(report.next_deadline.sec(), 51);
        }
    }
}
