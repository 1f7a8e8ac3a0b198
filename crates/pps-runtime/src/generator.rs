//! Channel lifecycle: attach, calibrate, arm, and tear down.

use crate::calibration::calibrate_pin_write;
use crate::critical::PreemptionControl;
use crate::cycle::PulseCycle;
use crate::estimator::DispatchLatency;
use crate::timer::DeadlineTimer;
use crate::SAFETY_MARGIN_NS;
use pps_common::{
    ChannelState, PpsError, PpsResult, PulseStats, PulseWidth, StateMachine, WallClock, WallTime,
    NSEC_PER_SEC,
};
use pps_gpio::OutputPin;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::{error, info, warn};

/// First timer deadline after calibration.
///
/// Lands in the second after `now`, leaving three safety margins before the
/// rising edge so the first wake-up has room for an uncalibrated dispatch.
#[must_use]
pub const fn first_deadline(now: WallTime, width: PulseWidth, pin_write_ns: i64) -> WallTime {
    WallTime::new(
        now.sec() + 1,
        NSEC_PER_SEC - width.as_nanos() - pin_write_ns - 3 * SAFETY_MARGIN_NS,
    )
}

/// One PPS output channel bound to a line and a timer.
///
/// Created by [`PpsGenerator::attach`]; stopped by [`PpsGenerator::detach`]
/// or on drop.
pub struct PpsGenerator<P, C, M, T>
where
    P: OutputPin + 'static,
    C: WallClock + 'static,
    M: PreemptionControl + 'static,
    T: DeadlineTimer<PulseCycle<P, C, M>>,
{
    timer: T,
    state: StateMachine,
    label: String,
    width: PulseWidth,
    calibrated_pin_write_ns: i64,
    first_deadline: WallTime,
    latency: DispatchLatency,
    stats: Arc<PulseStats>,
    // The pulse loop owning the pin, clock and control lives inside the timer.
    _cycle: PhantomData<fn() -> (P, C, M)>,
}

impl<P, C, M, T> PpsGenerator<P, C, M, T>
where
    P: OutputPin + 'static,
    C: WallClock + 'static,
    M: PreemptionControl + 'static,
    T: DeadlineTimer<PulseCycle<P, C, M>>,
{
    /// Calibrate `pin` and arm `timer` for the first pulse.
    ///
    /// On failure nothing stays armed and the pin has been released.
    ///
    /// # Errors
    ///
    /// Returns the pin's error if calibration fails, or the timer's error
    /// if it cannot be armed.
    pub fn attach(
        mut pin: P,
        clock: C,
        control: M,
        mut timer: T,
        width: PulseWidth,
        latency: DispatchLatency,
    ) -> PpsResult<Self> {
        let mut state = StateMachine::new();
        state.transition(ChannelState::Calibrating)?;
        let label = pin.label();

        let pin_write_ns = match calibrate_pin_write(&mut pin, &clock, &control) {
            Ok(ns) => ns,
            Err(e) => {
                error!(pin = %label, error = %e, "PPS line calibration failed");
                state.transition(ChannelState::Fault)?;
                if let Err(release) = pin.release() {
                    warn!(pin = %label, error = %release, "Failed to release PPS line");
                }
                return Err(e);
            }
        };

        let first = first_deadline(clock.now(), width, pin_write_ns);
        let stats = Arc::new(PulseStats::new());
        stats.record_deadline(first);

        let cycle = PulseCycle::new(
            pin,
            clock,
            control,
            width,
            pin_write_ns,
            latency.clone(),
            Arc::clone(&stats),
        );
        if let Err(e) = timer.arm_absolute(first, cycle) {
            // The cycle, and the pin with it, was dropped by the timer.
            error!(pin = %label, error = %e, "Failed to arm PPS timer");
            state.transition(ChannelState::Fault)?;
            return Err(e);
        }
        state.transition(ChannelState::Armed)?;

        info!(
            pin = %label,
            width_ns = width.as_nanos(),
            pin_write_ns,
            first_deadline = %first,
            "PPS generator armed"
        );

        Ok(Self {
            timer,
            state,
            label,
            width,
            calibrated_pin_write_ns: pin_write_ns,
            first_deadline: first,
            latency,
            stats,
            _cycle: PhantomData,
        })
    }

    /// Stop pulsing and release the line.
    ///
    /// The timer is cancelled first; the line is released only after no
    /// expiry can still touch it.
    ///
    /// # Errors
    ///
    /// Returns the pin's release error, or a timer error if the handler
    /// could not be recovered from the timer.
    pub fn detach(mut self) -> PpsResult<()> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> PpsResult<()> {
        if !self.state.state().is_running() {
            return Ok(());
        }

        let released = match self.timer.cancel() {
            Some(cycle) => cycle.into_pin().release(),
            None => Err(PpsError::Timer(
                "timer handler lost; line released on drop".into(),
            )),
        };
        self.state.transition(ChannelState::Stopped)?;

        let stats = self.stats.snapshot();
        info!(
            pin = %self.label,
            avg_dispatch_latency_ns = self.latency.get(),
            pulses = stats.pulses,
            missed = stats.missed,
            "PPS generator detached"
        );
        released
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ChannelState {
        self.state.state()
    }

    /// Label of the output line.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Configured pulse width.
    pub fn width(&self) -> PulseWidth {
        self.width
    }

    /// Pin-write cost measured at attach.
    pub fn calibrated_pin_write_ns(&self) -> i64 {
        self.calibrated_pin_write_ns
    }

    /// Deadline the timer was first armed for.
    pub fn first_deadline(&self) -> WallTime {
        self.first_deadline
    }

    /// Shared dispatch-latency estimate.
    pub fn latency(&self) -> &DispatchLatency {
        &self.latency
    }

    /// Pulse counters for this channel.
    pub fn stats(&self) -> Arc<PulseStats> {
        Arc::clone(&self.stats)
    }
}

impl<P, C, M, T> Drop for PpsGenerator<P, C, M, T>
where
    P: OutputPin + 'static,
    C: WallClock + 'static,
    M: PreemptionControl + 'static,
    T: DeadlineTimer<PulseCycle<P, C, M>>,
{
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(pin = %self.label, error = %e, "PPS generator teardown failed");
        }
    }
}
