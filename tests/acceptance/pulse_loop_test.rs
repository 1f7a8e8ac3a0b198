//! Whole-loop pulse tests on simulated hardware.
//!
//! # Acceptance Criteria
//!
//! - Every on-time pulse rises in its target second and its falling edge
//!   takes effect on the following second boundary
//! - Late wake-ups skip the pulse and the loop recovers next second
//! - Forward clock jumps never pulse and re-arm one second after the
//!   observed second
//! - Failed line writes drop the pulse without stopping the loop

use super::common::*;
use pps_common::{ChannelState, WallTime};
use pps_runtime::SAFETY_MARGIN_NS;

#[test]
fn test_steady_state_pulses_land_on_boundaries() {
    let rig = SimRig::attach(30_000);
    assert_eq!(rig.generator.state(), ChannelState::Armed);
    assert_eq!(rig.generator.calibrated_pin_write_ns(), CALIBRATED_NS);

    let mut expected_second = START.sec() + 1;
    for _ in 0..10 {
        assert_eq!(rig.deadline().sec(), expected_second);
        let next = rig.fire_late_by(2_000).expect("re-armed");
        assert_eq!(next.sec(), expected_second + 1);
        expected_second += 1;
    }

    let pulses = rig.pulses();
    assert_eq!(pulses.len(), 10);
    for (i, (rise, fall)) in pulses.iter().enumerate() {
        assert_pulse_on_time(rise, fall, START.sec() + 1 + i as i64, 30_000);
    }

    let stats = rig.stats();
    assert_eq!(stats.pulses, 10);
    assert_eq!(stats.missed, 0);
    assert_eq!(stats.last_pin_write_ns, CALIBRATED_NS);
    assert_eq!(stats.last_latency_ns, 2_000);
}

#[test]
fn test_latency_estimate_tracks_dispatch_jitter() {
    let rig = SimRig::attach(30_000);

    rig.fire_late_by(2_000);
    // (3 * 10_000 + 2_000) / 4
    assert_eq!(rig.latency.get(), 8_000);

    // Still inside the 18us margin, so on time, but a new high.
    rig.fire_late_by(15_000);
    assert_eq!(rig.latency.get(), 15_000);

    // The wake-up margin follows the estimate.
    let assert_offset = 1_000_000_000 - CALIBRATED_NS - 30_000;
    assert_eq!(
        rig.deadline().nsec(),
        assert_offset - 15_000 - SAFETY_MARGIN_NS
    );
    assert_eq!(rig.stats().pulses, 2);
}

#[test]
fn test_late_wake_skips_one_pulse_and_recovers() {
    let rig = SimRig::attach(30_000);
    rig.fire_late_by(2_000);
    rig.fire_late_by(2_000);

    let late_second = rig.deadline().sec();
    let assert_offset = 1_000_000_000 - CALIBRATED_NS - 30_000;
    let next = rig
        .fire_at(WallTime::new(late_second, assert_offset + 1))
        .expect("re-armed");

    assert_eq!(next.sec(), late_second + 1);
    assert_eq!(rig.pulses().len(), 2);
    assert_eq!(rig.stats().missed, 1);

    rig.fire_late_by(2_000);
    let pulses = rig.pulses();
    assert_eq!(pulses.len(), 3);
    let (rise, fall) = pulses[2];
    assert_pulse_on_time(&rise, &fall, late_second + 1, 30_000);
}

#[test]
fn test_forward_clock_jump_defers_without_pulsing() {
    let rig = SimRig::attach(30_000);
    rig.fire_late_by(2_000);
    let latency_before = rig.latency.get();
    let deadline = rig.deadline();

    // Clock stepped forward by several seconds while the timer slept.
    let observed = WallTime::new(deadline.sec() + 5, 400_000_000);
    let next = rig.fire_at(observed).expect("re-armed");

    assert_eq!(next.sec(), observed.sec() + 1);
    assert_eq!(next.nsec(), deadline.nsec());
    assert_eq!(rig.latency.get(), latency_before);
    assert_eq!(rig.pulses().len(), 1);
    assert_eq!(rig.stats().rescheduled, 1);

    rig.fire_late_by(2_000);
    let pulses = rig.pulses();
    assert_eq!(pulses.len(), 2);
    assert_pulse_on_time(&pulses[1].0, &pulses[1].1, observed.sec() + 1, 30_000);
}

#[test]
fn test_backward_clock_step_counts_as_miss() {
    let rig = SimRig::attach(30_000);
    let deadline = rig.deadline();

    let next = rig
        .fire_at(WallTime::new(deadline.sec() - 1, 999_000_000))
        .expect("re-armed");

    assert_eq!(next.sec(), deadline.sec() + 1);
    assert!(rig.pulses().is_empty());
    assert_eq!(rig.stats().missed, 1);
    // Negative latency is treated as zero: (3 * 10_000 + 0) / 4.
    assert_eq!(rig.latency.get(), 7_500);
}

#[test]
fn test_write_failure_drops_pulse_and_loop_continues() {
    let rig = SimRig::attach(50_000);
    rig.fire_late_by(2_000);

    rig.pin.set_fail_writes(true);
    let next = rig.fire_late_by(2_000).expect("re-armed");
    rig.pin.set_fail_writes(false);

    assert_eq!(rig.stats().faults, 1);
    assert_eq!(rig.deadline(), next);

    rig.fire_late_by(2_000);
    let pulses = rig.pulses();
    assert_eq!(pulses.len(), 2);
    assert_pulse_on_time(&pulses[1].0, &pulses[1].1, next.sec(), 50_000);
}

#[test]
fn test_extreme_widths_keep_edges_ordered() {
    for width_ns in [1, 100_000] {
        let rig = SimRig::attach(width_ns);
        rig.fire_late_by(1_000);
        let pulses = rig.pulses();
        assert_eq!(pulses.len(), 1, "width {width_ns}");
        let (rise, fall) = pulses[0];
        assert!(rise.at.unwrap() < fall.at.unwrap());
        assert_eq!(rise.at.unwrap().sec(), START.sec() + 1);
    }
}
