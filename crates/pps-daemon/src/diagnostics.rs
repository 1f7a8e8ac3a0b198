//! Health reporting for the running generator.
//!
//! Health is derived from the shared pulse statistics. Anything that went
//! wrong since the previous report (a missed deadline, a clock-jump
//! reschedule, a failed write) marks the channel degraded for that report.

use pps_common::{ChannelState, PulseStats, PulseStatsSnapshot};
use pps_runtime::DispatchLatency;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Health of the PPS channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Calibrating, or armed without a pulse yet.
    Starting,
    /// Pulsing on time.
    Healthy,
    /// Pulses were skipped since the previous report.
    Degraded,
    /// Detached or detaching.
    ShuttingDown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Starting => write!(f, "starting"),
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

/// Fixed facts about the channel, captured at attach.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelInfo {
    /// Output line label.
    pub line: String,
    /// Configured pulse width.
    pub pulse_width_ns: i64,
    /// Pin-write cost measured at attach.
    pub calibrated_pin_write_ns: i64,
}

/// Point-in-time diagnostics, rendered as a log line or JSON.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticsSnapshot {
    /// Derived health.
    pub health: HealthStatus,
    /// Channel lifecycle state.
    pub state: ChannelState,
    /// Seconds since the collector was created.
    pub uptime_secs: u64,
    /// Current dispatch-latency estimate.
    pub avg_dispatch_latency_ns: i64,
    /// Channel facts.
    pub channel: ChannelInfo,
    /// Pulse counters.
    pub pulses: PulseStatsSnapshot,
}

impl DiagnosticsSnapshot {
    /// Pretty JSON rendering.
    ///
    /// # Errors
    ///
    /// Fails only if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Classify health from the lifecycle state and the counters since the
/// previous report.
pub fn classify_health(
    state: ChannelState,
    current: &PulseStatsSnapshot,
    previous: &PulseStatsSnapshot,
) -> HealthStatus {
    match state {
        ChannelState::Detached | ChannelState::Calibrating => HealthStatus::Starting,
        ChannelState::Stopped | ChannelState::Fault => HealthStatus::ShuttingDown,
        ChannelState::Armed => {
            let anomalies = |s: &PulseStatsSnapshot| s.missed + s.rescheduled + s.faults;
            if anomalies(current) > anomalies(previous) {
                HealthStatus::Degraded
            } else if current.pulses == 0 {
                HealthStatus::Starting
            } else {
                HealthStatus::Healthy
            }
        }
    }
}

/// Builds snapshots and remembers the previous one for health deltas.
pub struct DiagnosticsCollector {
    stats: Arc<PulseStats>,
    latency: DispatchLatency,
    channel: ChannelInfo,
    start_time: Instant,
    previous: PulseStatsSnapshot,
}

impl DiagnosticsCollector {
    /// Collector over the generator's statistics.
    pub fn new(stats: Arc<PulseStats>, latency: DispatchLatency, channel: ChannelInfo) -> Self {
        let previous = stats.snapshot();
        Self {
            stats,
            latency,
            channel,
            start_time: Instant::now(),
            previous,
        }
    }

    /// Take a snapshot and make it the baseline for the next one.
    pub fn snapshot(&mut self, state: ChannelState) -> DiagnosticsSnapshot {
        let current = self.stats.snapshot();
        let health = classify_health(state, &current, &self.previous);
        self.previous = current;

        DiagnosticsSnapshot {
            health,
            state,
            uptime_secs: self.start_time.elapsed().as_secs(),
            avg_dispatch_latency_ns: self.latency.get(),
            channel: self.channel.clone(),
            pulses: current,
        }
    }
}
