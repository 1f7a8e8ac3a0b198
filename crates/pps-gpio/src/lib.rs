//! Output line abstractions for the pulse generator.
//!
//! This crate provides:
//! - [`OutputPin`] trait the pulse loop drives
//! - [`sysfs`] module with a Linux sysfs GPIO line driver
//! - [`SimulatedPin`] recording edges in memory (feature `simulated`)
//! - [`discover_line`] selecting the configured output line

#[cfg(unix)]
pub mod sysfs;

#[cfg(unix)]
pub use sysfs::SysfsPin;

use pps_common::{GeneratorConfig, LineConfig, PpsError, PpsResult};

/// Logical level of the output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PinLevel {
    /// Inactive (pulse deasserted).
    Low,
    /// Active (pulse asserted).
    High,
}

/// An output line the pulse loop can drive.
///
/// `set_level` is called while preemption is blocked, so it must not
/// allocate, log, or sleep, and should complete in well under a microsecond.
pub trait OutputPin: Send {
    /// Drive the line to `level`.
    fn set_level(&mut self, level: PinLevel) -> PpsResult<()>;

    /// Return the line to the platform.
    ///
    /// Called once at detach, after the timer has been cancelled.
    fn release(&mut self) -> PpsResult<()> {
        Ok(())
    }

    /// Short human-readable name for logs.
    fn label(&self) -> String;
}

impl<P: OutputPin + ?Sized> OutputPin for Box<P> {
    fn set_level(&mut self, level: PinLevel) -> PpsResult<()> {
        (**self).set_level(level)
    }

    fn release(&mut self) -> PpsResult<()> {
        (**self).release()
    }

    fn label(&self) -> String {
        (**self).label()
    }
}

/// Select the output line from configuration.
///
/// # Errors
///
/// Returns a configuration error unless exactly one line is configured.
pub fn discover_line(config: &GeneratorConfig) -> PpsResult<&LineConfig> {
    config.line.as_ref().ok_or_else(|| {
        PpsError::Config("exactly one PPS output line must be configured ([line] gpio = N)".into())
    })
}

#[cfg(feature = "simulated")]
pub use simulated::{Edge, SimulatedPin};

#[cfg(feature = "simulated")]
mod simulated {
    use super::{OutputPin, PinLevel};
    use pps_common::{PpsError, PpsResult, SimulatedClock, WallTime};
    use std::sync::{Arc, Mutex, MutexGuard};

    /// One recorded level change.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Edge {
        /// Level written.
        pub level: PinLevel,
        /// Clock reading when the write started (if a clock is attached).
        pub at: Option<WallTime>,
    }

    #[derive(Debug, Default)]
    struct PinLog {
        edges: Vec<Edge>,
        writes: usize,
        level: Option<PinLevel>,
        fail_writes: bool,
        released: bool,
    }

    /// In-memory pin for tests and runs without hardware.
    ///
    /// Clones share the same log, so a test can keep one clone to inspect
    /// while the other is owned by the generator. With a clock attached,
    /// every write advances it by the configured write cost.
    #[derive(Debug, Clone, Default)]
    pub struct SimulatedPin {
        clock: Option<SimulatedClock>,
        write_cost_ns: i64,
        counting_only: bool,
        log: Arc<Mutex<PinLog>>,
    }

    impl SimulatedPin {
        /// Create a pin with no clock and zero write cost.
        pub fn new() -> Self {
            Self::default()
        }

        /// Create a pin whose writes take `write_cost_ns` on `clock`.
        pub fn with_write_cost(clock: SimulatedClock, write_cost_ns: i64) -> Self {
            Self {
                clock: Some(clock),
                write_cost_ns,
                counting_only: false,
                log: Arc::default(),
            }
        }

        /// Create a pin that counts writes and keeps the last level only.
        ///
        /// No edge log is kept, so writes never allocate and a long run
        /// stays at constant memory.
        pub fn counting() -> Self {
            Self {
                counting_only: true,
                ..Self::default()
            }
        }

        fn log(&self) -> MutexGuard<'_, PinLog> {
            // A panic while holding the log only happens in a failing test.
            self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        /// Make subsequent writes fail.
        pub fn set_fail_writes(&self, fail: bool) {
            self.log().fail_writes = fail;
        }

        /// All edges written so far; always empty for [`Self::counting`] pins.
        pub fn edges(&self) -> Vec<Edge> {
            self.log().edges.clone()
        }

        /// Only the rising edges, in order.
        pub fn rising_edges(&self) -> Vec<Edge> {
            self.log()
                .edges
                .iter()
                .copied()
                .filter(|e| e.level == PinLevel::High)
                .collect()
        }

        /// Number of successful writes.
        pub fn write_count(&self) -> usize {
            self.log().writes
        }

        /// Last level written.
        pub fn level(&self) -> Option<PinLevel> {
            self.log().level
        }

        /// Whether `release` has been called.
        pub fn is_released(&self) -> bool {
            self.log().released
        }
    }

    impl OutputPin for SimulatedPin {
        fn set_level(&mut self, level: PinLevel) -> PpsResult<()> {
            let mut log = self.log();
            if log.released {
                return Err(PpsError::Gpio("write to released simulated pin".into()));
            }
            if log.fail_writes {
                return Err(PpsError::Gpio("simulated write failure".into()));
            }
            let at = self.clock.as_ref().map(|clock| {
                let at = clock.peek();
                clock.advance(self.write_cost_ns);
                at
            });
            if !self.counting_only {
                log.edges.push(Edge { level, at });
            }
            log.writes += 1;
            log.level = Some(level);
            Ok(())
        }

        fn release(&mut self) -> PpsResult<()> {
            self.log().released = true;
            Ok(())
        }

        fn label(&self) -> String {
            "simulated".into()
        }
    }
}
