//! Channel lifecycle state machine.
//!
//! State transitions:
//! DETACHED → CALIBRATING → ARMED → STOPPED
//!
//! A failed calibration or arm moves the channel to FAULT, from which it can
//! only be stopped.

use crate::error::{PpsError, PpsResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of one output channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelState {
    /// No pin or timer held.
    #[default]
    Detached,
    /// Pin acquired; measuring the pin-write cost.
    Calibrating,
    /// Timer armed; pulses are being generated.
    Armed,
    /// Attach failed part-way; resources are being released.
    Fault,
    /// Timer cancelled and pin released.
    Stopped,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Detached => write!(f, "DETACHED"),
            Self::Calibrating => write!(f, "CALIBRATING"),
            Self::Armed => write!(f, "ARMED"),
            Self::Fault => write!(f, "FAULT"),
            Self::Stopped => write!(f, "STOPPED"),
        }
    }
}

impl ChannelState {
    /// Check if a transition to `target` is valid from the current state.
    #[must_use]
    pub fn can_transition_to(&self, target: ChannelState) -> bool {
        use ChannelState::{Armed, Calibrating, Detached, Fault, Stopped};

        matches!(
            (self, target),
            (Detached, Calibrating)
                | (Calibrating, Armed)
                | (Calibrating, Fault)
                | (Armed, Stopped)
                | (Fault, Stopped)
        )
    }

    /// Returns true while the timer is armed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Armed)
    }
}

/// State holder that rejects invalid transitions.
#[derive(Debug, Clone, Default)]
pub struct StateMachine {
    current: ChannelState,
    transition_count: u64,
}

impl StateMachine {
    /// Create a state machine starting in DETACHED.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ChannelState {
        self.current
    }

    /// Number of successful transitions so far.
    #[must_use]
    pub fn transition_count(&self) -> u64 {
        self.transition_count
    }

    /// Move to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`PpsError::InvalidStateTransition`] if the transition is not allowed.
    pub fn transition(&mut self, target: ChannelState) -> PpsResult<()> {
        if !self.current.can_transition_to(target) {
            return Err(PpsError::InvalidStateTransition {
                from: self.current.to_string(),
                to: target.to_string(),
            });
        }
        tracing::debug!(from = %self.current, to = %target, "Channel state transition");
        self.current = target;
        self.transition_count += 1;
        Ok(())
    }
}
