use thiserror::Error;

/// Generator error types covering configuration, resource acquisition, and lifecycle faults.
///
/// Runtime deadline misses and clock jumps are not errors: the pulse loop
/// reports them as cycle outcomes and keeps running.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PpsError {
    /// Configuration or initialization error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Pulse width outside the accepted range.
    #[error("pulse width {width_ns}ns out of range (must be 1..={max_ns}ns)")]
    PulseWidthOutOfRange {
        /// Requested width in nanoseconds.
        width_ns: u64,
        /// Maximum accepted width in nanoseconds.
        max_ns: u64,
    },

    /// Output line could not be acquired, configured, or written.
    #[error("gpio error: {0}")]
    Gpio(String),

    /// A level write to an output line failed.
    ///
    /// Carries only plain fields so it can be built while preemption is
    /// blocked.
    #[error("gpio{gpio} write failed (os error {errno})")]
    LineWrite {
        /// Kernel GPIO number.
        gpio: u32,
        /// OS error code, 0 if none was reported.
        errno: i32,
    },

    /// A level write was attempted after the line was released.
    #[error("gpio{gpio} already released")]
    LineReleased {
        /// Kernel GPIO number.
        gpio: u32,
    },

    /// Deadline timer could not be armed or cancelled.
    #[error("timer error: {0}")]
    Timer(String),

    /// Real-time thread setup failed.
    #[error("real-time setup error: {0}")]
    Realtime(String),

    /// Invalid channel state transition attempted.
    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        /// Source state.
        from: String,
        /// Attempted target state.
        to: String,
    },
}

/// Convenience type alias for generator operations.
pub type PpsResult<T> = Result<T, PpsError>;
