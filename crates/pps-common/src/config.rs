//! Configuration structures for the pulse generator.
//!
//! Supports TOML deserialization with defaults suitable for a bench setup.
//! Everything here is fixed once the generator is attached; the pulse width
//! in particular is validated before any hardware is touched.

use crate::error::{PpsError, PpsResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default pulse width (30us).
pub const DEFAULT_PULSE_WIDTH_NS: u64 = 30_000;

/// Maximum accepted pulse width (100us).
pub const MAX_PULSE_WIDTH_NS: u64 = 100_000;

/// Validated width of the asserted part of each pulse.
///
/// Always within `1..=MAX_PULSE_WIDTH_NS` nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PulseWidth(i64);

impl PulseWidth {
    /// Validate a width given in nanoseconds.
    ///
    /// # Errors
    ///
    /// Returns [`PpsError::PulseWidthOutOfRange`] for zero or anything above
    /// [`MAX_PULSE_WIDTH_NS`]. Out-of-range values are rejected, never clamped.
    pub fn from_nanos(width_ns: u64) -> PpsResult<Self> {
        if width_ns == 0 || width_ns > MAX_PULSE_WIDTH_NS {
            return Err(PpsError::PulseWidthOutOfRange {
                width_ns,
                max_ns: MAX_PULSE_WIDTH_NS,
            });
        }
        Ok(Self(width_ns as i64))
    }

    /// Validate a width given as a [`Duration`].
    ///
    /// # Errors
    ///
    /// Same as [`PulseWidth::from_nanos`].
    pub fn from_duration(width: Duration) -> PpsResult<Self> {
        Self::from_nanos(u64::try_from(width.as_nanos()).unwrap_or(u64::MAX))
    }

    /// Width in nanoseconds.
    #[inline]
    #[must_use]
    pub const fn as_nanos(&self) -> i64 {
        self.0
    }
}

impl Default for PulseWidth {
    fn default() -> Self {
        Self(DEFAULT_PULSE_WIDTH_NS as i64)
    }
}

/// Top-level generator configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Time between the rising and falling edge of each pulse.
    #[serde(with = "humantime_serde")]
    pub pulse_width: Duration,

    /// Output line. Exactly one must be configured for hardware operation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<LineConfig>,

    /// Real-time settings for the timer thread.
    pub realtime: RealtimeConfig,

    /// Periodic status reporting.
    pub diagnostics: DiagnosticsConfig,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            pulse_width: Duration::from_nanos(DEFAULT_PULSE_WIDTH_NS),
            line: None,
            realtime: RealtimeConfig::default(),
            diagnostics: DiagnosticsConfig::default(),
        }
    }
}

impl GeneratorConfig {
    /// Validate the configuration and return the pulse width to run with.
    ///
    /// # Errors
    ///
    /// Returns an error for an out-of-range pulse width or a zero status interval.
    pub fn validate(&self) -> PpsResult<PulseWidth> {
        let width = PulseWidth::from_duration(self.pulse_width)?;
        if self.diagnostics.status_interval.is_zero() {
            return Err(PpsError::Config(
                "diagnostics.status_interval must be non-zero".into(),
            ));
        }
        Ok(width)
    }

    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(ConfigError::Parse)
    }

    /// Serialize configuration to a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }
}

/// Output line selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineConfig {
    /// Kernel GPIO number of the output line.
    pub gpio: u32,

    /// Invert the electrical level (active = low).
    #[serde(default)]
    pub active_low: bool,

    /// Root of the sysfs GPIO class directory.
    #[serde(default = "default_sysfs_root")]
    pub sysfs_root: PathBuf,
}

impl LineConfig {
    /// Line on the default sysfs root.
    pub fn new(gpio: u32) -> Self {
        Self {
            gpio,
            active_low: false,
            sysfs_root: default_sysfs_root(),
        }
    }
}

fn default_sysfs_root() -> PathBuf {
    PathBuf::from("/sys/class/gpio")
}

/// Real-time settings applied to the thread that runs the pulse loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Apply real-time settings at all.
    pub enabled: bool,

    /// Scheduler policy: "fifo", "rr" or "other".
    pub policy: SchedPolicy,

    /// Scheduler priority (1-99 for RT policies).
    pub priority: u8,

    /// CPUs the timer thread may run on.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_affinity: Option<CpuAffinity>,

    /// Lock all memory pages (mlockall).
    pub lock_memory: bool,

    /// Refuse to start if RT privileges are missing instead of degrading.
    pub fail_fast: bool,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            policy: SchedPolicy::Fifo,
            priority: 90,
            cpu_affinity: None,
            lock_memory: true,
            fail_fast: false,
        }
    }
}

/// Scheduler policy for the timer thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SchedPolicy {
    /// SCHED_FIFO
    #[default]
    Fifo,
    /// SCHED_RR
    Rr,
    /// SCHED_OTHER (no real-time priority).
    Other,
}

/// CPU pinning: a single core index or a list of them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CpuAffinity {
    /// Pin to one core.
    Single(usize),
    /// Pin to any of these cores.
    Set(Vec<usize>),
}

impl CpuAffinity {
    /// The core indices this affinity names.
    pub fn cpus(&self) -> Vec<usize> {
        match self {
            Self::Single(cpu) => vec![*cpu],
            Self::Set(cpus) => cpus.clone(),
        }
    }
}

/// Periodic status reporting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Interval between status log lines.
    #[serde(with = "humantime_serde")]
    pub status_interval: Duration,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            status_interval: Duration::from_secs(60),
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File I/O error.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path to the configuration file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// TOML parsing error.
    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialization error.
    #[error("failed to serialize TOML: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Serde helper for `Duration` fields written as "30us", "1m", ...
mod humantime_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*duration).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
