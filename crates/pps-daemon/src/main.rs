//! pps-gen daemon entry point.
//!
//! Loads configuration, attaches the PPS generator to the configured line
//! (or a simulated one), and keeps it running until a signal or the
//! optional run limit stops it.

mod diagnostics;
mod signals;

use anyhow::{bail, Context, Result};
use clap::Parser;
use pps_common::{GeneratorConfig, LineConfig, PulseWidth};
use pps_gpio::{discover_line, OutputPin, SimulatedPin};
use pps_runtime::{DispatchLatency, PpsGenerator, SignalMask, SystemClock, ThreadTimer};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::diagnostics::{ChannelInfo, DiagnosticsCollector};
use crate::signals::{wait_for_shutdown, SignalHandler};

const CONFIG_ENV: &str = "PPS_GEN_CONFIG_PATH";
const SYSTEM_CONFIG_PATH: &str = "/etc/pps-gen/config.toml";
const LOCAL_CONFIG_PATH: &str = "config/default.toml";

/// Main-loop poll period for signals and the run limit.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// pps-gen command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "pps-gen",
    about = "GPIO pulse-per-second generator aligned to the system wall clock",
    version,
    long_about = None
)]
struct Args {
    /// Path to a configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Pulse width in nanoseconds (1..=100000).
    #[arg(long, short = 'w', value_name = "NS")]
    width: Option<u64>,

    /// GPIO line number (overrides the config file).
    #[arg(long, short = 'g', value_name = "N")]
    gpio: Option<u32>,

    /// Pulse a simulated line instead of real hardware.
    #[arg(long, short = 's')]
    simulated: bool,

    /// Stop after this long (e.g. "10s", "5m").
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    run_for: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,

    /// Print the final diagnostics snapshot as JSON on exit.
    #[arg(long)]
    status_json: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting pps-gen");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);
    let width = config.validate().context("Invalid configuration")?;

    info!(
        width_ns = width.as_nanos(),
        line = ?config.line.as_ref().map(|l| l.gpio),
        simulated = args.simulated,
        "Configuration loaded"
    );

    let signal_handler = SignalHandler::new().context("Failed to set up signal handlers")?;
    run_daemon(&config, width, &args, &signal_handler)
}

/// Install the `tracing` subscriber; `RUST_LOG` wins over `--log-level`.
fn init_logging(level: &str) {
    let filter = format!("pps_gen={level},pps_runtime={level},pps_gpio={level},pps_common={level}");

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_names(true)
        .init();
}

/// Load configuration; the first existing source wins.
///
/// 1. `--config`
/// 2. `PPS_GEN_CONFIG_PATH`
/// 3. `/etc/pps-gen/config.toml`
/// 4. `config/default.toml`
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<GeneratorConfig> {
    if let Some(path) = &args.config {
        info!(?path, "Loading config from command line");
        return GeneratorConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()));
    }

    if let Ok(env_path) = std::env::var(CONFIG_ENV) {
        let path = PathBuf::from(&env_path);
        if path.exists() {
            info!(?path, "Loading config from {CONFIG_ENV}");
            return GeneratorConfig::from_file(&path)
                .with_context(|| format!("Failed to load config from {CONFIG_ENV}={env_path}"));
        }
        warn!(path = %env_path, "{CONFIG_ENV} set but file does not exist");
    }

    for path in [SYSTEM_CONFIG_PATH, LOCAL_CONFIG_PATH].map(PathBuf::from) {
        if path.exists() {
            info!(?path, "Loading config");
            return GeneratorConfig::from_file(&path)
                .with_context(|| format!("Failed to load config from {}", path.display()));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(GeneratorConfig::default())
}

/// Fold command-line overrides into the loaded configuration.
fn apply_overrides(config: &mut GeneratorConfig, args: &Args) {
    if let Some(width_ns) = args.width {
        config.pulse_width = Duration::from_nanos(width_ns);
    }
    if let Some(gpio) = args.gpio {
        match &mut config.line {
            Some(line) => line.gpio = gpio,
            None => config.line = Some(LineConfig::new(gpio)),
        }
    }
}

/// Open the output line named by the configuration.
fn open_pin(config: &GeneratorConfig, simulated: bool) -> Result<Box<dyn OutputPin>> {
    if simulated {
        info!("Using simulated PPS line");
        return Ok(Box::new(SimulatedPin::counting()));
    }

    let line = discover_line(config).context("No PPS output line")?;
    open_line(line)
}

#[cfg(unix)]
fn open_line(line: &LineConfig) -> Result<Box<dyn OutputPin>> {
    let pin = pps_gpio::SysfsPin::open(line)
        .with_context(|| format!("Failed to open GPIO {}", line.gpio))?;
    Ok(Box::new(pin))
}

#[cfg(not(unix))]
fn open_line(line: &LineConfig) -> Result<Box<dyn OutputPin>> {
    bail!("GPIO {} unavailable: sysfs GPIO requires a Unix host", line.gpio)
}

/// Attach, run until told to stop, detach.
fn run_daemon(
    config: &GeneratorConfig,
    width: PulseWidth,
    args: &Args,
    signal_handler: &SignalHandler,
) -> Result<()> {
    if wait_for_shutdown(signal_handler, Duration::ZERO) {
        bail!("Shutdown requested before the generator was attached");
    }

    let pin = open_pin(config, args.simulated)?;
    let latency = DispatchLatency::default();
    let generator = PpsGenerator::attach(
        pin,
        SystemClock::new(),
        SignalMask,
        ThreadTimer::new(config.realtime.clone()),
        width,
        latency.clone(),
    )
    .context("Failed to attach PPS generator")?;

    let mut diagnostics = DiagnosticsCollector::new(
        generator.stats(),
        latency,
        ChannelInfo {
            line: generator.label().to_owned(),
            pulse_width_ns: width.as_nanos(),
            calibrated_pin_write_ns: generator.calibrated_pin_write_ns(),
        },
    );

    let started = Instant::now();
    let mut last_status = Instant::now();
    let status_interval = config.diagnostics.status_interval;

    info!(first_deadline = %generator.first_deadline(), "Entering main loop");
    loop {
        if wait_for_shutdown(signal_handler, POLL_INTERVAL) {
            info!("Shutdown requested, detaching generator");
            break;
        }
        if signal_handler.take_hangup() {
            info!("SIGHUP received; pulse width is fixed while running, nothing to reload");
        }
        if args.run_for.is_some_and(|limit| started.elapsed() >= limit) {
            info!(elapsed = ?started.elapsed(), "Run limit reached, detaching generator");
            break;
        }
        if last_status.elapsed() >= status_interval {
            let snapshot = diagnostics.snapshot(generator.state());
            info!(
                health = %snapshot.health,
                pulses = snapshot.pulses.pulses,
                missed = snapshot.pulses.missed,
                rescheduled = snapshot.pulses.rescheduled,
                faults = snapshot.pulses.faults,
                avg_dispatch_latency_ns = snapshot.avg_dispatch_latency_ns,
                last_pin_write_ns = snapshot.pulses.last_pin_write_ns,
                next_deadline = %snapshot.pulses.next_deadline,
                "Periodic status"
            );
            last_status = Instant::now();
        }
    }

    let stats = generator.stats();
    let detached = generator.detach();
    if let Err(e) = &detached {
        warn!(error = %e, "Generator detach reported an error");
    }

    let final_state = if detached.is_ok() {
        pps_common::ChannelState::Stopped
    } else {
        pps_common::ChannelState::Fault
    };
    let snapshot = diagnostics.snapshot(final_state);
    if args.status_json {
        println!("{}", snapshot.to_json().context("Failed to render status JSON")?);
    }

    info!(
        pulses = stats.pulses(),
        missed = stats.missed(),
        rescheduled = stats.rescheduled(),
        signals = signal_handler.state().signal_count(),
        uptime_secs = snapshot.uptime_secs,
        "Daemon shutdown complete"
    );
    detached.context("Failed to release PPS line")
}
