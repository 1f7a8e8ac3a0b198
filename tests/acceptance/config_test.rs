//! Configuration acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A complete configuration file loads and validates
//! - Out-of-range pulse widths are rejected before any hardware is touched
//! - A missing output line is a configuration error

use pps_common::{
    CpuAffinity, GeneratorConfig, PpsError, SchedPolicy, DEFAULT_PULSE_WIDTH_NS,
};
use pps_gpio::discover_line;
use std::io::Write;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_full_config_file_loads() {
    let file = write_config(
        r#"
pulse_width = "20us"

[line]
gpio = 17
active_low = true

[realtime]
policy = "rr"
priority = 70
cpu_affinity = [2, 3]
fail_fast = true

[diagnostics]
status_interval = "5m"
"#,
    );

    let config = GeneratorConfig::from_file(file.path()).unwrap();
    assert_eq!(config.validate().unwrap().as_nanos(), 20_000);

    let line = discover_line(&config).unwrap();
    assert_eq!(line.gpio, 17);
    assert!(line.active_low);

    assert_eq!(config.realtime.policy, SchedPolicy::Rr);
    assert_eq!(config.realtime.priority, 70);
    assert_eq!(config.realtime.cpu_affinity, Some(CpuAffinity::Set(vec![2, 3])));
    assert!(config.realtime.fail_fast);
    assert!(config.realtime.lock_memory);
    assert_eq!(config.diagnostics.status_interval, Duration::from_secs(300));
}

#[test]
fn test_empty_file_uses_defaults() {
    let file = write_config("");
    let config = GeneratorConfig::from_file(file.path()).unwrap();

    assert_eq!(
        config.validate().unwrap().as_nanos(),
        DEFAULT_PULSE_WIDTH_NS as i64
    );
    assert!(matches!(discover_line(&config), Err(PpsError::Config(_))));
}

#[test]
fn test_out_of_range_width_is_rejected() {
    for width in ["0ns", "100001ns", "1s"] {
        let file = write_config(&format!("pulse_width = \"{width}\"\n"));
        let config = GeneratorConfig::from_file(file.path()).unwrap();
        assert!(
            matches!(
                config.validate(),
                Err(PpsError::PulseWidthOutOfRange { .. })
            ),
            "width {width} accepted"
        );
    }
}

#[test]
fn test_malformed_file_is_an_error() {
    let file = write_config("pulse_width = [\n");
    assert!(GeneratorConfig::from_file(file.path()).is_err());
}

#[test]
fn test_shipped_default_config_is_valid() {
    let path = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("config/default.toml");
    let config = GeneratorConfig::from_file(&path).unwrap();
    assert!(config.validate().is_ok());
}
