//! Linux sysfs GPIO line driver.
//!
//! Uses the `/sys/class/gpio` interface:
//! - `export` / `unexport` to claim and return the line
//! - `gpioN/active_low` for polarity
//! - `gpioN/direction` set to `low` (output, initially inactive)
//! - `gpioN/value` kept open and written with positional writes
//!
//! The value file stays open for the lifetime of the pin so a level
//! change is a single `pwrite` with no path lookup.

use crate::{OutputPin, PinLevel};
use pps_common::{LineConfig, PpsError, PpsResult};
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Attempts to configure a freshly exported line before giving up.
/// udev may need a moment to fix up permissions after export.
const EXPORT_SETTLE_ATTEMPTS: u32 = 20;
const EXPORT_SETTLE_DELAY: Duration = Duration::from_millis(10);

/// A GPIO line driven through sysfs.
#[derive(Debug)]
pub struct SysfsPin {
    gpio: u32,
    root: PathBuf,
    value: Option<File>,
    exported_here: bool,
}

impl SysfsPin {
    /// Export (if needed) and configure the line as an output driven low.
    ///
    /// # Errors
    ///
    /// Returns a GPIO error if the line cannot be exported, configured or opened.
    /// A line exported by this call is unexported again on failure.
    pub fn open(line: &LineConfig) -> PpsResult<Self> {
        let dir = line_dir(&line.sysfs_root, line.gpio);
        let exported_here = if dir.exists() {
            debug!(gpio = line.gpio, "GPIO line already exported");
            false
        } else {
            write_attr(&line.sysfs_root.join("export"), &line.gpio.to_string())?;
            true
        };

        let mut pin = Self {
            gpio: line.gpio,
            root: line.sysfs_root.clone(),
            value: None,
            exported_here,
        };

        // On failure `pin` is dropped here, which unexports the line.
        pin.configure(&dir, line.active_low)?;

        info!(
            gpio = line.gpio,
            active_low = line.active_low,
            exported = exported_here,
            "PPS output line configured"
        );
        Ok(pin)
    }

    fn configure(&mut self, dir: &Path, active_low: bool) -> PpsResult<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = write_attr(&dir.join("active_low"), if active_low { "1" } else { "0" })
                .and_then(|()| write_attr(&dir.join("direction"), "low"));
            match result {
                Ok(()) => break,
                Err(e) if self.exported_here && attempt < EXPORT_SETTLE_ATTEMPTS => {
                    debug!(gpio = self.gpio, attempt, error = %e, "GPIO line not ready yet");
                    thread::sleep(EXPORT_SETTLE_DELAY);
                }
                Err(e) => return Err(e),
            }
        }

        let value_path = dir.join("value");
        let file = OpenOptions::new()
            .write(true)
            .open(&value_path)
            .map_err(|e| PpsError::Gpio(format!("cannot open {}: {e}", value_path.display())))?;
        self.value = Some(file);
        Ok(())
    }

    /// Kernel GPIO number of this line.
    pub fn gpio(&self) -> u32 {
        self.gpio
    }
}

impl OutputPin for SysfsPin {
    #[inline]
    fn set_level(&mut self, level: PinLevel) -> PpsResult<()> {
        let gpio = self.gpio;
        let file = self
            .value
            .as_ref()
            .ok_or(PpsError::LineReleased { gpio })?;
        let byte: &[u8] = match level {
            PinLevel::High => b"1",
            PinLevel::Low => b"0",
        };
        file.write_at(byte, 0).map(|_| ()).map_err(|e| PpsError::LineWrite {
            gpio,
            errno: e.raw_os_error().unwrap_or(0),
        })
    }

    fn release(&mut self) -> PpsResult<()> {
        let was_open = if let Some(file) = self.value.take() {
            if let Err(e) = file.write_at(b"0", 0) {
                warn!(gpio = self.gpio, error = %e, "Failed to drive line low on release");
            }
            true
        } else {
            false
        };

        if self.exported_here {
            self.exported_here = false;
            write_attr(&self.root.join("unexport"), &self.gpio.to_string())?;
            debug!(gpio = self.gpio, "GPIO line unexported");
        }
        if was_open {
            info!(gpio = self.gpio, "PPS output line released");
        }
        Ok(())
    }

    fn label(&self) -> String {
        format!("gpio{}", self.gpio)
    }
}

impl Drop for SysfsPin {
    fn drop(&mut self) {
        if self.value.is_some() || self.exported_here {
            if let Err(e) = self.release() {
                warn!(gpio = self.gpio, error = %e, "Failed to release line on drop");
            }
        }
    }
}

fn line_dir(root: &Path, gpio: u32) -> PathBuf {
    root.join(format!("gpio{gpio}"))
}

fn write_attr(path: &Path, value: &str) -> PpsResult<()> {
    fs::write(path, value)
        .map_err(|e| PpsError::Gpio(format!("cannot write {value:?} to {}: {e}", path.display())))
}
