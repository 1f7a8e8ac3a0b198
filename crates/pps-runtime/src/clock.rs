//! System wall clock.

use pps_common::{WallClock, WallTime};

/// `CLOCK_REALTIME`, the clock pulses are aligned to.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl SystemClock {
    /// Create a handle to the system wall clock.
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl WallClock for SystemClock {
    #[inline]
    fn now(&self) -> WallTime {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // SAFETY: `ts` is a valid out-pointer and CLOCK_REALTIME always exists,
        // so clock_gettime cannot fail here.
        unsafe {
            libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        }
        WallTime::new(ts.tv_sec as i64, ts.tv_nsec as i64)
    }
}

#[cfg(not(unix))]
impl WallClock for SystemClock {
    fn now(&self) -> WallTime {
        let since_epoch = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        WallTime::new(since_epoch.as_secs() as i64, i64::from(since_epoch.subsec_nanos()))
    }
}
