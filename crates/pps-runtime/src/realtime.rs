//! Real-time setup for the timer thread.
//!
//! Applied from inside the thread that runs the pulse loop, so scheduling
//! policy and CPU affinity land on that thread only:
//! - `mlockall` so the loop never takes a page fault mid-pulse
//! - `SCHED_FIFO`/`SCHED_RR` so it preempts ordinary work
//! - CPU affinity so it can sit on an isolated core
//!
//! Missing privileges degrade to a warning unless `fail_fast` is set.

#![allow(unused_imports)] // Linux-only paths

use pps_common::{CpuAffinity, PpsError, PpsResult, RealtimeConfig, SchedPolicy};
use tracing::{debug, error, info, warn};

/// What real-time setup actually achieved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RealtimeStatus {
    /// Memory pages are locked.
    pub memory_locked: bool,
    /// Policy in effect, if one was applied.
    pub scheduler_policy: Option<SchedPolicy>,
    /// RT priority in effect.
    pub scheduler_priority: Option<u8>,
    /// CPUs the thread is pinned to.
    pub cpu_affinity: Option<Vec<usize>>,
}

/// Apply `config` to the calling thread.
///
/// # Errors
///
/// Returns [`PpsError::Realtime`] when `fail_fast` is set and privileges
/// are missing, or when a system call fails for a reason other than
/// missing privileges.
pub fn init_realtime(config: &RealtimeConfig) -> PpsResult<RealtimeStatus> {
    if !config.enabled {
        debug!("Real-time setup disabled in configuration");
        return Ok(RealtimeStatus::default());
    }

    if config.fail_fast {
        validate_rt_capabilities(config)?;
    }

    let memory_locked = if config.lock_memory {
        lock_memory()?
    } else {
        false
    };
    let (scheduler_policy, scheduler_priority) = set_scheduler(config.policy, config.priority)?;
    let cpu_affinity = match &config.cpu_affinity {
        Some(affinity) => set_cpu_affinity(affinity)?,
        None => None,
    };

    let status = RealtimeStatus {
        memory_locked,
        scheduler_policy,
        scheduler_priority,
        cpu_affinity,
    };
    info!(?status, "Timer thread real-time setup complete");
    Ok(status)
}

#[cfg(target_os = "linux")]
fn lock_memory() -> PpsResult<bool> {
    use nix::errno::Errno;
    use nix::sys::mman::{mlockall, MlockAllFlags};

    match mlockall(MlockAllFlags::MCL_CURRENT | MlockAllFlags::MCL_FUTURE) {
        Ok(()) => {
            debug!("Memory locked");
            Ok(true)
        }
        Err(Errno::EPERM) => {
            warn!("mlockall denied (no CAP_IPC_LOCK); page faults may delay pulses");
            Ok(false)
        }
        Err(e) => Err(PpsError::Realtime(format!("mlockall failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn lock_memory() -> PpsResult<bool> {
    warn!("mlockall not available on this platform");
    Ok(false)
}

/// Clamp an RT priority into `1..=99`.
#[must_use]
pub fn clamp_priority(priority: u8) -> u8 {
    priority.clamp(1, 99)
}

#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> PpsResult<(Option<SchedPolicy>, Option<u8>)> {
    let linux_policy = match policy {
        SchedPolicy::Fifo => libc::SCHED_FIFO,
        SchedPolicy::Rr => libc::SCHED_RR,
        SchedPolicy::Other => return Ok((Some(SchedPolicy::Other), None)),
    };

    let clamped = clamp_priority(priority);
    if clamped != priority {
        warn!(requested = priority, clamped, "Scheduler priority clamped");
    }

    let param = libc::sched_param {
        sched_priority: i32::from(clamped),
    };
    // SAFETY: pid 0 is the calling thread and `param` is a valid sched_param.
    let rc = unsafe { libc::sched_setscheduler(0, linux_policy, &param) };
    if rc == -1 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::EPERM) {
            warn!(?policy, "sched_setscheduler denied (no CAP_SYS_NICE); pulse timing will jitter");
            return Ok((None, None));
        }
        return Err(PpsError::Realtime(format!("sched_setscheduler failed: {err}")));
    }

    debug!(?policy, priority = clamped, "Scheduler configured");
    Ok((Some(policy), Some(clamped)))
}

#[cfg(not(target_os = "linux"))]
fn set_scheduler(policy: SchedPolicy, priority: u8) -> PpsResult<(Option<SchedPolicy>, Option<u8>)> {
    warn!(?policy, priority, "Real-time scheduling not available on this platform");
    Ok((None, None))
}

#[cfg(target_os = "linux")]
fn set_cpu_affinity(affinity: &CpuAffinity) -> PpsResult<Option<Vec<usize>>> {
    use nix::errno::Errno;
    use nix::sched::{sched_setaffinity, CpuSet};
    use nix::unistd::Pid;

    let cpus = affinity.cpus();
    if cpus.is_empty() {
        return Ok(None);
    }

    let mut set = CpuSet::new();
    for &cpu in &cpus {
        set.set(cpu)
            .map_err(|e| PpsError::Realtime(format!("invalid CPU index {cpu}: {e}")))?;
    }

    match sched_setaffinity(Pid::from_raw(0), &set) {
        Ok(()) => {
            debug!(?cpus, "CPU affinity set");
            Ok(Some(cpus))
        }
        Err(Errno::EINVAL) => {
            warn!(?cpus, "CPU affinity rejected; some CPUs may not exist");
            Ok(None)
        }
        Err(e) => Err(PpsError::Realtime(format!("sched_setaffinity failed: {e}"))),
    }
}

#[cfg(not(target_os = "linux"))]
fn set_cpu_affinity(_affinity: &CpuAffinity) -> PpsResult<Option<Vec<usize>>> {
    warn!("CPU affinity not available on this platform");
    Ok(None)
}

/// Privileges relevant to real-time setup.
#[derive(Debug, Clone, Default)]
pub struct RtCapabilities {
    /// Effective uid is 0.
    pub is_root: bool,
    /// Soft `RLIMIT_RTPRIO`.
    pub rtprio_limit: Option<u64>,
    /// Soft `RLIMIT_MEMLOCK`.
    pub memlock_limit: Option<u64>,
}

impl RtCapabilities {
    /// An RT policy is likely to be accepted.
    pub fn can_use_rt_scheduling(&self) -> bool {
        self.is_root || self.rtprio_limit.is_some_and(|l| l > 0)
    }

    /// `mlockall` is likely to be accepted.
    pub fn can_lock_memory(&self) -> bool {
        #[cfg(unix)]
        {
            self.is_root || self.memlock_limit == Some(libc::RLIM_INFINITY as u64)
        }
        #[cfg(not(unix))]
        {
            self.is_root
        }
    }
}

/// Query the calling process's RT-related privileges.
#[cfg(target_os = "linux")]
#[allow(unsafe_code)]
pub fn check_rt_capabilities() -> RtCapabilities {
    let read_limit = |resource| {
        let mut rlim = libc::rlimit {
            rlim_cur: 0,
            rlim_max: 0,
        };
        // SAFETY: `rlim` is a valid out-pointer for getrlimit.
        (unsafe { libc::getrlimit(resource, &mut rlim) } == 0).then_some(rlim.rlim_cur)
    };

    RtCapabilities {
        // SAFETY: geteuid has no preconditions.
        is_root: unsafe { libc::geteuid() } == 0,
        rtprio_limit: read_limit(libc::RLIMIT_RTPRIO),
        memlock_limit: read_limit(libc::RLIMIT_MEMLOCK),
    }
}

/// Query the calling process's RT-related privileges.
#[cfg(not(target_os = "linux"))]
pub fn check_rt_capabilities() -> RtCapabilities {
    RtCapabilities::default()
}

/// Fail if the privileges `config` asks for are not available.
///
/// # Errors
///
/// Returns [`PpsError::Realtime`] listing every missing privilege.
pub fn validate_rt_capabilities(config: &RealtimeConfig) -> PpsResult<()> {
    if !config.enabled {
        return Ok(());
    }

    let caps = check_rt_capabilities();
    let mut issues = Vec::new();

    if config.policy != SchedPolicy::Other && !caps.can_use_rt_scheduling() {
        issues.push(format!(
            "cannot use {:?} scheduling: RLIMIT_RTPRIO={:?}, root={}",
            config.policy, caps.rtprio_limit, caps.is_root
        ));
    }
    if config.lock_memory && !caps.can_lock_memory() {
        issues.push(format!(
            "cannot lock memory: RLIMIT_MEMLOCK={:?}, root={}",
            caps.memlock_limit, caps.is_root
        ));
    }

    if issues.is_empty() {
        return Ok(());
    }
    let message = format!("real-time requirements not met: {}", issues.join("; "));
    error!("{message}");
    Err(PpsError::Realtime(message))
}
