//! Absolute wall-clock deadline timers.
//!
//! A timer owns its handler while armed. Each expiry calls the handler with
//! the deadline it was armed for, and the handler answers with the next
//! deadline. [`DeadlineTimer::cancel`] does not return until no expiry is
//! running and none can start, and it hands the handler back, so whatever
//! the handler owns (the output line) can only be touched again after the
//! timer is quiescent.

use crate::clock::SystemClock;
use crate::realtime::init_realtime;
use pps_common::{PpsError, PpsResult, RealtimeConfig, WallClock, WallTime};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use tracing::{debug, error};

/// Longest single sleep before the cancel flag is checked again.
const CANCEL_POLL_NS: i64 = 50_000_000;

/// What a handler wants after an expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Fire again at this absolute deadline.
    Rearm(WallTime),
    /// Stop firing.
    Stop,
}

/// Callback run on each timer expiry.
pub trait ExpiryHandler: Send + 'static {
    /// Called with the deadline the timer was armed for.
    fn on_expiry(&mut self, requested: WallTime) -> TimerAction;
}

/// A one-shot absolute timer on `CLOCK_REALTIME` that the handler re-arms.
pub trait DeadlineTimer<H: ExpiryHandler> {
    /// Hand `handler` to the timer and arm it for `deadline`.
    ///
    /// # Errors
    ///
    /// Fails if the timer is already armed or cannot be started.
    fn arm_absolute(&mut self, deadline: WallTime, handler: H) -> PpsResult<()>;

    /// Stop the timer, waiting for any in-flight expiry to finish.
    ///
    /// Returns the handler, or `None` if the timer was not armed or its
    /// handler was lost.
    fn cancel(&mut self) -> Option<H>;
}

/// Deadline timer backed by a dedicated thread.
///
/// The thread applies the real-time configuration to itself, then sleeps
/// with `clock_nanosleep(CLOCK_REALTIME, TIMER_ABSTIME)` so that a wall
/// clock step wakes it at the new wall time, not after the old interval.
pub struct ThreadTimer<H> {
    realtime: RealtimeConfig,
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<H>>,
}

impl<H: ExpiryHandler> ThreadTimer<H> {
    /// Timer whose thread applies `realtime` before the first expiry.
    pub fn new(realtime: RealtimeConfig) -> Self {
        Self {
            realtime,
            stop: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    /// Whether a timer thread is currently running.
    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl<H: ExpiryHandler> DeadlineTimer<H> for ThreadTimer<H> {
    fn arm_absolute(&mut self, deadline: WallTime, mut handler: H) -> PpsResult<()> {
        if self.handle.is_some() {
            return Err(PpsError::Timer("timer already armed".into()));
        }

        self.stop.store(false, Ordering::Release);
        let stop = Arc::clone(&self.stop);
        let realtime = self.realtime.clone();
        let (setup_tx, setup_rx) = mpsc::sync_channel(1);

        let handle = thread::Builder::new()
            .name("pps-timer".into())
            .spawn(move || {
                let setup = init_realtime(&realtime).map(|_| ());
                let ready = setup.is_ok();
                let _ = setup_tx.send(setup);
                if !ready {
                    return handler;
                }

                let clock = SystemClock::new();
                let mut deadline = deadline;
                while sleep_until(&clock, deadline, &stop) {
                    match handler.on_expiry(deadline) {
                        TimerAction::Rearm(next) => deadline = next,
                        TimerAction::Stop => break,
                    }
                }
                debug!("Timer thread exiting");
                handler
            })
            .map_err(|e| PpsError::Timer(format!("failed to spawn timer thread: {e}")))?;

        let setup = setup_rx
            .recv()
            .unwrap_or_else(|_| Err(PpsError::Timer("timer thread exited during setup".into())));
        if let Err(e) = setup {
            let _ = handle.join();
            return Err(e);
        }

        debug!(%deadline, "Timer armed");
        self.handle = Some(handle);
        Ok(())
    }

    fn cancel(&mut self) -> Option<H> {
        let handle = self.handle.take()?;
        self.stop.store(true, Ordering::Release);
        match handle.join() {
            Ok(handler) => Some(handler),
            Err(_) => {
                error!("Timer thread panicked");
                None
            }
        }
    }
}

impl<H> Drop for ThreadTimer<H> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.stop.store(true, Ordering::Release);
            let _ = handle.join();
        }
    }
}

/// Sleep until `deadline` on the wall clock.
///
/// Returns `false` if `stop` was raised first.
fn sleep_until<C: WallClock>(clock: &C, deadline: WallTime, stop: &AtomicBool) -> bool {
    loop {
        if stop.load(Ordering::Acquire) {
            return false;
        }
        let now = clock.now();
        let remaining = deadline.nanos_since(now);
        if remaining <= 0 {
            return true;
        }
        let wake = if remaining > CANCEL_POLL_NS {
            now.add_nanos(CANCEL_POLL_NS)
        } else {
            deadline
        };
        sleep_until_absolute(wake);
    }
}

#[cfg(target_os = "linux")]
fn sleep_until_absolute(wake: WallTime) {
    let ts = libc::timespec {
        tv_sec: wake.sec() as libc::time_t,
        tv_nsec: wake.nsec() as libc::c_long,
    };
    // SAFETY: `ts` is a valid normalized timespec and the remainder pointer
    // may be null for absolute sleeps. EINTR simply returns early and the
    // caller re-checks the clock.
    unsafe {
        libc::clock_nanosleep(
            libc::CLOCK_REALTIME,
            libc::TIMER_ABSTIME,
            &ts,
            std::ptr::null_mut(),
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn sleep_until_absolute(wake: WallTime) {
    let remaining = wake.nanos_since(SystemClock::new().now());
    if remaining > 0 {
        thread::sleep(std::time::Duration::from_nanos(remaining as u64));
    }
}

/// Deadline timer fired by hand, for simulation and tests.
///
/// Clones share the same timer, so a handle kept outside can fire or
/// inspect a timer that was moved into a generator. Firing holds the
/// timer's lock for the whole expiry, so a concurrent `cancel` waits for it
/// exactly like a real in-flight callback.
pub struct ManualTimer<H> {
    inner: Arc<Mutex<ManualState<H>>>,
}

struct ManualState<H> {
    handler: Option<H>,
    deadline: Option<WallTime>,
    fired: u64,
}

impl<H> Clone for ManualTimer<H> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<H: ExpiryHandler> Default for ManualTimer<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H: ExpiryHandler> ManualTimer<H> {
    /// An unarmed timer.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                handler: None,
                deadline: None,
                fired: 0,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ManualState<H>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deadline the timer is armed for, if any.
    pub fn deadline(&self) -> Option<WallTime> {
        self.lock().deadline
    }

    /// Number of expiries delivered so far.
    pub fn fired(&self) -> u64 {
        self.lock().fired
    }

    /// Whether a handler is armed.
    pub fn is_armed(&self) -> bool {
        self.lock().deadline.is_some()
    }

    /// Deliver one expiry at the armed deadline.
    ///
    /// Returns the deadline the handler re-armed for, or `None` if the timer
    /// was not armed or the handler stopped it.
    pub fn fire(&self) -> Option<WallTime> {
        let mut state = self.lock();
        let requested = state.deadline?;
        let action = state.handler.as_mut()?.on_expiry(requested);
        state.fired += 1;
        state.deadline = match action {
            TimerAction::Rearm(next) => Some(next),
            TimerAction::Stop => None,
        };
        state.deadline
    }
}

impl<H: ExpiryHandler> DeadlineTimer<H> for ManualTimer<H> {
    fn arm_absolute(&mut self, deadline: WallTime, handler: H) -> PpsResult<()> {
        let mut state = self.lock();
        if state.handler.is_some() {
            return Err(PpsError::Timer("timer already armed".into()));
        }
        state.handler = Some(handler);
        state.deadline = Some(deadline);
        Ok(())
    }

    fn cancel(&mut self) -> Option<H> {
        let mut state = self.lock();
        state.deadline = None;
        state.handler.take()
    }
}
