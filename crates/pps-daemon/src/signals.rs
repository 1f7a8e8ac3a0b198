//! Signal handling for the daemon.
//!
//! SIGTERM and SIGINT request shutdown. SIGHUP is recorded and logged
//! only: the pulse width is fixed once the generator is armed, so there is
//! nothing to reload. Handlers only store into atomics; the main loop
//! picks the flags up on its next poll.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

static SHUTDOWN_FLAG: AtomicBool = AtomicBool::new(false);
static HANGUP_FLAG: AtomicBool = AtomicBool::new(false);

/// Signals the daemon reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    /// SIGTERM or SIGINT.
    Terminate,
    /// SIGHUP.
    Hangup,
}

impl std::fmt::Display for SignalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignalKind::Terminate => write!(f, "SIGTERM/SIGINT"),
            SignalKind::Hangup => write!(f, "SIGHUP"),
        }
    }
}

/// Flags shared between the signal poller and the main loop.
#[derive(Debug, Default)]
pub struct SignalState {
    shutdown_requested: AtomicBool,
    hangup_pending: AtomicBool,
    signal_count: AtomicU32,
}

impl SignalState {
    /// No signals seen yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shutdown has been requested.
    #[inline]
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }

    /// Request shutdown.
    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    /// Consume a pending SIGHUP.
    pub fn take_hangup(&self) -> bool {
        self.hangup_pending.swap(false, Ordering::Relaxed)
    }

    fn record(&self, kind: SignalKind) {
        self.signal_count.fetch_add(1, Ordering::Relaxed);
        match kind {
            SignalKind::Terminate => self.request_shutdown(),
            SignalKind::Hangup => self.hangup_pending.store(true, Ordering::Relaxed),
        }
    }

    /// Signals received so far.
    pub fn signal_count(&self) -> u32 {
        self.signal_count.load(Ordering::Relaxed)
    }
}

/// Installs the process signal handlers and exposes their flags.
#[derive(Clone)]
pub struct SignalHandler {
    state: Arc<SignalState>,
}

impl SignalHandler {
    /// Register handlers for SIGTERM, SIGINT and SIGHUP.
    ///
    /// # Errors
    ///
    /// Returns the OS error if a handler cannot be installed.
    pub fn new() -> std::io::Result<Self> {
        #[cfg(unix)]
        register_unix_handlers()?;

        Ok(Self {
            state: Arc::new(SignalState::new()),
        })
    }

    /// Move flags raised by the handlers into the shared state.
    pub fn poll(&self) {
        if SHUTDOWN_FLAG.swap(false, Ordering::Relaxed) {
            info!(signal = %SignalKind::Terminate, "Shutdown signal received");
            self.state.record(SignalKind::Terminate);
        }
        if HANGUP_FLAG.swap(false, Ordering::Relaxed) {
            self.state.record(SignalKind::Hangup);
        }
    }

    /// Shutdown has been requested by a signal or by [`Self::request_shutdown`].
    pub fn shutdown_requested(&self) -> bool {
        self.poll();
        self.state.shutdown_requested()
    }

    /// Consume a pending SIGHUP.
    pub fn take_hangup(&self) -> bool {
        self.poll();
        self.state.take_hangup()
    }

    /// Request shutdown from inside the process.
    pub fn request_shutdown(&self) {
        debug!("Shutdown requested internally");
        self.state.request_shutdown();
    }

    /// Shared flag state.
    pub fn state(&self) -> &SignalState {
        &self.state
    }
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn register_unix_handlers() -> std::io::Result<()> {
    use std::os::raw::c_int;

    extern "C" fn on_terminate(_: c_int) {
        SHUTDOWN_FLAG.store(true, Ordering::Relaxed);
    }

    extern "C" fn on_hangup(_: c_int) {
        HANGUP_FLAG.store(true, Ordering::Relaxed);
    }

    let handlers: [(c_int, extern "C" fn(c_int)); 3] = [
        (libc::SIGTERM, on_terminate),
        (libc::SIGINT, on_terminate),
        (libc::SIGHUP, on_hangup),
    ];
    for (signal, handler) in handlers {
        // SAFETY: the handlers only store into static atomics, which is
        // async-signal-safe.
        let previous = unsafe { libc::signal(signal, handler as libc::sighandler_t) };
        if previous == libc::SIG_ERR {
            return Err(std::io::Error::last_os_error());
        }
    }

    debug!("Signal handlers registered");
    Ok(())
}

/// Wait up to `timeout` for a shutdown request.
///
/// Returns `true` if shutdown was requested.
pub fn wait_for_shutdown(handler: &SignalHandler, timeout: Duration) -> bool {
    const POLL: Duration = Duration::from_millis(50);
    let start = Instant::now();

    loop {
        if handler.shutdown_requested() {
            return true;
        }
        let elapsed = start.elapsed();
        if elapsed >= timeout {
            return false;
        }
        std::thread::sleep(POLL.min(timeout - elapsed));
    }
}
