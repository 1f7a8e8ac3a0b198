//! Bounded non-preemptible sections.
//!
//! The pulse loop reads the clock and spins on it with preemption blocked:
//! a clock read costs well under a microsecond, while an interrupt or
//! signal handler taken mid-spin can cost arbitrarily more and lands
//! directly in the pulse edge.
//!
//! [`CriticalSection`] is an RAII guard. Preemption is blocked when it is
//! created and restored when it drops, on every exit path. Code holding a
//! guard must not allocate, log, sleep, or block; the window is bounded by
//! roughly the pulse width plus two safety margins.

#[cfg(unix)]
use nix::sys::signal::{pthread_sigmask, SigSet, SigmaskHow};

/// Platform hook for blocking and restoring preemption on the current thread.
pub trait PreemptionControl: Send {
    /// State needed to undo `save_and_disable`.
    type Saved;

    /// Block preemption and return the previous state.
    fn save_and_disable(&self) -> Self::Saved;

    /// Restore the state returned by `save_and_disable`.
    fn restore(&self, saved: Self::Saved);
}

/// Proof that preemption is blocked on this thread.
///
/// Functions that must only run inside a critical section take a
/// `&CriticalSection` argument.
#[must_use = "preemption is restored as soon as the guard is dropped"]
pub struct CriticalSection<'a, C: PreemptionControl> {
    control: &'a C,
    saved: Option<C::Saved>,
}

impl<'a, C: PreemptionControl> CriticalSection<'a, C> {
    /// Block preemption until the returned guard is dropped.
    #[inline]
    pub fn enter(control: &'a C) -> Self {
        let saved = control.save_and_disable();
        Self {
            control,
            saved: Some(saved),
        }
    }

    /// Restore preemption now.
    #[inline]
    pub fn exit(self) {}
}

impl<C: PreemptionControl> Drop for CriticalSection<'_, C> {
    #[inline]
    fn drop(&mut self) {
        if let Some(saved) = self.saved.take() {
            self.control.restore(saved);
        }
    }
}

/// Blocks every signal on the calling thread for the duration of a section.
///
/// Together with a `SCHED_FIFO` timer thread pinned to an isolated CPU this
/// is the closest userspace gets to masking local interrupts.
#[cfg(unix)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SignalMask;

#[cfg(unix)]
impl PreemptionControl for SignalMask {
    type Saved = Option<SigSet>;

    fn save_and_disable(&self) -> Self::Saved {
        let mut previous = SigSet::empty();
        pthread_sigmask(SigmaskHow::SIG_BLOCK, Some(&SigSet::all()), Some(&mut previous))
            .ok()
            .map(|()| previous)
    }

    fn restore(&self, saved: Self::Saved) {
        if let Some(previous) = saved {
            // Cannot fail with a valid set and how.
            let _ = pthread_sigmask(SigmaskHow::SIG_SETMASK, Some(&previous), None);
        }
    }
}

/// No-op control for simulation, where nothing can preempt the loop.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoPreemption;

impl PreemptionControl for NoPreemption {
    type Saved = ();

    fn save_and_disable(&self) -> Self::Saved {}

    fn restore(&self, _saved: Self::Saved) {}
}
