//! Cooperative stop signalling between the controller, the scan worker and
//! Ctrl-C.

use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Bumped by the SIGINT handler. Tokens armed through [`InterruptGuard`]
/// compare it against the value seen when they were armed.
static INTERRUPTS: AtomicU64 = AtomicU64::new(0);

const NOT_ARMED: u64 = u64::MAX;

#[derive(Debug)]
struct Flags {
    stop: AtomicBool,
    interrupted: AtomicBool,
    armed_at: AtomicU64,
}

/// Stop flag shared by a controller and its worker.
///
/// A fresh token is set, meaning "idle". It is cleared when a run starts and
/// set again when a stop is requested, on Ctrl-C, or on timeout.
#[derive(Clone, Debug)]
pub struct CancelToken {
    inner: Arc<Flags>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Flags {
                stop: AtomicBool::new(true),
                interrupted: AtomicBool::new(false),
                armed_at: AtomicU64::new(NOT_ARMED),
            }),
        }
    }

    pub fn set(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
    }

    pub fn clear(&self) {
        self.inner.interrupted.store(false, Ordering::SeqCst);
        self.inner.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.poll_interrupt();
        self.inner.stop.load(Ordering::SeqCst)
    }

    /// Whether the stop came from Ctrl-C since the last [`clear`](Self::clear).
    pub fn was_interrupted(&self) -> bool {
        self.poll_interrupt();
        self.inner.interrupted.load(Ordering::SeqCst)
    }

    /// Folds a pending Ctrl-C into the flags. Returns `true` only for the
    /// call that first sees it, which also logs it.
    fn poll_interrupt(&self) -> bool {
        let armed_at = self.inner.armed_at.load(Ordering::SeqCst);
        if armed_at == NOT_ARMED || INTERRUPTS.load(Ordering::SeqCst) == armed_at {
            return false;
        }
        self.inner.stop.store(true, Ordering::SeqCst);
        let first = !self.inner.interrupted.swap(true, Ordering::SeqCst);
        if first {
            info!("Pressed Ctrl-C. Stopping scan...");
        }
        first
    }
}

/// Routes Ctrl-C into a [`CancelToken`] instead of killing the process while
/// it is alive. A second Ctrl-C gets the default behaviour. Dropping the guard
/// restores the default handler.
#[derive(Debug)]
pub struct InterruptGuard {
    token: CancelToken,
}

impl InterruptGuard {
    pub fn install(token: &CancelToken) -> Self {
        token
            .inner
            .armed_at
            .store(INTERRUPTS.load(Ordering::SeqCst), Ordering::SeqCst);
        set_handler(true);
        Self {
            token: token.clone(),
        }
    }
}

impl Drop for InterruptGuard {
    fn drop(&mut self) {
        set_handler(false);
        // Keep a Ctrl-C that already arrived visible to the token.
        self.token.poll_interrupt();
        self.token.inner.armed_at.store(NOT_ARMED, Ordering::SeqCst);
    }
}

#[cfg(unix)]
extern "C" fn on_sigint(_signum: libc::c_int) {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
    // SAFETY: signal() is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, libc::SIG_DFL);
    }
}

#[cfg(unix)]
fn set_handler(capture: bool) {
    let handler = if capture {
        on_sigint as extern "C" fn(libc::c_int) as libc::sighandler_t
    } else {
        libc::SIG_DFL
    };
    // SAFETY: installs a handler that only touches an atomic.
    let previous = unsafe { libc::signal(libc::SIGINT, handler) };
    if previous == libc::SIG_ERR {
        debug!("Could not change SIGINT handler");
    }
}

#[cfg(not(unix))]
fn set_handler(_capture: bool) {
    debug!("Ctrl-C capture is not supported on this platform");
}

/// Delivers a synthetic Ctrl-C to armed tokens.
#[cfg(test)]
pub(crate) fn simulate_interrupt() {
    INTERRUPTS.fetch_add(1, Ordering::SeqCst);
}
