//! Bridge from SIGINT/SIGTERM to a pollable flag.
//!
//! The handler only flips a static atomic; promotion onto the cancellation
//! token is the supervisor's job, at poll resolution. The flag is monotonic
//! like the token and never cleared, so a signal that lands between polls is
//! never lost.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tracing::debug;

use trajweld_error::{Result, WeldError};

static SIGNAL_PENDING: AtomicBool = AtomicBool::new(false);

extern "C" fn note_signal(_signum: libc::c_int) {
    SIGNAL_PENDING.store(true, Ordering::SeqCst);
}

/// Process-wide shutdown-signal watcher. Installing more than once is
/// harmless.
#[derive(Debug, Clone, Copy)]
pub struct SignalWatcher(());

impl SignalWatcher {
    /// Install handlers for SIGINT and SIGTERM.
    pub fn install() -> Result<Self> {
        let action = SigAction::new(
            SigHandler::Handler(note_signal),
            SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for sig in [Signal::SIGINT, Signal::SIGTERM] {
            // SAFETY: the handler only stores to a static atomic, which is
            // async-signal-safe.
            unsafe { signal::sigaction(sig, &action) }
                .map_err(|errno| WeldError::Io(io::Error::from_raw_os_error(errno as i32)))?;
        }
        debug!("signal handlers installed for SIGINT and SIGTERM");
        Ok(Self(()))
    }

    /// Whether a shutdown signal has arrived since process start.
    #[must_use]
    pub fn triggered(self) -> bool {
        SIGNAL_PENDING.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
