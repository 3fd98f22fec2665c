//! Cooperative cancellation token.
//!
//! Set-once and monotonic: once raised the token never reads false again,
//! so a check loop can never observe a spurious un-cancel. Clones share the
//! same flag. Raised by the signal bridge, the batch time budget, or a
//! scheduler-fatal worker failure; checked by workers between fragments and
//! by sleep loops.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    raised: Arc<AtomicBool>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the token. Idempotent; there is no way to lower it.
    pub fn cancel(&self) {
        self.raised.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.raised.load(Ordering::Acquire)
    }
}
