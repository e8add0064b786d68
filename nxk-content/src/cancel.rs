//! Cooperative cancellation for long-running reads.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{NcaError, Result};

/// Shared flag polled between sector-sized units of work.
///
/// Clones observe the same flag, so a token handed to another thread can
/// cancel an in-flight read. Cancellation never corrupts decoder state; a
/// cancelled handle can be used again once the token is reset.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    /// A fresh, un-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation of every operation polling this token.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// Clear a previous cancellation request.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::Relaxed);
    }

    /// Whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Fail with [`NcaError::Cancelled`] if cancellation has been requested.
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(NcaError::Cancelled)
        } else {
            Ok(())
        }
    }
}
