//! Cooperative cancellation for the enrichment loops.
//!
//! The loops check the token between items. An in-flight remote call always
//! runs to completion before the abort is honored.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::flag;

use crate::error::OttError;

/// Exit status for an interrupted, resumable run.
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    /// Routes SIGINT/SIGTERM into this token. A second signal while the
    /// token is already set terminates the process with status 130.
    pub fn register_signals(&self) -> Result<(), OttError> {
        for signal in [SIGINT, SIGTERM] {
            flag::register_conditional_shutdown(
                signal,
                i32::from(INTERRUPTED_EXIT_CODE),
                Arc::clone(&self.cancelled),
            )
            .map_err(|err| OttError::Signal(format!("{signal}: {err}")))?;
            flag::register(signal, Arc::clone(&self.cancelled))
                .map_err(|err| OttError::Signal(format!("{signal}: {err}")))?;
        }
        Ok(())
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloned_token_shares_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(!clone.is_cancelled());
        token.cancel();
        assert!(clone.is_cancelled());
    }
}
