//! Ctrl-C handling.
//!
//! The first interrupt sets a shared [`CancelToken`]; the process wait loop
//! kills the running child and the orchestrator checkpoints and stops. A
//! second interrupt exits immediately.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};

use crate::exit_codes;

/// Cooperative cancellation flag shared between the signal handler and the loop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Install the process-wide Ctrl-C handler. Call once, from `main`.
pub fn install_ctrlc_handler(token: &CancelToken) -> Result<()> {
    let token = token.clone();
    ctrlc::set_handler(move || {
        if token.is_cancelled() {
            eprintln!("\nInterrupted again. Exiting.");
            std::process::exit(exit_codes::CANCELLED);
        }
        eprintln!("\nInterrupt received. Stopping after checkpoint (press Ctrl-C again to force).");
        token.cancel();
    })
    .context("install Ctrl-C handler")
}
