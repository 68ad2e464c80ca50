//! Ctrl-C handling.
//!
//! Outside a mutation phase an interrupt exits straight away. Inside one the
//! in-flight subprocess is allowed to finish and the engine stops before the
//! next header write.

use crate::error::{SlotkeeperError, SlotkeeperResult};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Exit status used when an interrupt aborts a read-only phase.
pub const INTERRUPT_EXIT_CODE: i32 = 130;

/// Shared cancellation flag plus a count of active mutation phases.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    mutating: Arc<AtomicUsize>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn in_mutation(&self) -> bool {
        self.mutating.load(Ordering::SeqCst) > 0
    }

    /// Mark the start of a mutation phase until the guard drops.
    pub fn enter_mutation(&self) -> MutationGuard {
        self.mutating.fetch_add(1, Ordering::SeqCst);
        MutationGuard {
            mutating: Arc::clone(&self.mutating),
        }
    }
}

/// Keeps the owning token in mutation mode while alive.
#[derive(Debug)]
pub struct MutationGuard {
    mutating: Arc<AtomicUsize>,
}

impl Drop for MutationGuard {
    fn drop(&mut self) {
        self.mutating.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Process-wide token wired to the Ctrl-C handler.
pub fn global() -> &'static CancelToken {
    static GLOBAL: OnceLock<CancelToken> = OnceLock::new();
    GLOBAL.get_or_init(CancelToken::new)
}

/// Install the SIGINT handler driving [`global`].
pub fn install_handler() -> SlotkeeperResult<()> {
    let token = global().clone();
    ctrlc::set_handler(move || {
        if token.in_mutation() {
            token.cancel();
            eprintln!("\ninterrupt received; letting the current operation finish before stopping");
        } else {
            eprintln!("\ninterrupted");
            std::process::exit(INTERRUPT_EXIT_CODE);
        }
    })
    .map_err(|err| SlotkeeperError::Provider(format!("failed to install Ctrl-C handler: {err}")))
}
