//! Cooperative shutdown on SIGINT/SIGTERM/SIGHUP.
//!
//! The first signal only sets a flag. The relay loop checks it between steps
//! and worker waits poll it, so a run unwinds through its normal exit path and
//! releases its claim and reservations. A second signal exits at once.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

use crate::exit_codes;

/// Shared shutdown flag. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    flag: Arc<AtomicBool>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Route process termination signals to this flag.
    ///
    /// Can be installed once per process.
    pub fn install_signal_handler(&self) -> Result<()> {
        let flag = self.flag.clone();
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                warn!("second termination signal; exiting without cleanup");
                std::process::exit(exit_codes::INTERRUPTED);
            }
            warn!("termination signal received; stopping after cleanup");
        })
        .context("install signal handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let shutdown = Shutdown::new();
        let observer = shutdown.clone();
        assert!(!observer.is_requested());
        shutdown.request();
        assert!(observer.is_requested());
    }
}
