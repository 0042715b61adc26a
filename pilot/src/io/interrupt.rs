//! Global interrupt flag set by Ctrl-C.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use tracing::warn;

use crate::exit_codes;
use crate::io::process::ProcessRunner;

/// Shared flag checked between steps and while polling commands.
#[derive(Debug, Clone, Default)]
pub struct Interrupt {
    flag: Arc<AtomicBool>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    pub fn set(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Install the process-wide Ctrl-C handler (call once at startup).
    ///
    /// The first interrupt sets the flag and kills every process in the
    /// registry without a grace window. A second interrupt exits immediately.
    pub fn install(&self, runner: &ProcessRunner) -> Result<()> {
        let flag = Arc::clone(&self.flag);
        let runner = runner.clone();
        ctrlc::set_handler(move || {
            if flag.swap(true, Ordering::SeqCst) {
                eprintln!("\nForce exit requested.");
                std::process::exit(exit_codes::INTERRUPTED);
            }
            eprintln!("\nInterrupt received, stopping running commands...");
            warn!("interrupt received");
            runner.kill_all();
        })
        .context("install Ctrl-C handler")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_flag() {
        let interrupt = Interrupt::new();
        let clone = interrupt.clone();
        assert!(!interrupt.is_set());
        clone.set();
        assert!(interrupt.is_set());
    }
}
