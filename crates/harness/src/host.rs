//! Privileged host capabilities: process termination

use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Host-level control the harness needs besides configuration
pub trait Host: Send + Sync {
    /// End the run. Called at most once, through [`Terminator`].
    fn quit(&self);
}

/// Host that exits the current process
pub struct ProcessHost;

impl Host for ProcessHost {
    fn quit(&self) {
        info!("Harness finished, exiting");
        let _ = std::io::stdout().flush();
        std::process::exit(0);
    }
}

/// Guard making `Host::quit` fire exactly once
pub struct Terminator {
    host: Arc<dyn Host>,
    fired: AtomicBool,
}

impl Terminator {
    pub fn new(host: Arc<dyn Host>) -> Self {
        Self {
            host,
            fired: AtomicBool::new(false),
        }
    }

    /// Quit the host; later calls are no-ops
    pub fn terminate(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            debug!("Termination already requested");
            return;
        }
        self.host.quit();
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }
}
