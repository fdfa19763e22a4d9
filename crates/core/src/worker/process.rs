//! Encoder process control
//!
//! On Unix, pause and resume map to SIGSTOP/SIGCONT and stop sends SIGTERM before
//! killing. Elsewhere suspension is unavailable and stop kills directly.

use std::time::Duration;
use tokio::process::Child;
use tracing::{debug, warn};

/// Time a terminated encoder gets to exit before it is killed
#[cfg(unix)]
const TERMINATE_GRACE: Duration = Duration::from_secs(3);

#[cfg(unix)]
fn signal(child: &Child, sig: nix::sys::signal::Signal) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return false;
    };
    match kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => true,
        Err(e) => {
            debug!(pid, signal = ?sig, error = %e, "Failed to signal encoder");
            false
        }
    }
}

/// Freeze the encoder while the worker is paused
pub(crate) fn suspend(child: &Child) {
    #[cfg(unix)]
    signal(child, nix::sys::signal::Signal::SIGSTOP);
    #[cfg(not(unix))]
    let _ = child;
}

pub(crate) fn resume(child: &Child) {
    #[cfg(unix)]
    signal(child, nix::sys::signal::Signal::SIGCONT);
    #[cfg(not(unix))]
    let _ = child;
}

/// Ask the encoder to exit, killing it after a grace period
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        // A stopped process cannot act on SIGTERM
        signal(child, nix::sys::signal::Signal::SIGCONT);
        if signal(child, nix::sys::signal::Signal::SIGTERM)
            && tokio::time::timeout(TERMINATE_GRACE, child.wait())
                .await
                .is_ok()
        {
            return;
        }
    }
    kill(child).await;
}

pub(crate) async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        warn!(error = %e, "Failed to kill encoder process");
    }
}
