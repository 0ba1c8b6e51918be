//! Crash-safe teardown
//!
//! Whatever ends the controlling process — a normal return, an error, or a
//! termination signal — the cluster must come down exactly once. Signals
//! run `cleanup` and then re-deliver themselves with the default
//! disposition restored, so the process still exits with the conventional
//! status for that signal. Normal-exit teardown is covered by the child
//! processes' kill-on-drop flag and the manager state's drop guard.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;

use super::manager::ClusterManager;
use crate::core::errors::{MusterError, Result};

/// Install SIGINT/SIGTERM handlers that tear the cluster down before the
/// process dies of the signal.
///
/// The returned task runs for the life of the process (or until aborted).
/// Cleanup is idempotent, so an explicit `cleanup` racing the handler is
/// safe.
pub fn install_signal_handlers(manager: ClusterManager) -> Result<JoinHandle<()>> {
    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| MusterError::io("installing SIGINT handler", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| MusterError::io("installing SIGTERM handler", e))?;

    let handle = tokio::spawn(async move {
        let signum = tokio::select! {
            _ = sigint.recv() => libc::SIGINT,
            _ = sigterm.recv() => libc::SIGTERM,
        };
        tracing::info!("received signal {}, tearing the cluster down", signum);
        manager.cleanup().await;

        // Restore the default disposition and re-deliver, so the process
        // exits with the conventional status for this signal.
        unsafe {
            libc::signal(signum, libc::SIG_DFL);
            libc::raise(signum);
        }
    });
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LocalBackend;
    use std::sync::Arc;

    // Raising a real SIGINT here would kill the test runner, so the signal
    // path is exercised structurally; cleanup idempotence under double
    // entry has its own tests.

    #[tokio::test]
    async fn handlers_install_and_stay_pending() {
        let manager = ClusterManager::new(Arc::new(LocalBackend::new(1)));
        let handle = install_signal_handlers(manager).unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(!handle.is_finished());
        handle.abort();
    }

    #[tokio::test]
    async fn handler_task_is_send() {
        fn assert_send<T: Send>(_: &T) {}
        let manager = ClusterManager::new(Arc::new(LocalBackend::new(1)));
        let handle = install_signal_handlers(manager).unwrap();
        assert_send(&handle);
        handle.abort();
    }
}
