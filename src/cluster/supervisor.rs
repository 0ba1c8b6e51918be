//! Process supervision for the external cluster tools
//!
//! The supervisor owns two external processes: the cluster controller and
//! the engine launcher (which fans out into one engine per worker through
//! the job scheduler). Neither tool exposes a readiness API; both announce
//! progress as unstructured text on stderr, so readiness is detected by
//! scanning that stream for marker substrings. Termination is graceful
//! first (SIGTERM), escalating to SIGKILL after a grace period.

use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::process::{Child, Command};

use super::readiness;
use crate::core::errors::{MusterError, Result};

/// Programs, markers and timing for the supervised processes.
///
/// Defaults match the stock IPython-parallel tooling; tests substitute
/// scripted stand-ins.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub controller_program: String,
    pub controller_ready_marker: String,
    pub engine_launcher_program: String,
    pub engine_program: String,
    pub engine_registered_marker: String,
    /// Bound on every readiness scan. The legacy loop had none and hung
    /// forever when a process died quietly.
    pub startup_timeout: Duration,
    /// How long a process gets to honor SIGTERM before SIGKILL.
    pub grace_period: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            controller_program: "ipcontroller".to_string(),
            controller_ready_marker: "subscription started".to_string(),
            engine_launcher_program: "srun".to_string(),
            engine_program: "ipengine".to_string(),
            engine_registered_marker: "Completed registration".to_string(),
            startup_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(5),
        }
    }
}

pub struct ProcessSupervisor {
    config: SupervisorConfig,
}

impl ProcessSupervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Spawn the controller bound to `host` and `cluster_id`; returns once
    /// its readiness marker has been observed on stderr.
    pub async fn spawn_controller(&self, host: &str, cluster_id: &str) -> Result<Child> {
        let mut command = Command::new(&self.config.controller_program);
        command
            .arg("--ip")
            .arg(host)
            .arg("--cluster-id")
            .arg(cluster_id);
        let marker = self.config.controller_ready_marker.clone();
        self.spawn_and_await(command, "controller", &marker, 1).await
    }

    /// Spawn the engine launcher for `cluster_id`; returns once `expected`
    /// registration markers have been observed on stderr.
    pub async fn spawn_engines(&self, cluster_id: &str, expected: usize) -> Result<Child> {
        let mut command = Command::new(&self.config.engine_launcher_program);
        command
            .arg(&self.config.engine_program)
            .arg("--cluster-id")
            .arg(cluster_id);
        let marker = self.config.engine_registered_marker.clone();
        self.spawn_and_await(command, "engine launcher", &marker, expected)
            .await
    }

    async fn spawn_and_await(
        &self,
        mut command: Command,
        what: &str,
        marker: &str,
        expected: usize,
    ) -> Result<Child> {
        command
            .stdin(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::info!("spawning {}: {:?}", what, command.as_std());

        let mut child = command
            .spawn()
            .map_err(|e| MusterError::launch_failed(format!("failed to spawn {what}: {e}")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MusterError::launch_failed(format!("{what} has no stderr pipe")))?;
        let mut lines = BufReader::new(stderr).lines();

        match readiness::await_marker(
            &mut lines,
            marker,
            expected,
            self.config.startup_timeout,
            what,
        )
        .await
        {
            Ok(()) => {
                // Keep consuming stderr so the process never blocks on a
                // full pipe once we stop watching for markers.
                drain_into_logs(lines, what);
                tracing::info!("{} ready", what);
                Ok(child)
            }
            Err(err) => {
                let err = attach_exit_status(&mut child, what, err).await;
                let mut slot = Some(child);
                self.terminate(&mut slot).await;
                Err(err)
            }
        }
    }

    /// Terminate a supervised process: SIGTERM, wait out the grace period,
    /// SIGKILL if still running. Absent or already-exited processes are a
    /// no-op; errors are absorbed so teardown can always make progress.
    pub async fn terminate(&self, slot: &mut Option<Child>) {
        let Some(mut child) = slot.take() else {
            return;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!("process already exited with {}", status);
                return;
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("could not poll process state: {}", e),
        }

        if let Some(pid) = child.id() {
            tracing::debug!("sending SIGTERM to pid {}", pid);
            let _ = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        }

        match tokio::time::timeout(self.config.grace_period, child.wait()).await {
            Ok(Ok(status)) => tracing::debug!("process exited after SIGTERM with {}", status),
            Ok(Err(e)) => tracing::warn!("error waiting for terminated process: {}", e),
            Err(_) => {
                tracing::warn!(
                    "process ignored SIGTERM for {:?}, killing",
                    self.config.grace_period
                );
                if let Err(e) = child.kill().await {
                    tracing::warn!("failed to kill process: {}", e);
                }
            }
        }
    }
}

/// Fold the process exit status into a scan failure when the process is
/// already gone; a short wait covers the gap between stderr closing and the
/// exit status becoming available.
async fn attach_exit_status(child: &mut Child, what: &str, err: MusterError) -> MusterError {
    if let MusterError::StreamClosed { .. } = err {
        if let Ok(Ok(status)) = tokio::time::timeout(Duration::from_millis(200), child.wait()).await
        {
            return MusterError::ProcessExited {
                process: what.to_string(),
                status: status.to_string(),
            };
        }
    }
    err
}

fn drain_into_logs<R>(mut lines: Lines<BufReader<R>>, what: &str)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let what = what.to_string();
    tokio::spawn(async move {
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::trace!("{}: {}", what, line);
        }
    });
}
