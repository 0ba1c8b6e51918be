//! Launcher environment readers
//!
//! Facts about the job (worker count, hostname, nodelist) come from the
//! scheduler that launched the controlling process. Each reader knows how to
//! detect whether it is the active launcher and how to read its environment
//! variables; `detect` returns the highest-priority reader that claims the
//! current environment, falling back to the single-process reader.

pub mod sequential;
pub mod slurm;

pub use sequential::SequentialEnv;
pub use slurm::SlurmEnv;

use crate::core::errors::{MusterError, Result};

/// Facts provider for the scheduler environment the job was launched under.
///
/// The orchestrator core only consumes `world_size` and `hostname`; the rest
/// of the surface exists so the same reader serves conventional (non
/// interactive) distributed scripts too.
pub trait LauncherEnv: Send + Sync {
    fn name(&self) -> &'static str;

    /// Readers with a higher priority win when several claim the environment.
    fn priority(&self) -> u32 {
        5000
    }

    /// Whether this reader's scheduler launched the current job.
    fn is_launcher(&self) -> bool;

    fn rank(&self) -> Result<usize>;

    fn local_rank(&self) -> Result<usize>;

    fn world_size(&self) -> Result<usize>;

    fn num_nodes(&self) -> Result<usize>;

    fn nodelist(&self) -> Result<Vec<String>>;

    fn master_address(&self) -> Result<String>;

    fn job_id(&self) -> Result<u64>;

    fn hostname(&self) -> Result<String>;

    /// Whether this process is the master (i.e. rank 0).
    fn is_master(&self) -> bool {
        self.rank().map(|r| r == 0).unwrap_or(true)
    }
}

/// Select the active launcher reader, highest priority first.
///
/// `SequentialEnv` always claims the environment, so this never fails; it is
/// last in line and serves undistributed runs.
pub fn detect() -> Box<dyn LauncherEnv> {
    let mut readers: Vec<Box<dyn LauncherEnv>> =
        vec![Box::new(SlurmEnv::new()), Box::new(SequentialEnv::new())];
    readers.sort_by(|a, b| b.priority().cmp(&a.priority()));
    for reader in readers {
        if reader.is_launcher() {
            tracing::debug!("detected launcher environment: {}", reader.name());
            return reader;
        }
    }
    // SequentialEnv claims every environment; unreachable in practice.
    Box::new(SequentialEnv::new())
}

pub(crate) fn required_var(key: &str) -> Result<String> {
    std::env::var(key)
        .map_err(|_| MusterError::environment(format!("environment variable {key} is not set")))
}

pub(crate) fn parse_var<T: std::str::FromStr>(key: &str) -> Result<T> {
    let raw = required_var(key)?;
    raw.parse().map_err(|_| {
        MusterError::environment(format!("environment variable {key}={raw} is not a valid number"))
    })
}

/// OS hostname, used when the scheduler does not provide one.
pub(crate) fn os_hostname() -> Result<String> {
    hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .map_err(|e| MusterError::environment(format!("failed to query OS hostname: {e}")))
}
