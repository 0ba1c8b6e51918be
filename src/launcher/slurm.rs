//! Slurm environment reader
//!
//! Reads the `SLURM_*` variables exported by `srun`/`sbatch`. The compact
//! nodelist format (`node[1-5],node7`) is expanded just enough to answer
//! "which node hosts the master process".

use super::{os_hostname, parse_var, required_var, LauncherEnv};
use crate::core::errors::Result;

#[derive(Debug, Default)]
pub struct SlurmEnv;

impl SlurmEnv {
    pub fn new() -> Self {
        Self
    }
}

impl LauncherEnv for SlurmEnv {
    fn name(&self) -> &'static str {
        "Slurm"
    }

    fn priority(&self) -> u32 {
        10_000
    }

    fn is_launcher(&self) -> bool {
        std::env::var("SLURM_STEP_ID").is_ok() || std::env::var("SLURM_JOB_ID").is_ok()
    }

    fn rank(&self) -> Result<usize> {
        parse_var("SLURM_PROCID")
    }

    fn local_rank(&self) -> Result<usize> {
        parse_var("SLURM_LOCALID")
    }

    fn world_size(&self) -> Result<usize> {
        // SLURM_NTASKS covers the common srun/sbatch case; job steps export
        // the step-scoped count instead.
        parse_var("SLURM_NTASKS").or_else(|_| parse_var("SLURM_STEP_NUM_TASKS"))
    }

    fn num_nodes(&self) -> Result<usize> {
        parse_var("SLURM_NNODES").or_else(|_| parse_var("SLURM_STEP_NUM_NODES"))
    }

    fn nodelist(&self) -> Result<Vec<String>> {
        let compact = required_var("SLURM_NODELIST")
            .or_else(|_| required_var("SLURM_STEP_NODELIST"))?;
        Ok(expand_first_hosts(&compact))
    }

    fn master_address(&self) -> Result<String> {
        let compact = required_var("SLURM_NODELIST")
            .or_else(|_| required_var("SLURM_STEP_NODELIST"))?;
        Ok(first_host(&compact))
    }

    fn job_id(&self) -> Result<u64> {
        parse_var("SLURM_JOB_ID")
    }

    fn hostname(&self) -> Result<String> {
        required_var("SLURMD_NODENAME").or_else(|_| os_hostname())
    }
}

/// First host of a compact Slurm nodelist.
///
/// Each bracket expression collapses to its first element, then the first
/// comma-separated entry wins: `"node[1-5],node7"` -> `"node1"`.
pub fn first_host(nodelist: &str) -> String {
    let mut collapsed = String::with_capacity(nodelist.len());
    let mut rest = nodelist;
    while let Some(open) = rest.find('[') {
        let Some(close_rel) = rest[open..].find(']') else {
            break;
        };
        let close = open + close_rel;
        collapsed.push_str(&rest[..open]);
        let inner = &rest[open + 1..close];
        let head = inner
            .split(|c| c == '-' || c == ',')
            .next()
            .unwrap_or(inner);
        collapsed.push_str(head);
        rest = &rest[close + 1..];
    }
    collapsed.push_str(rest);
    collapsed
        .split(',')
        .next()
        .unwrap_or(&collapsed)
        .to_string()
}

/// Collapse every bracket expression to its first element and split the
/// resulting list. A full hostlist expansion is not needed here; the
/// orchestrator only binds to the first host of each group.
fn expand_first_hosts(nodelist: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut current = String::new();
    for c in nodelist.chars() {
        match c {
            '[' => {
                depth += 1;
                current.push(c);
            }
            ']' => {
                depth = depth.saturating_sub(1);
                current.push(c);
            }
            ',' if depth == 0 => {
                out.push(first_host(&current));
                current.clear();
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        out.push(first_host(&current));
    }
    out
}
