//! Single-process fallback reader, used when no scheduler is detected.

use super::{os_hostname, LauncherEnv};
use crate::core::errors::Result;

#[derive(Debug, Default)]
pub struct SequentialEnv;

impl SequentialEnv {
    pub fn new() -> Self {
        Self
    }
}

impl LauncherEnv for SequentialEnv {
    fn name(&self) -> &'static str {
        "Sequential"
    }

    fn priority(&self) -> u32 {
        0
    }

    fn is_launcher(&self) -> bool {
        true
    }

    fn rank(&self) -> Result<usize> {
        Ok(0)
    }

    fn local_rank(&self) -> Result<usize> {
        Ok(0)
    }

    fn world_size(&self) -> Result<usize> {
        Ok(1)
    }

    fn num_nodes(&self) -> Result<usize> {
        Ok(1)
    }

    fn nodelist(&self) -> Result<Vec<String>> {
        Ok(vec!["localhost".to_string()])
    }

    fn master_address(&self) -> Result<String> {
        Ok("localhost".to_string())
    }

    fn job_id(&self) -> Result<u64> {
        Ok(0)
    }

    fn hostname(&self) -> Result<String> {
        os_hostname().or_else(|_| Ok("localhost".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequential_is_a_world_of_one() {
        let env = SequentialEnv::new();
        assert!(env.is_launcher());
        assert_eq!(env.rank().unwrap(), 0);
        assert_eq!(env.world_size().unwrap(), 1);
        assert!(env.is_master());
        assert_eq!(env.master_address().unwrap(), "localhost");
    }
}
