// Core infrastructure modules
pub mod core {
    pub mod errors;
}

// Main subsystems
pub mod backend; // remote execution backend interface + in-process implementation
pub mod cluster; // process supervision, lifecycle, data exchange
pub mod launcher; // scheduler environment readers

// Re-exports for convenience
pub use crate::core::errors::{MusterError, Result};
pub use backend::{ClusterConnection, ControlMessage, EngineValues, ExecutionBackend, LocalBackend};
pub use cluster::manager::{ClusterConfig, ClusterManager};
pub use cluster::mode::{ExecutionMode, Role};
pub use cluster::supervisor::{ProcessSupervisor, SupervisorConfig};
pub use launcher::{detect, LauncherEnv, SequentialEnv, SlurmEnv};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    struct TwoWorkerEnv;

    impl LauncherEnv for TwoWorkerEnv {
        fn name(&self) -> &'static str {
            "two-worker"
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
            Ok(2)
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
            Ok("localhost".to_string())
        }
    }

    #[tokio::test]
    async fn cluster_id_is_derived_from_worker_count() {
        let manager = ClusterManager::new(Arc::new(LocalBackend::new(2)))
            .with_env(Box::new(TwoWorkerEnv));
        assert_eq!(manager.worker_count().unwrap(), 2);
        assert_eq!(manager.cluster_id().unwrap(), "cluster_2");
    }

    #[tokio::test]
    async fn detached_manager_degrades_to_noop() {
        // Without an execution backend every gated operation warns and
        // returns successfully instead of crashing the host application.
        let manager = ClusterManager::detached().with_env(Box::new(TwoWorkerEnv));
        manager.launch().await.unwrap();
        assert!(!manager.is_launched());
        manager.push(HashMap::new()).await.unwrap();
        let pulled = manager.pull(&["x"]).await.unwrap();
        assert!(pulled.is_empty());
        manager.cleanup().await;
    }

    #[tokio::test]
    async fn push_before_launch_is_rejected() {
        let manager = ClusterManager::new(Arc::new(LocalBackend::new(2)))
            .with_env(Box::new(TwoWorkerEnv));
        let err = manager.push(HashMap::new()).await.unwrap_err();
        assert!(matches!(err, MusterError::NotLaunched));
    }
}
