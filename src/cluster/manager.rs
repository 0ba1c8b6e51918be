//! Cluster lifecycle manager
//!
//! One `ClusterManager` per controlling process. `launch` starts the
//! controller, fans the engines out, connects, announces every worker its
//! rank, and switches to broadcast mode; `cleanup` tears all of it down
//! exactly once however it is triggered (explicitly, by the signal handler,
//! or by the drop guard).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::process::Child;
use tokio::sync::Mutex;

use super::client::ClusterClient;
use super::exchange;
use super::mode::{self, ExecutionMode, Role};
use super::supervisor::{ProcessSupervisor, SupervisorConfig};
use crate::backend::{ControlMessage, ExecutionBackend};
use crate::core::errors::{MusterError, Result};
use crate::launcher::{self, LauncherEnv};

/// Timeouts for every blocking wait in the lifecycle, plus the supervised
/// process configuration.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub supervisor: SupervisorConfig,
    /// Bound on waiting for all engines to register with the connection.
    pub engine_wait_timeout: Duration,
    /// Bound on each push/pull/broadcast exchange with the worker set.
    pub exchange_timeout: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            supervisor: SupervisorConfig::default(),
            engine_wait_timeout: Duration::from_secs(60),
            exchange_timeout: Duration::from_secs(30),
        }
    }
}

/// Facts resolved once from the launcher environment. Immutable after the
/// first read.
#[derive(Debug, Clone)]
struct ClusterFacts {
    worker_count: usize,
    cluster_id: String,
    controlling_host: String,
}

struct ClusterState {
    controller: Option<Child>,
    engine_launcher: Option<Child>,
    client: Option<ClusterClient>,
    role: Role,
    mode: ExecutionMode,
}

impl Default for ClusterState {
    fn default() -> Self {
        Self {
            controller: None,
            engine_launcher: None,
            client: None,
            role: Role::Controller,
            mode: ExecutionMode::Local,
        }
    }
}

impl Drop for ClusterState {
    fn drop(&mut self) {
        // Last line of defense at normal process exit; the regular path is
        // cleanup() -> supervisor.terminate with graceful escalation.
        for child in [self.controller.as_mut(), self.engine_launcher.as_mut()]
            .into_iter()
            .flatten()
        {
            if matches!(child.try_wait(), Ok(None)) {
                let _ = child.start_kill();
            }
        }
    }
}

#[derive(Clone)]
pub struct ClusterManager {
    backend: Option<Arc<dyn ExecutionBackend>>,
    env: Arc<dyn LauncherEnv>,
    config: Arc<ClusterConfig>,
    supervisor: Arc<ProcessSupervisor>,
    launched: Arc<AtomicBool>,
    state: Arc<Mutex<ClusterState>>,
    facts: Arc<OnceLock<ClusterFacts>>,
}

impl ClusterManager {
    pub fn new(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self::build(Some(backend))
    }

    /// Manager without an execution backend. Every gated operation warns
    /// and degrades to a no-op instead of crashing the host application.
    pub fn detached() -> Self {
        Self::build(None)
    }

    fn build(backend: Option<Arc<dyn ExecutionBackend>>) -> Self {
        let config = ClusterConfig::default();
        Self {
            backend,
            env: Arc::from(launcher::detect()),
            supervisor: Arc::new(ProcessSupervisor::new(config.supervisor.clone())),
            config: Arc::new(config),
            launched: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(ClusterState::default())),
            facts: Arc::new(OnceLock::new()),
        }
    }

    pub fn with_env(mut self, env: Box<dyn LauncherEnv>) -> Self {
        self.env = Arc::from(env);
        self
    }

    pub fn with_config(mut self, config: ClusterConfig) -> Self {
        self.supervisor = Arc::new(ProcessSupervisor::new(config.supervisor.clone()));
        self.config = Arc::new(config);
        self
    }

    /// Number of workers in the cluster, resolved once from the launcher
    /// environment.
    pub fn worker_count(&self) -> Result<usize> {
        self.facts().map(|f| f.worker_count)
    }

    /// Rendezvous id shared with the execution backend, derived from the
    /// worker count.
    pub fn cluster_id(&self) -> Result<String> {
        self.facts().map(|f| f.cluster_id.clone())
    }

    pub fn controlling_host(&self) -> Result<String> {
        self.facts().map(|f| f.controlling_host.clone())
    }

    pub fn is_launched(&self) -> bool {
        self.launched.load(Ordering::SeqCst)
    }

    pub async fn role(&self) -> Role {
        self.state.lock().await.role
    }

    pub async fn execution_mode(&self) -> ExecutionMode {
        self.state.lock().await.mode
    }

    fn facts(&self) -> Result<&ClusterFacts> {
        if self.facts.get().is_none() {
            let worker_count = self.env.world_size()?;
            if worker_count == 0 {
                return Err(MusterError::environment(
                    "launcher reports a world size of zero",
                ));
            }
            let controlling_host = self.env.hostname()?;
            let _ = self.facts.set(ClusterFacts {
                worker_count,
                cluster_id: format!("cluster_{worker_count}"),
                controlling_host,
            });
        }
        Ok(self.facts.get().expect("facts initialized above"))
    }

    fn available_backend(&self) -> Option<&Arc<dyn ExecutionBackend>> {
        if self.backend.is_none() {
            tracing::warn!(
                "no execution backend is available, so cluster operations are no-ops; \
                 construct the manager with a backend to use them"
            );
        }
        self.backend.as_ref()
    }

    async fn current_client(&self) -> Result<ClusterClient> {
        self.state
            .lock()
            .await
            .client
            .clone()
            .ok_or_else(|| MusterError::backend("no cluster connection in this process"))
    }

    /// Launch the cluster: controller, engines, connection, role
    /// announcements, broadcast mode. A failure at any step cleans the
    /// partially launched cluster up before the error propagates; launch is
    /// never retried automatically.
    pub async fn launch(&self) -> Result<()> {
        let Some(backend) = self.available_backend() else {
            return Ok(());
        };
        if self.is_launched() {
            tracing::warn!("cluster already launched; ignoring repeated launch");
            return Ok(());
        }
        let facts = self.facts()?.clone();
        let mut state = self.state.lock().await;

        state.controller = Some(
            self.supervisor
                .spawn_controller(&facts.controlling_host, &facts.cluster_id)
                .await?,
        );

        match self
            .supervisor
            .spawn_engines(&facts.cluster_id, facts.worker_count)
            .await
        {
            Ok(child) => state.engine_launcher = Some(child),
            Err(err) => {
                tracing::error!("engine launch failed: {}", err);
                self.teardown_locked(&mut state).await;
                return Err(err);
            }
        }

        let client = match ClusterClient::connect(backend.as_ref(), &facts.cluster_id).await {
            Ok(client) => client,
            Err(err) => {
                tracing::error!("connection to cluster failed: {}", err);
                self.teardown_locked(&mut state).await;
                return Err(err);
            }
        };

        if let Err(err) = client
            .await_engines(facts.worker_count, self.config.engine_wait_timeout)
            .await
        {
            tracing::error!("engines never became visible: {}", err);
            let _ = client.shutdown(self.config.exchange_timeout).await;
            self.teardown_locked(&mut state).await;
            return Err(err);
        }

        // Tell each worker which rank it is. A structured message, not
        // shipped source text: the worker-side runtime feeds it to
        // apply_role_assignment.
        let world_size = facts.worker_count;
        let timeout = self.config.exchange_timeout;
        let announcements = (0..world_size).map(|rank| {
            let client = client.clone();
            async move {
                client
                    .send_to(rank, ControlMessage::RoleAssignment { rank, world_size }, timeout)
                    .await
            }
        });
        if let Some(err) = join_all(announcements)
            .await
            .into_iter()
            .find_map(|result| result.err())
        {
            tracing::error!("role announcement failed: {}", err);
            let _ = client.shutdown(self.config.exchange_timeout).await;
            self.teardown_locked(&mut state).await;
            return Err(err);
        }

        state.client = Some(client.clone());
        self.launched.store(true, Ordering::SeqCst);

        // Launch implies broadcast mode.
        if let Err(err) = client
            .broadcast(
                ControlMessage::SetMode { broadcast: true },
                self.config.exchange_timeout,
            )
            .await
        {
            self.launched.store(false, Ordering::SeqCst);
            self.teardown_locked(&mut state).await;
            return Err(err);
        }
        state.mode = ExecutionMode::Broadcast;

        tracing::info!(
            "cluster {} launched with {} workers",
            facts.cluster_id,
            facts.worker_count
        );
        Ok(())
    }

    /// Switch the controlling process's command execution to
    /// broadcast-to-all-workers mode.
    pub async fn enable(&self) -> Result<()> {
        if self.available_backend().is_none() {
            return Ok(());
        }
        mode::require_launched(self.is_launched())?;
        let client = self.current_client().await?;
        client
            .broadcast(
                ControlMessage::SetMode { broadcast: true },
                self.config.exchange_timeout,
            )
            .await?;
        self.state.lock().await.mode = ExecutionMode::Broadcast;
        tracing::info!("broadcast mode enabled");
        Ok(())
    }

    /// Switch back to local execution on the controlling process.
    pub async fn disable(&self) -> Result<()> {
        if self.available_backend().is_none() {
            return Ok(());
        }
        mode::require_launched(self.is_launched())?;
        let client = self.current_client().await?;
        client
            .broadcast(
                ControlMessage::SetMode { broadcast: false },
                self.config.exchange_timeout,
            )
            .await?;
        self.state.lock().await.mode = ExecutionMode::Local;
        tracing::info!("broadcast mode disabled");
        Ok(())
    }

    /// Run `code` on every worker.
    pub async fn execute(&self, code: &str) -> Result<()> {
        if self.available_backend().is_none() {
            return Ok(());
        }
        mode::require_launched(self.is_launched())?;
        mode::require_controller(self.role().await)?;
        let client = self.current_client().await?;
        client
            .broadcast(
                ControlMessage::Execute {
                    code: code.to_string(),
                },
                self.config.exchange_timeout,
            )
            .await
    }

    /// Send every named value to every worker's namespace, overwriting
    /// prior bindings with the same name. All-or-nothing.
    pub async fn push(&self, values: HashMap<String, Value>) -> Result<()> {
        if self.available_backend().is_none() {
            return Ok(());
        }
        mode::require_launched(self.is_launched())?;
        mode::require_controller(self.role().await)?;
        if values.is_empty() {
            return Ok(());
        }
        let client = self.current_client().await?;
        client.push(values, self.config.exchange_timeout).await
    }

    /// Gather each requested name from every worker. Result vectors are
    /// ordered by worker rank ascending, whatever order the workers
    /// answered in.
    pub async fn pull(&self, names: &[&str]) -> Result<HashMap<String, Vec<Value>>> {
        if self.available_backend().is_none() {
            return Ok(HashMap::new());
        }
        mode::require_launched(self.is_launched())?;
        mode::require_controller(self.role().await)?;
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let client = self.current_client().await?;
        let gathered = client.pull(&names, self.config.exchange_timeout).await?;
        exchange::assemble_pull(&names, gathered, self.worker_count()?)
    }

    /// Worker-side one-shot: interpret the structured role announcement.
    /// The process flips to worker rank `rank`, marks the cluster active,
    /// and considers broadcast mode on. A second announcement is an error.
    pub async fn apply_role_assignment(&self, rank: usize, world_size: usize) -> Result<()> {
        if rank >= world_size {
            return Err(MusterError::backend(format!(
                "rank {rank} out of range for world size {world_size}"
            )));
        }
        let mut state = self.state.lock().await;
        if let Role::Worker { rank: existing } = state.role {
            return Err(MusterError::backend(format!(
                "role already assigned (worker rank {existing})"
            )));
        }
        state.role = Role::Worker { rank };
        state.mode = ExecutionMode::Broadcast;
        self.launched.store(true, Ordering::SeqCst);
        tracing::info!("joined cluster as worker rank {} of {}", rank, world_size);
        Ok(())
    }

    /// Tear the cluster down: close the connection, terminate the engine
    /// launcher and the controller, reset the launched flag. Idempotent and
    /// safe against concurrent entry (explicit call + signal handler): the
    /// state lock serializes entries and the launched flag plus handle
    /// presence decide whether there is anything left to do. Errors are
    /// absorbed; teardown always runs to completion.
    pub async fn cleanup(&self) {
        let mut state = self.state.lock().await;
        let was_launched = self.launched.swap(false, Ordering::SeqCst);
        let nothing_held = state.client.is_none()
            && state.controller.is_none()
            && state.engine_launcher.is_none();
        if !was_launched && nothing_held {
            tracing::debug!("cleanup: cluster not launched, nothing to do");
            return;
        }
        self.teardown_locked(&mut state).await;
    }

    async fn teardown_locked(&self, state: &mut ClusterState) {
        if let Some(client) = state.client.take() {
            if let Err(e) = client.shutdown(self.config.exchange_timeout).await {
                tracing::warn!("error shutting down cluster connection: {}", e);
            }
        }
        self.supervisor.terminate(&mut state.engine_launcher).await;
        self.supervisor.terminate(&mut state.controller).await;
        state.mode = ExecutionMode::Local;
        tracing::info!("cluster torn down");
    }
}
