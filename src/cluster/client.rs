//! Logical connection to the launched cluster
//!
//! Thin wrapper around a backend connection: scopes it to the cluster id,
//! bounds every blocking call with a timeout, and stays clonable so the
//! teardown path never has to wait for an in-flight exchange to finish.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::backend::{ClusterConnection, ControlMessage, EngineValues, ExecutionBackend};
use crate::core::errors::{MusterError, Result};

#[derive(Clone)]
pub struct ClusterClient {
    cluster_id: Arc<str>,
    connection: Arc<dyn ClusterConnection>,
}

impl ClusterClient {
    /// Open a connection scoped to `cluster_id`.
    pub async fn connect(backend: &dyn ExecutionBackend, cluster_id: &str) -> Result<Self> {
        tracing::debug!(
            "connecting to cluster {} via {} backend",
            cluster_id,
            backend.name()
        );
        let connection = backend.connect(cluster_id).await?;
        Ok(Self {
            cluster_id: Arc::from(cluster_id),
            connection: Arc::from(connection),
        })
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster_id
    }

    /// Block until `expected` engines are visible to the connection.
    /// Non-interactive; fails with a timeout error after `wait`.
    pub async fn await_engines(&self, expected: usize, wait: Duration) -> Result<()> {
        self.bounded(
            format!("registration of {expected} engines"),
            wait,
            self.connection.wait_for_engines(expected),
        )
        .await?;
        tracing::info!("all {} engines registered", expected);
        Ok(())
    }

    pub async fn broadcast(&self, message: ControlMessage, wait: Duration) -> Result<()> {
        self.bounded("broadcast to engines".to_string(), wait, self.connection.broadcast(message))
            .await
    }

    pub async fn send_to(&self, rank: usize, message: ControlMessage, wait: Duration) -> Result<()> {
        self.bounded(
            format!("delivery to engine {rank}"),
            wait,
            self.connection.send_to(rank, message),
        )
        .await
    }

    pub async fn push(&self, values: HashMap<String, Value>, wait: Duration) -> Result<()> {
        self.bounded("push to engines".to_string(), wait, self.connection.push(values))
            .await
    }

    pub async fn pull(&self, names: &[String], wait: Duration) -> Result<Vec<EngineValues>> {
        self.bounded("pull from engines".to_string(), wait, self.connection.pull(names))
            .await
    }

    pub async fn shutdown(&self, wait: Duration) -> Result<()> {
        self.bounded("connection shutdown".to_string(), wait, self.connection.shutdown())
            .await
    }

    async fn bounded<T, F>(&self, what: String, wait: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout(wait, fut).await {
            Ok(result) => result,
            Err(_) => Err(MusterError::timeout(what, wait)),
        }
    }
}
