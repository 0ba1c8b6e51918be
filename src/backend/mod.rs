//! Remote execution backend interface
//!
//! The orchestrator core needs only a handful of primitives from whatever
//! mechanism actually runs code on the workers: broadcast a command to every
//! engine, deliver a message to one engine, push named values into every
//! engine namespace, pull named values back, and wait until N engines have
//! registered. Everything else about the transport is the backend's concern.

pub mod local;

pub use local::LocalBackend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::core::errors::Result;

/// Command delivered to engines over the execution channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Structured role announcement: the receiving engine is worker `rank`
    /// of `world_size`. Replaces shipping source text for the worker to
    /// execute at join time.
    RoleAssignment { rank: usize, world_size: usize },
    /// Source text to execute in every engine namespace.
    Execute { code: String },
    /// Switch engines between local and broadcast command execution.
    SetMode { broadcast: bool },
}

/// Values gathered from a single engine, tagged with its rank.
///
/// `values` holds one entry per requested name, in request order. Ordering
/// across engines is the caller's job; connections report replies in
/// arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineValues {
    pub rank: usize,
    pub values: Vec<Value>,
}

/// A live connection to a launched cluster, scoped to one cluster id.
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    /// Block until `expected` engines have registered with the cluster.
    /// Non-interactive; callers bound the wait with a timeout.
    async fn wait_for_engines(&self, expected: usize) -> Result<()>;

    /// Deliver `message` to every registered engine.
    async fn broadcast(&self, message: ControlMessage) -> Result<()>;

    /// Deliver `message` to the engine with the given rank.
    async fn send_to(&self, rank: usize, message: ControlMessage) -> Result<()>;

    /// Bind every named value in every engine namespace, overwriting
    /// previous bindings with the same name. All-or-nothing: a failed
    /// delivery fails the whole operation.
    async fn push(&self, values: HashMap<String, Value>) -> Result<()>;

    /// Gather the named values from every engine. Replies come back in
    /// arrival order, each tagged with the producing rank; an engine
    /// missing any of the names fails the whole gather.
    async fn pull(&self, names: &[String]) -> Result<Vec<EngineValues>>;

    /// Tear the connection down and release engine resources.
    async fn shutdown(&self) -> Result<()>;
}

/// Factory for connections to a cluster identified by its rendezvous id.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn connect(&self, cluster_id: &str) -> Result<Box<dyn ClusterConnection>>;
}
