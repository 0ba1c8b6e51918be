//! In-process execution backend
//!
//! Runs N engines as tokio tasks inside the controlling process, each with
//! its own rank and namespace. The full orchestrator lifecycle (registration,
//! role announcement, push/pull, teardown) is exercisable against it without
//! any external cluster tooling installed. Replies to gathers can be
//! staggered so higher ranks answer first, which is how the tests prove the
//! rank-ordering guarantee does not depend on arrival order.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use super::{ClusterConnection, ControlMessage, EngineValues, ExecutionBackend};
use crate::core::errors::{MusterError, Result};

/// Backend that simulates a worker set with in-process engine tasks.
pub struct LocalBackend {
    engines: usize,
    reply_stagger: Duration,
    control_log: Arc<Mutex<Vec<(usize, ControlMessage)>>>,
}

impl LocalBackend {
    pub fn new(engines: usize) -> Self {
        Self {
            engines,
            reply_stagger: Duration::ZERO,
            control_log: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Delay each engine's gather reply by `stagger * (world_size - 1 - rank)`
    /// so replies arrive in reverse rank order.
    pub fn with_reply_stagger(mut self, stagger: Duration) -> Self {
        self.reply_stagger = stagger;
        self
    }

    /// Control messages engines have received, in delivery order.
    pub fn control_log(&self) -> Vec<(usize, ControlMessage)> {
        self.control_log.lock().expect("control log poisoned").clone()
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn connect(&self, cluster_id: &str) -> Result<Box<dyn ClusterConnection>> {
        tracing::debug!(
            "starting {} local engines for cluster {}",
            self.engines,
            cluster_id
        );
        Ok(Box::new(LocalConnection::start(
            cluster_id,
            self.engines,
            self.reply_stagger,
            Arc::clone(&self.control_log),
        )))
    }
}

enum EngineRequest {
    Control(ControlMessage),
    Push {
        values: HashMap<String, Value>,
        ack: mpsc::Sender<std::result::Result<usize, String>>,
    },
    Pull {
        request_id: Uuid,
        names: Vec<String>,
        reply: mpsc::Sender<EngineReply>,
    },
    Shutdown,
}

struct EngineReply {
    rank: usize,
    result: std::result::Result<Vec<Value>, String>,
}

struct EngineHandle {
    rank: usize,
    tx: mpsc::Sender<EngineRequest>,
}

struct LocalConnection {
    cluster_id: String,
    engines: Vec<EngineHandle>,
    registered: watch::Receiver<usize>,
    closed: AtomicBool,
    // Keeps the registrar task (and therefore the watch sender) alive for
    // the lifetime of the connection.
    _reg_tx: mpsc::Sender<usize>,
}

impl LocalConnection {
    fn start(
        cluster_id: &str,
        engines: usize,
        reply_stagger: Duration,
        control_log: Arc<Mutex<Vec<(usize, ControlMessage)>>>,
    ) -> Self {
        let (watch_tx, watch_rx) = watch::channel(0usize);
        let (reg_tx, mut reg_rx) = mpsc::channel::<usize>(engines.max(1));

        tokio::spawn(async move {
            let mut count = 0usize;
            while let Some(rank) = reg_rx.recv().await {
                count += 1;
                tracing::trace!("engine {} registered ({} total)", rank, count);
                if watch_tx.send(count).is_err() {
                    break;
                }
            }
        });

        let mut handles = Vec::with_capacity(engines);
        for rank in 0..engines {
            let (tx, rx) = mpsc::channel(16);
            tokio::spawn(run_engine(
                rank,
                engines,
                reply_stagger,
                rx,
                reg_tx.clone(),
                Arc::clone(&control_log),
            ));
            handles.push(EngineHandle { rank, tx });
        }

        Self {
            cluster_id: cluster_id.to_string(),
            engines: handles,
            registered: watch_rx,
            closed: AtomicBool::new(false),
            _reg_tx: reg_tx,
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(MusterError::backend(format!(
                "connection to {} is closed",
                self.cluster_id
            )))
        } else {
            Ok(())
        }
    }

    async fn deliver(&self, handle: &EngineHandle, request: EngineRequest) -> Result<()> {
        handle.tx.send(request).await.map_err(|_| {
            MusterError::backend(format!("engine {} is no longer running", handle.rank))
        })
    }
}

#[async_trait]
impl ClusterConnection for LocalConnection {
    async fn wait_for_engines(&self, expected: usize) -> Result<()> {
        self.ensure_open()?;
        let mut registered = self.registered.clone();
        registered
            .wait_for(|&count| count >= expected)
            .await
            .map_err(|_| MusterError::backend("engine registrar is gone"))?;
        Ok(())
    }

    async fn broadcast(&self, message: ControlMessage) -> Result<()> {
        self.ensure_open()?;
        for handle in &self.engines {
            self.deliver(handle, EngineRequest::Control(message.clone()))
                .await?;
        }
        Ok(())
    }

    async fn send_to(&self, rank: usize, message: ControlMessage) -> Result<()> {
        self.ensure_open()?;
        let handle = self
            .engines
            .iter()
            .find(|h| h.rank == rank)
            .ok_or_else(|| MusterError::backend(format!("no engine with rank {rank}")))?;
        self.deliver(handle, EngineRequest::Control(message)).await
    }

    async fn push(&self, values: HashMap<String, Value>) -> Result<()> {
        self.ensure_open()?;
        let (ack_tx, mut ack_rx) = mpsc::channel(self.engines.len().max(1));
        for handle in &self.engines {
            self.deliver(
                handle,
                EngineRequest::Push {
                    values: values.clone(),
                    ack: ack_tx.clone(),
                },
            )
            .await?;
        }
        drop(ack_tx);

        let mut acked = 0usize;
        while let Some(ack) = ack_rx.recv().await {
            match ack {
                Ok(rank) => {
                    tracing::trace!("push applied on rank {}", rank);
                    acked += 1;
                }
                Err(reason) => return Err(MusterError::backend(reason)),
            }
        }
        if acked == self.engines.len() {
            Ok(())
        } else {
            Err(MusterError::backend(format!(
                "push acknowledged by {}/{} engines",
                acked,
                self.engines.len()
            )))
        }
    }

    async fn pull(&self, names: &[String]) -> Result<Vec<EngineValues>> {
        self.ensure_open()?;
        let request_id = Uuid::new_v4();
        let (reply_tx, mut reply_rx) = mpsc::channel(self.engines.len().max(1));
        for handle in &self.engines {
            self.deliver(
                handle,
                EngineRequest::Pull {
                    request_id,
                    names: names.to_vec(),
                    reply: reply_tx.clone(),
                },
            )
            .await?;
        }
        drop(reply_tx);

        let mut gathered = Vec::with_capacity(self.engines.len());
        while let Some(reply) = reply_rx.recv().await {
            match reply.result {
                Ok(values) => gathered.push(EngineValues {
                    rank: reply.rank,
                    values,
                }),
                Err(reason) => {
                    return Err(MusterError::backend(format!(
                        "pull {request_id} failed: {reason}"
                    )))
                }
            }
        }
        if gathered.len() == self.engines.len() {
            Ok(gathered)
        } else {
            Err(MusterError::backend(format!(
                "pull {} answered by {}/{} engines",
                request_id,
                gathered.len(),
                self.engines.len()
            )))
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        for handle in &self.engines {
            // Engines that already exited are fine; shutdown is best-effort.
            let _ = handle.tx.send(EngineRequest::Shutdown).await;
        }
        tracing::debug!("local connection to {} closed", self.cluster_id);
        Ok(())
    }
}

async fn run_engine(
    rank: usize,
    world_size: usize,
    reply_stagger: Duration,
    mut rx: mpsc::Receiver<EngineRequest>,
    reg_tx: mpsc::Sender<usize>,
    control_log: Arc<Mutex<Vec<(usize, ControlMessage)>>>,
) {
    let namespace: DashMap<String, Value> = DashMap::new();
    namespace.insert("rank".to_string(), json!(rank));

    if reg_tx.send(rank).await.is_err() {
        return;
    }
    drop(reg_tx);

    while let Some(request) = rx.recv().await {
        match request {
            EngineRequest::Control(message) => {
                if let ControlMessage::RoleAssignment {
                    rank: assigned,
                    world_size: announced,
                } = &message
                {
                    // The role announcement makes the engine's own facts
                    // visible in its namespace.
                    namespace.insert("rank".to_string(), json!(assigned));
                    namespace.insert("world_size".to_string(), json!(announced));
                }
                control_log
                    .lock()
                    .expect("control log poisoned")
                    .push((rank, message));
            }
            EngineRequest::Push { values, ack } => {
                for (name, value) in values {
                    namespace.insert(name, value);
                }
                let _ = ack.send(Ok(rank)).await;
            }
            EngineRequest::Pull {
                request_id,
                names,
                reply,
            } => {
                if !reply_stagger.is_zero() {
                    let slot = (world_size - 1 - rank) as u32;
                    tokio::time::sleep(reply_stagger * slot).await;
                }
                let result = names
                    .iter()
                    .map(|name| {
                        namespace
                            .get(name)
                            .map(|v| v.value().clone())
                            .ok_or_else(|| format!("{name:?} is not bound on rank {rank}"))
                    })
                    .collect::<std::result::Result<Vec<Value>, String>>();
                tracing::trace!("rank {} answering pull {}", rank, request_id);
                let _ = reply.send(EngineReply { rank, result }).await;
            }
            EngineRequest::Shutdown => break,
        }
    }
}
