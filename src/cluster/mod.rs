//! Cluster lifecycle: process supervision, readiness, gating, exchange,
//! crash-safe teardown.

pub mod client;
pub mod exchange;
pub mod lifecycle;
pub mod manager;
pub mod mode;
pub mod readiness;
pub mod supervisor;

pub use client::ClusterClient;
pub use lifecycle::install_signal_handlers;
pub use manager::{ClusterConfig, ClusterManager};
pub use mode::{ExecutionMode, Role};
pub use supervisor::{ProcessSupervisor, SupervisorConfig};
