//! Execution role and mode gating
//!
//! Every gated operation starts with an explicit guard check instead of the
//! decorator-wrapping the original design used: the failure modes are part
//! of each operation's signature, not hidden in a wrapper.

use serde::{Deserialize, Serialize};

use crate::core::errors::{MusterError, Result};

/// Which side of the cluster this process is on.
///
/// Every process starts as `Controller`; a process learns it is a worker
/// exactly once, when the role announcement reaches it after registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Controller,
    Worker { rank: usize },
}

impl Role {
    pub fn is_controller(&self) -> bool {
        matches!(self, Role::Controller)
    }
}

/// Whether commands issued at the controlling process run locally or on
/// every worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Local,
    Broadcast,
}

/// Guard: the operation needs an active cluster.
pub fn require_launched(launched: bool) -> Result<()> {
    if launched {
        Ok(())
    } else {
        Err(MusterError::NotLaunched)
    }
}

/// Guard: the operation is controller-only.
pub fn require_controller(role: Role) -> Result<()> {
    match role {
        Role::Controller => Ok(()),
        Role::Worker { rank } => Err(MusterError::WrongRole { rank }),
    }
}
