use thiserror::Error;

/// Unified error type for the muster library
#[derive(Debug, Error)]
pub enum MusterError {
    /// A gated operation was invoked before the cluster was launched
    #[error(
        "distributed execution has not been set up yet; \
         call ClusterManager::launch first"
    )]
    NotLaunched,

    /// A controller-only operation was invoked from a worker process
    #[error(
        "this operation is only available on the controlling process, but this \
         process is worker rank {rank} and broadcast mode is active; disable \
         broadcast mode on the controller to run it locally"
    )]
    WrongRole { rank: usize },

    /// Cluster launch failed before the cluster became usable
    #[error("cluster launch failed: {0}")]
    LaunchFailed(String),

    /// A supervised process exited before emitting its readiness marker
    #[error("{process} exited with {status} before it was ready")]
    ProcessExited { process: String, status: String },

    /// The diagnostic stream closed before the expected markers appeared
    #[error("output stream closed after {seen}/{expected} occurrences of {marker:?}")]
    StreamClosed {
        marker: String,
        seen: usize,
        expected: usize,
    },

    /// A blocking wait exceeded its configured timeout
    #[error("timed out after {timeout_ms}ms waiting for {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Launcher environment variables missing or malformed
    #[error("launcher environment error: {0}")]
    Environment(String),

    /// The remote execution backend reported a failure
    #[error("execution backend error: {0}")]
    Backend(String),

    /// IO errors while spawning or scanning supervised processes
    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize exchanged values
    #[error("serialization failed: {0}")]
    Serde(#[from] serde_json::Error),

    // Wrapped anyhow::Error (for flexibility)
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MusterError {
    /// Create a launch failure error
    pub fn launch_failed<S: Into<String>>(message: S) -> Self {
        Self::LaunchFailed(message.into())
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms: timeout.as_millis() as u64,
        }
    }

    /// Create an environment error
    pub fn environment<S: Into<String>>(message: S) -> Self {
        Self::Environment(message.into())
    }

    /// Create a backend error
    pub fn backend<S: Into<String>>(message: S) -> Self {
        Self::Backend(message.into())
    }

    /// Create an IO error
    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    /// Get error category for metrics/logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::NotLaunched => "not_launched",
            Self::WrongRole { .. } => "wrong_role",
            Self::LaunchFailed(_) => "launch",
            Self::ProcessExited { .. } => "launch",
            Self::StreamClosed { .. } => "launch",
            Self::Timeout { .. } => "timeout",
            Self::Environment(_) => "environment",
            Self::Backend(_) => "backend",
            Self::Io { .. } => "io",
            Self::Serde(_) => "serialization",
            Self::Other(_) => "internal",
        }
    }

    /// Check if error is recoverable by the caller
    pub fn is_recoverable(&self) -> bool {
        match self {
            // Recoverable by launching first / switching role
            Self::NotLaunched | Self::WrongRole { .. } => true,
            // Launching a cluster is an expensive, non-idempotent side
            // effect; launch failures are not retried automatically.
            Self::LaunchFailed(_) | Self::ProcessExited { .. } | Self::StreamClosed { .. } => false,
            Self::Timeout { .. } | Self::Io { .. } | Self::Backend(_) => false,
            Self::Environment(_) => false,
            Self::Serde(_) => false,
            Self::Other(_) => false,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, MusterError>;

impl From<std::io::Error> for MusterError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}
