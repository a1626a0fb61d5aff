//! Error taxonomy for introspection sessions
//!
//! Every failure is scoped to a single session. `NotFound`, `NotImplemented`
//! and `Conflict` are surfaced to the boundary layer unchanged; the rest abort
//! the activation after the session manager has unwound what it acquired.

/// Convenience alias used across the crate
pub type Result<T> = std::result::Result<T, IntrospectionError>;

/// Errors produced while activating, running or tearing down a session
#[derive(Debug, thiserror::Error)]
pub enum IntrospectionError {
    /// Unknown instance, domain or entity reference
    #[error("not found: {0}")]
    NotFound(String),

    /// The hypervisor driver has no introspection capability
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// A session for the same (instance, drive, target) is active or starting
    #[error("introspection of {target} on {instance_id}/{drive_id} is already active")]
    Conflict {
        instance_id: String,
        drive_id: String,
        target: String,
    },

    /// No port in the configured range refused a connection
    #[error("no free port in {low}-{high} after {attempts} attempts")]
    PortExhausted { low: u16, high: u16, attempts: u32 },

    /// The export endpoint never accepted a connection
    #[error("port {port} not ready after {attempts} attempts")]
    Timeout { port: u16, attempts: u32 },

    /// External tool could not be spawned or exited non-zero
    #[error("{tool} failed (exit code {exit_code:?}): {stderr}")]
    ExternalToolFailure {
        tool: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Repository action rejected (e.g. create on an identified record)
    #[error("cannot {action}: {reason}")]
    ActionError { action: String, reason: String },

    /// The session was cancelled while waiting
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The hypervisor monitor rejected or garbled a command
    #[error("monitor error: {0}")]
    Monitor(String),

    /// A bounded local resource (NBD device, queue index) is exhausted
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Persistent store failure
    #[error("store error: {0}")]
    Store(String),

    /// Invalid or unreadable configuration
    #[error("config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl IntrospectionError {
    /// Build an `ExternalToolFailure` for a tool that could not be started
    pub fn spawn_failure(tool: impl Into<String>, err: std::io::Error) -> Self {
        Self::ExternalToolFailure {
            tool: tool.into(),
            exit_code: None,
            stderr: err.to_string(),
        }
    }

    /// Errors that the boundary layer passes through as typed failures
    pub fn is_caller_visible(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_) | Self::NotImplemented(_) | Self::Conflict { .. }
        )
    }

    /// Short label used for the failure metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "not_found",
            Self::NotImplemented(_) => "not_implemented",
            Self::Conflict { .. } => "conflict",
            Self::PortExhausted { .. } => "port_exhausted",
            Self::Timeout { .. } => "timeout",
            Self::ExternalToolFailure { .. } => "external_tool",
            Self::ActionError { .. } => "action",
            Self::Cancelled(_) => "cancelled",
            Self::Monitor(_) => "monitor",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::Store(_) => "store",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
        }
    }
}
