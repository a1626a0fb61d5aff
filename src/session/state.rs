//! Session state machine

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::error::{IntrospectionError, Result};
use crate::export::ExportHandle;
use crate::hypervisor::DomainHandle;

/// Where a session is in its lifecycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    PortAllocated,
    ExportStarted,
    StreamReady,
    Crawling,
    Inferring,
    /// Entity persisted, export live (terminal success)
    Persisted,
    /// Activation aborted with the given reason
    Failed(String),
}

impl SessionState {
    /// The only state `self` may advance to on success
    pub fn successor(&self) -> Option<SessionState> {
        match self {
            Self::Idle => Some(Self::PortAllocated),
            Self::PortAllocated => Some(Self::ExportStarted),
            Self::ExportStarted => Some(Self::StreamReady),
            Self::StreamReady => Some(Self::Crawling),
            Self::Crawling => Some(Self::Inferring),
            Self::Inferring => Some(Self::Persisted),
            Self::Persisted | Self::Failed(_) => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Persisted | Self::Failed(_))
    }

    /// Label for logs and the stage-failure metric
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::PortAllocated => "port_allocated",
            Self::ExportStarted => "export_started",
            Self::StreamReady => "stream_ready",
            Self::Crawling => "crawling",
            Self::Inferring => "inferring",
            Self::Persisted => "persisted",
            Self::Failed(_) => "failed",
        }
    }
}

/// (instance, drive, target) triple identifying a session
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub instance_id: String,
    pub drive_id: String,
    pub target: String,
}

impl SessionKey {
    pub fn new(
        instance_id: impl Into<String>,
        drive_id: impl Into<String>,
        target: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            drive_id: drive_id.into(),
            target: target.into(),
        }
    }

    pub fn conflict(&self) -> IntrospectionError {
        IntrospectionError::Conflict {
            instance_id: self.instance_id.clone(),
            drive_id: self.drive_id.clone(),
            target: self.target.clone(),
        }
    }
}

/// Transient state of one introspection session
///
/// Crawl and inference processes are owned by the tasks running them; the
/// session reaches them through `cancel`, which kills whichever is running.
pub struct Session {
    pub key: SessionKey,
    pub domain: Option<DomainHandle>,
    pub port: Option<u16>,
    pub export: Option<ExportHandle>,
    /// Set once the hypervisor accepted the mirror command
    pub mirroring: bool,
    pub entity_id: Option<i64>,
    pub cancel: CancellationToken,
    status: SessionState,
    created_at: Instant,
}

impl Session {
    pub fn new(key: SessionKey, cancel: CancellationToken) -> Self {
        Self {
            key,
            domain: None,
            port: None,
            export: None,
            mirroring: false,
            entity_id: None,
            cancel,
            status: SessionState::Idle,
            created_at: Instant::now(),
        }
    }

    pub fn status(&self) -> &SessionState {
        &self.status
    }

    /// Move to `next`, which must be the current state's successor
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if self.status.successor().as_ref() != Some(&next) {
            return Err(IntrospectionError::ActionError {
                action: "advance session".to_string(),
                reason: format!("{} cannot follow {}", next.as_str(), self.status.as_str()),
            });
        }
        tracing::debug!(from = self.status.as_str(), to = next.as_str(), "session transition");
        self.status = next;
        Ok(())
    }

    /// Enter `Failed`; a terminal session keeps its state
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if !self.status.is_terminal() {
            self.status = SessionState::Failed(reason.into());
        }
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("port", &self.port)
            .field("export", &self.export)
            .field("entity_id", &self.entity_id)
            .field("status", &self.status)
            .field("age", &self.age())
            .finish()
    }
}
