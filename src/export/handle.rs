//! Export Handle - the running NBD export for one session
//!
//! The export outlives the activation call: it keeps receiving the
//! hypervisor's mirrored writes until the session is deactivated.

use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;

use super::queue::QueueLease;

/// A running export process and the queue it feeds
pub struct ExportHandle {
    /// Drive being mirrored into this export
    pub drive_id: String,
    /// Loopback port the export listens on
    pub port: u16,
    /// Export server process
    process: Child,
    /// Queue database the export writes into
    queue: QueueLease,
    started_at: Instant,
}

impl ExportHandle {
    pub fn new(drive_id: String, port: u16, process: Child, queue: QueueLease) -> Self {
        Self {
            drive_id,
            port,
            process,
            queue,
            started_at: Instant::now(),
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.id()
    }

    pub fn queue_index(&self) -> u32 {
        self.queue.index()
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Whether the export process is still alive
    pub fn is_running(&mut self) -> bool {
        matches!(self.process.try_wait(), Ok(None))
    }

    /// Stop the export: SIGTERM, wait up to `grace`, then SIGKILL
    ///
    /// Consumes the handle so the queue index is released afterwards.
    pub async fn stop(mut self, grace: Duration) {
        let Some(pid) = self.process.id() else {
            // Already reaped
            return;
        };

        if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to signal export process");
        }

        match tokio::time::timeout(grace, self.process.wait()).await {
            Ok(Ok(status)) => {
                tracing::debug!(pid, port = self.port, %status, "export stopped");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid, error = %e, "failed to wait for export process");
            }
            Err(_) => {
                tracing::warn!(pid, grace_ms = grace.as_millis() as u64, "export ignored SIGTERM, killing");
                if let Err(e) = self.process.kill().await {
                    tracing::warn!(pid, error = %e, "failed to kill export process");
                }
            }
        }
    }
}

impl std::fmt::Debug for ExportHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExportHandle")
            .field("drive_id", &self.drive_id)
            .field("port", &self.port)
            .field("pid", &self.pid())
            .field("queue_index", &self.queue_index())
            .field("age", &self.age())
            .finish()
    }
}
