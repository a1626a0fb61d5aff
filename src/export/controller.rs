//! Block Export Controller
//!
//! Starts the local NBD export for a drive and issues the monitor command
//! that makes the hypervisor mirror the drive into it. The hypervisor
//! driver is injected at construction; nothing here resolves or caches a
//! monitor connection globally.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use super::handle::ExportHandle;
use super::queue::{CommandQueueStore, QueueIndexPool, QueueLease, QueueStore};
use crate::config::ExportConfig;
use crate::error::{IntrospectionError, Result};
use crate::hypervisor::{monitor, DomainHandle, HypervisorDriver, MonitorMode};

pub struct BlockExportController {
    driver: Arc<dyn HypervisorDriver>,
    server_bin: PathBuf,
    host: String,
    stop_grace: Duration,
    queues: QueueIndexPool,
    queue_store: Arc<dyn QueueStore>,
}

impl BlockExportController {
    pub fn new(
        driver: Arc<dyn HypervisorDriver>,
        host: impl Into<String>,
        config: &ExportConfig,
    ) -> Self {
        Self {
            driver,
            server_bin: config.server_bin.clone(),
            host: host.into(),
            stop_grace: config.stop_grace(),
            queues: QueueIndexPool::new(config.queue_db_base, config.queue_db_count),
            queue_store: Arc::new(CommandQueueStore::new(config.queue_reset.clone())),
        }
    }

    /// Replace the queue reset backend
    pub fn with_queue_store(mut self, store: Arc<dyn QueueStore>) -> Self {
        self.queue_store = store;
        self
    }

    pub fn driver(&self) -> &Arc<dyn HypervisorDriver> {
        &self.driver
    }

    pub fn stop_grace(&self) -> Duration {
        self.stop_grace
    }

    /// Reserve a queue index for a new session
    pub fn reserve_queue(&self) -> Result<QueueLease> {
        self.queues.reserve()
    }

    /// Clear the queue behind `lease`
    pub async fn reset_queue(&self, lease: &QueueLease) -> Result<()> {
        self.queue_store.reset(lease.index()).await
    }

    /// Spawn the export server for `drive_id` on `port`
    ///
    /// The process is killed if the returned handle is dropped without
    /// `ExportHandle::stop`.
    pub async fn start_export(
        &self,
        drive_id: &str,
        port: u16,
        queue: QueueLease,
    ) -> Result<ExportHandle> {
        let tool = self.server_bin.display().to_string();
        let mut child = Command::new(&self.server_bin)
            .arg("--host")
            .arg(&self.host)
            .arg("--port")
            .arg(port.to_string())
            .arg("--queue-db")
            .arg(queue.index().to_string())
            .arg("--name")
            .arg(drive_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| IntrospectionError::spawn_failure(tool.clone(), e))?;

        // An export that dies immediately (bad flags, port taken) is a spawn failure
        if let Some(status) = child.try_wait()? {
            return Err(IntrospectionError::ExternalToolFailure {
                tool,
                exit_code: status.code(),
                stderr: "export server exited during startup".to_string(),
            });
        }

        let handle = ExportHandle::new(drive_id.to_string(), port, child, queue);
        tracing::info!(
            drive_id,
            port,
            pid = ?handle.pid(),
            queue_index = handle.queue_index(),
            "export server started"
        );
        Ok(handle)
    }

    /// Ask the hypervisor to mirror `drive_device` into the export on `port`
    ///
    /// Returns once the monitor accepted the command; the mirror itself runs
    /// asynchronously and readiness must be probed separately.
    pub async fn mirror_drive(
        &self,
        domain: &DomainHandle,
        drive_device: &str,
        port: u16,
    ) -> Result<()> {
        let command = monitor::drive_backup(drive_device, &self.host, port)?;
        let reply = self
            .driver
            .send_monitor_command(domain, &command, MonitorMode::Qmp)
            .await?;
        tracing::info!(domain = %domain.name, drive = drive_device, port, reply = %reply, "drive mirror requested");
        Ok(())
    }

    /// Cancel the mirror job on `drive_device`
    pub async fn cancel_mirror(&self, domain: &DomainHandle, drive_device: &str) -> Result<()> {
        let command = monitor::block_job_cancel(drive_device)?;
        self.driver
            .send_monitor_command(domain, &command, MonitorMode::Qmp)
            .await?;
        tracing::info!(domain = %domain.name, drive = drive_device, "drive mirror cancelled");
        Ok(())
    }
}
