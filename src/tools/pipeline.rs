//! Crawl and inference pipeline
//!
//! ```text
//! export (nbd://host:port) ──attach──► /dev/nbdN (read-only)
//!                                          │
//!                               crawler <device> <artifact>
//!                                          │
//!                     detach (always) ◄────┘
//!                                          │
//!            inferencer <artifact> <instance_id> <queue_index>
//! ```

use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use super::nbd::{NbdClient, NbdDevicePool};
use super::runner::{run_tool, ToolInvocation};
use crate::config::CrawlConfig;
use crate::error::Result;

/// Runs the external crawl and inference tools for one export
#[derive(Debug, Clone)]
pub struct CrawlPipeline {
    host: String,
    crawler_bin: PathBuf,
    inferencer_bin: PathBuf,
    artifact_dir: PathBuf,
    nbd: NbdClient,
    devices: NbdDevicePool,
}

impl CrawlPipeline {
    pub fn new(host: impl Into<String>, config: &CrawlConfig) -> Self {
        Self {
            host: host.into(),
            crawler_bin: config.crawler_bin.clone(),
            inferencer_bin: config.inferencer_bin.clone(),
            artifact_dir: config.artifact_dir.clone(),
            nbd: NbdClient::new(&config.nbd_client_bin),
            devices: NbdDevicePool::new(config.nbd_devices.clone()),
        }
    }

    /// Where the snapshot for an export ends up
    pub fn artifact_path(&self, instance_id: &str, port: u16) -> PathBuf {
        self.artifact_dir.join(format!("{}-{}.bson", instance_id, port))
    }

    /// Attach the export locally, crawl it, detach, and return the snapshot path
    ///
    /// The device is detached even when the attach or the crawl fails; a
    /// detach failure is logged and does not mask the crawl result.
    pub async fn crawl(
        &self,
        port: u16,
        instance_id: &str,
        cancel: &CancellationToken,
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.artifact_dir).await?;
        let artifact = self.artifact_path(instance_id, port);

        let lease = self.devices.lease(cancel).await?;
        let device = lease.device().to_path_buf();

        // nbd-client may have configured the device before failing
        let result = match self.nbd.attach(&self.host, port, &device, cancel).await {
            Ok(()) => {
                tracing::info!(port, device = %device.display(), "export attached");
                let crawl = ToolInvocation::new(&self.crawler_bin)
                    .arg(&device)
                    .arg(&artifact);
                run_tool(&crawl, cancel).await.map(|_| ())
            }
            Err(e) => Err(e),
        };

        if let Err(e) = self.nbd.detach(&device).await {
            tracing::warn!(device = %device.display(), error = %e, "failed to detach NBD device");
        }
        drop(lease);

        result?;
        tracing::info!(artifact = %artifact.display(), "crawl complete");
        Ok(artifact)
    }

    /// Run inference over a crawl snapshot
    ///
    /// The inferencer writes its findings to the queue database at
    /// `queue_index`, not to the entity store.
    pub async fn infer(
        &self,
        artifact: &std::path::Path,
        instance_id: &str,
        queue_index: u32,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let infer = ToolInvocation::new(&self.inferencer_bin)
            .arg(artifact)
            .arg(instance_id)
            .arg(queue_index.to_string());
        run_tool(&infer, cancel).await?;
        tracing::info!(artifact = %artifact.display(), queue_index, "inference complete");
        Ok(())
    }
}
