//! Local NBD devices
//!
//! A crawl attaches the export to a local `/dev/nbdN` read-only. Devices are
//! a shared host resource, so each crawl leases one from a fixed pool and
//! gives it back when the lease drops. When every device is busy the next
//! crawl waits.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use super::runner::{run_tool, ToolInvocation};
use crate::error::{IntrospectionError, Result};

/// Pool of local NBD device nodes
#[derive(Debug, Clone)]
pub struct NbdDevicePool {
    free: Arc<Mutex<Vec<PathBuf>>>,
    permits: Arc<Semaphore>,
}

/// Exclusive use of one device; returned to the pool on drop
#[derive(Debug)]
pub struct DeviceLease {
    device: PathBuf,
    free: Arc<Mutex<Vec<PathBuf>>>,
    _permit: OwnedSemaphorePermit,
}

impl DeviceLease {
    pub fn device(&self) -> &Path {
        &self.device
    }
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        if let Ok(mut free) = self.free.lock() {
            free.push(self.device.clone());
        }
    }
}

impl NbdDevicePool {
    pub fn new(devices: Vec<PathBuf>) -> Self {
        let permits = Arc::new(Semaphore::new(devices.len()));
        // Reverse so pop() hands out the first configured device first
        let mut free = devices;
        free.reverse();
        Self {
            free: Arc::new(Mutex::new(free)),
            permits,
        }
    }

    /// Number of devices not currently leased
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Wait for a free device
    pub async fn lease(&self, cancel: &CancellationToken) -> Result<DeviceLease> {
        let permit = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(IntrospectionError::Cancelled("waiting for an NBD device".into()));
            }
            permit = Arc::clone(&self.permits).acquire_owned() => permit
                .map_err(|_| IntrospectionError::ResourceExhausted("NBD device pool closed".into()))?,
        };

        let device = self
            .free
            .lock()
            .map_err(|_| IntrospectionError::ResourceExhausted("NBD device pool poisoned".into()))?
            .pop()
            .ok_or_else(|| IntrospectionError::ResourceExhausted("no NBD device free".into()))?;

        tracing::debug!(device = %device.display(), "leased NBD device");
        Ok(DeviceLease {
            device,
            free: Arc::clone(&self.free),
            _permit: permit,
        })
    }
}

/// `nbd-client` wrapper
#[derive(Debug, Clone)]
pub struct NbdClient {
    bin: PathBuf,
}

impl NbdClient {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    /// Attach `host:port` to `device` read-only
    pub async fn attach(
        &self,
        host: &str,
        port: u16,
        device: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let invocation = ToolInvocation::new(&self.bin)
            .arg(host)
            .arg(port.to_string())
            .arg(device)
            .arg("-readonly");
        run_tool(&invocation, cancel).await?;
        Ok(())
    }

    /// Disconnect `device`; not cancellable, it is part of cleanup
    pub async fn detach(&self, device: &Path) -> Result<()> {
        let invocation = ToolInvocation::new(&self.bin).arg("-d").arg(device);
        run_tool(&invocation, &CancellationToken::new()).await?;
        Ok(())
    }
}
