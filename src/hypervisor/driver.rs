//! Hypervisor driver seam
//!
//! The introspection code only needs two things from the hypervisor: resolve
//! a domain by name and push a monitor command at it. `HypervisorDriver`
//! captures exactly that, plus a capability flag so callers can detect a
//! driver that cannot take monitor commands instead of failing mid-session.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use super::monitor::{self, MonitorMode};
use super::qmp::QmpClient;
use crate::config::HypervisorConfig;
use crate::error::{IntrospectionError, Result};

/// Resolved reference to a running domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainHandle {
    /// Hypervisor-level domain name (e.g., "instance-00000001")
    pub name: String,
    /// Monitor socket for this domain
    pub monitor_socket: PathBuf,
}

#[async_trait]
pub trait HypervisorDriver: Send + Sync {
    /// Short driver name for logs and `NotImplemented` messages
    fn name(&self) -> &str;

    /// Whether `send_monitor_command` is backed by a real monitor
    fn supports_monitor_commands(&self) -> bool;

    async fn lookup_domain(&self, name: &str) -> Result<DomainHandle>;

    /// Deliver `command` and return the monitor's result text
    async fn send_monitor_command(
        &self,
        domain: &DomainHandle,
        command: &str,
        mode: MonitorMode,
    ) -> Result<String>;
}

/// QEMU driver reaching each domain through `<monitor_dir>/<name>.monitor`
#[derive(Debug, Clone)]
pub struct QemuDriver {
    monitor_dir: PathBuf,
    timeout: Duration,
}

impl QemuDriver {
    pub fn new(monitor_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            monitor_dir: monitor_dir.into(),
            timeout,
        }
    }

    pub fn from_config(config: &HypervisorConfig) -> Self {
        Self::new(config.monitor_dir.clone(), config.connect_timeout())
    }

    fn socket_for(&self, name: &str) -> PathBuf {
        self.monitor_dir.join(format!("{}.monitor", name))
    }
}

#[async_trait]
impl HypervisorDriver for QemuDriver {
    fn name(&self) -> &str {
        "qemu"
    }

    fn supports_monitor_commands(&self) -> bool {
        true
    }

    async fn lookup_domain(&self, name: &str) -> Result<DomainHandle> {
        let monitor_socket = self.socket_for(name);
        if tokio::fs::metadata(&monitor_socket).await.is_err() {
            return Err(IntrospectionError::NotFound(format!(
                "domain {} (no monitor at {})",
                name,
                monitor_socket.display()
            )));
        }
        Ok(DomainHandle {
            name: name.to_string(),
            monitor_socket,
        })
    }

    async fn send_monitor_command(
        &self,
        domain: &DomainHandle,
        command: &str,
        mode: MonitorMode,
    ) -> Result<String> {
        let payload = monitor::wrap(command, mode)?;
        tracing::debug!(domain = %domain.name, command = %payload, "sending monitor command");
        QmpClient::new(&domain.monitor_socket, self.timeout)
            .execute_raw(&payload)
            .await
    }
}
