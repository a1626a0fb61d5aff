//! Introspection service configuration
//!
//! Everything that used to be hard-coded (tool paths, the NBD device, the
//! port range, probe timings) lives here. Each section has a `Default` that
//! matches a stock deployment, so a TOML file only needs the overrides:
//!
//! ```toml
//! enforce_unique_sessions = true
//!
//! [ports]
//! low = 9000
//! high = 15000
//!
//! [crawl]
//! nbd_devices = ["/dev/nbd0", "/dev/nbd1"]
//!
//! [instances]
//! "8c1f0e1e-2d0a-4bb5-9a55-3f1f4ddc2b1e" = "instance-00000001"
//! ```

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{IntrospectionError, Result};

/// Ephemeral port range used for network block exports
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PortConfig {
    /// Lowest port handed out (inclusive)
    pub low: u16,
    /// Highest port handed out (inclusive)
    pub high: u16,
    /// Random picks before giving up with `PortExhausted`
    pub max_attempts: u32,
    /// Host the export binds to and the hypervisor connects to
    pub bind_host: String,
}

impl Default for PortConfig {
    fn default() -> Self {
        Self {
            low: 9000,
            high: 15000,
            max_attempts: 256,
            bind_host: "127.0.0.1".to_string(),
        }
    }
}

/// Readiness polling for a freshly started export
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    pub poll_interval_ms: u64,
    /// Extra wait after the first successful connect, lets the mirror settle
    pub settle_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            settle_delay_ms: 2000,
            max_attempts: 120,
        }
    }
}

impl ProbeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

/// Network block export process and its write queue
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// NBD server binary that receives the mirrored writes
    pub server_bin: PathBuf,
    /// First queue database index handed to sessions
    pub queue_db_base: u32,
    /// Number of queue indexes (and therefore concurrent sessions)
    pub queue_db_count: u32,
    /// Command clearing a queue before reuse; `{db}` is replaced by the index
    pub queue_reset: Vec<String>,
    /// Time between SIGTERM and SIGKILL when stopping the export
    pub stop_grace_ms: u64,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            server_bin: PathBuf::from("gray-nbd-server"),
            queue_db_base: 4,
            queue_db_count: 8,
            queue_reset: vec![
                "redis-cli".to_string(),
                "-n".to_string(),
                "{db}".to_string(),
                "FLUSHDB".to_string(),
            ],
            stop_grace_ms: 3000,
        }
    }
}

impl ExportConfig {
    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Local attach + crawl + inference tooling
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
    pub crawler_bin: PathBuf,
    pub inferencer_bin: PathBuf,
    pub nbd_client_bin: PathBuf,
    /// Local NBD devices leased one per crawl
    pub nbd_devices: Vec<PathBuf>,
    /// Where crawl snapshots are written
    pub artifact_dir: PathBuf,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            crawler_bin: PathBuf::from("gray-crawler"),
            inferencer_bin: PathBuf::from("gray-inferencer"),
            nbd_client_bin: PathBuf::from("nbd-client"),
            nbd_devices: (0..4).map(|i| PathBuf::from(format!("/dev/nbd{}", i))).collect(),
            artifact_dir: PathBuf::from("/var/lib/introvisor/artifacts"),
        }
    }
}

/// Hypervisor monitor access
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HypervisorConfig {
    /// Directory holding one `<domain>.monitor` QMP socket per domain
    pub monitor_dir: PathBuf,
    pub connect_timeout_ms: u64,
}

impl Default for HypervisorConfig {
    fn default() -> Self {
        Self {
            monitor_dir: PathBuf::from("/var/lib/libvirt/qemu"),
            connect_timeout_ms: 5000,
        }
    }
}

impl HypervisorConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Where introspected entity records are kept
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// JSON file backing the store; in-memory when unset
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    pub service_name: String,
    /// OTLP collector endpoint; console logging only when unset
    pub otlp_endpoint: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            service_name: "introvisor".to_string(),
            otlp_endpoint: None,
        }
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct IntrospectionConfig {
    pub ports: PortConfig,
    pub probe: ProbeConfig,
    pub export: ExportConfig,
    pub crawl: CrawlConfig,
    pub hypervisor: HypervisorConfig,
    pub store: StoreConfig,
    pub tracing: TracingConfig,
    /// Instance id -> hypervisor domain name
    pub instances: BTreeMap<String, String>,
    /// Reject a second session on the same (instance, drive, target)
    pub enforce_unique_sessions: bool,
    /// Address for the Prometheus `/metrics` listener
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for IntrospectionConfig {
    fn default() -> Self {
        Self {
            ports: PortConfig::default(),
            probe: ProbeConfig::default(),
            export: ExportConfig::default(),
            crawl: CrawlConfig::default(),
            hypervisor: HypervisorConfig::default(),
            store: StoreConfig::default(),
            tracing: TracingConfig::default(),
            instances: BTreeMap::new(),
            enforce_unique_sessions: true,
            metrics_addr: None,
        }
    }
}

impl IntrospectionConfig {
    /// Parse a TOML document and validate it
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| IntrospectionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            IntrospectionError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&text)
    }

    /// Reject settings that would make every activation fail
    pub fn validate(&self) -> Result<()> {
        if self.ports.low == 0 || self.ports.low > self.ports.high {
            return Err(IntrospectionError::Config(format!(
                "invalid port range {}-{}",
                self.ports.low, self.ports.high
            )));
        }
        if self.ports.max_attempts == 0 {
            return Err(IntrospectionError::Config("ports.max_attempts must be > 0".into()));
        }
        if self.probe.poll_interval_ms == 0 || self.probe.max_attempts == 0 {
            return Err(IntrospectionError::Config(
                "probe.poll_interval_ms and probe.max_attempts must be > 0".into(),
            ));
        }
        if self.crawl.nbd_devices.is_empty() {
            return Err(IntrospectionError::Config("crawl.nbd_devices is empty".into()));
        }
        if self.export.queue_db_count == 0 {
            return Err(IntrospectionError::Config("export.queue_db_count must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IntrospectionConfig::default();
        assert_eq!(config.ports.low, 9000);
        assert_eq!(config.ports.high, 15000);
        assert_eq!(config.crawl.nbd_devices.len(), 4);
        assert!(config.enforce_unique_sessions);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = IntrospectionConfig::from_toml(
            r#"
            [ports]
            low = 20000
            high = 20010

            [instances]
            vm-1 = "instance-00000001"
            "#,
        )
        .unwrap();

        assert_eq!(config.ports.low, 20000);
        assert_eq!(config.ports.max_attempts, 256);
        assert_eq!(config.probe.settle_delay_ms, 2000);
        assert_eq!(config.instances.get("vm-1").unwrap(), "instance-00000001");
    }

    #[test]
    fn test_rejects_inverted_range() {
        let err = IntrospectionConfig::from_toml("[ports]\nlow = 15000\nhigh = 9000\n").unwrap_err();
        assert!(matches!(err, IntrospectionError::Config(_)));
    }

    #[test]
    fn test_rejects_empty_device_pool() {
        let err = IntrospectionConfig::from_toml("[crawl]\nnbd_devices = []\n").unwrap_err();
        assert!(matches!(err, IntrospectionError::Config(_)));
    }
}
