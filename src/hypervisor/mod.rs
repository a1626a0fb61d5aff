//! Hypervisor monitor access
//!
//! This module provides:
//! - Monitor command payloads (drive-backup, block-job-cancel, HMP passthrough)
//! - A QMP client for a domain's monitor socket
//! - The `HypervisorDriver` trait the rest of the crate depends on

pub mod driver;
pub mod monitor;
pub mod qmp;

pub use driver::{DomainHandle, HypervisorDriver, QemuDriver};
pub use monitor::MonitorMode;
pub use qmp::QmpClient;
