//! Introvisor - live virtual-disk introspection for running VMs
//!
//! The hypervisor mirrors a guest drive into a local NBD export; external
//! tools crawl the exported disk and run inference over the snapshot, and
//! the result is recorded as an introspected entity.
//!
//! # Modules
//!
//! - `net` - ephemeral port allocation and export readiness probing
//! - `hypervisor` - monitor command payloads, QMP client, hypervisor driver seam
//! - `export` - NBD export processes and their queue databases
//! - `tools` - external crawl and inference tool invocation
//! - `store` - introspected entity persistence
//! - `session` - the activate/deactivate state machine
//! - `driver` - introspection capability on top of a hypervisor driver
//! - `api` - boundary operations and JSON views
//! - `metrics` - Prometheus metrics for observability
//!
//! # Quick Start
//!
//! ```ignore
//! use introvisor::{IntrospectionConfig, SessionManager, RequestContext};
//!
//! let sessions = SessionManager::new(&config, driver, repository);
//! let entity = sessions.activate(&RequestContext::new(), &instance, "vda", "malware-scan").await?;
//! ```

pub mod api;
pub mod compute;
pub mod config;
pub mod context;
pub mod driver;
pub mod error;
pub mod export;
pub mod hypervisor;
pub mod metrics;
pub mod net;
pub mod session;
pub mod store;
pub mod tools;
pub mod tracing;

// Re-export commonly used types at crate root for convenience
pub use api::{ApiError, IntrospectionApi};
pub use compute::{Instance, InstanceRegistry, StaticInstanceRegistry};
pub use config::IntrospectionConfig;
pub use context::RequestContext;
pub use driver::{IntrospectionCapability, IntrospectionDriver};
pub use error::{IntrospectionError, Result};
pub use session::{SessionManager, SessionState};
pub use store::{EntityRepository, IntrospectedEntity};
