//! External tooling for the crawl/inference pipeline
//!
//! - `runner` - spawn a tool, capture its output, surface non-zero exits
//! - `nbd` - lease local NBD devices and attach/detach exports
//! - `pipeline` - crawl an attached export, then run inference on the snapshot

pub mod nbd;
pub mod pipeline;
pub mod runner;

pub use nbd::{DeviceLease, NbdClient, NbdDevicePool};
pub use pipeline::CrawlPipeline;
pub use runner::{run_tool, ToolInvocation, ToolOutput};
