//! Network block exports
//!
//! This module provides:
//! - `BlockExportController` - start the NBD export process and tell the
//!   hypervisor to mirror a drive into it
//! - `ExportHandle` - the running export process for one session
//! - Queue index leasing and reset for the export's write queue

pub mod controller;
pub mod handle;
pub mod queue;

pub use controller::BlockExportController;
pub use handle::ExportHandle;
pub use queue::{CommandQueueStore, QueueIndexPool, QueueLease, QueueStore};
