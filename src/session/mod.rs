//! Introspection sessions
//!
//! A session walks one drive through the whole pipeline:
//!
//! ```text
//! Idle ─► PortAllocated ─► ExportStarted ─► StreamReady ─► Crawling ─► Inferring ─► Persisted
//!   │            │                │               │            │            │
//!   └────────────┴────────────────┴───────────────┴────────────┴────────────┴─► Failed
//! ```
//!
//! `SessionManager` owns the live sessions; a persisted session keeps its
//! export running until it is deactivated.

pub mod manager;
pub mod state;

pub use manager::{SessionManager, SessionSummary};
pub use state::{Session, SessionKey, SessionState};
