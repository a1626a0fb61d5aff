//! Per-request context

use uuid::Uuid;

/// Carried through every operation so logs and spans share a trace id
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub trace_id: String,
}

impl RequestContext {
    /// New context with a time-sortable trace id
    pub fn new() -> Self {
        Self {
            trace_id: Uuid::now_v7().to_string(),
        }
    }

    /// Continue an existing trace (e.g., from an upstream header)
    pub fn with_trace_id(trace_id: impl Into<String>) -> Self {
        Self {
            trace_id: trace_id.into(),
        }
    }
}

impl Default for RequestContext {
    fn default() -> Self {
        Self::new()
    }
}
