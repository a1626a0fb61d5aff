//! Loopback networking helpers for block exports
//!
//! - `port` - pick a free ephemeral port for a new export
//! - `probe` - wait until an export accepts connections

pub mod port;
pub mod probe;

pub use port::PortAllocator;
pub use probe::ReadinessProbe;
