//! Ephemeral port selection
//!
//! A port is considered free when a TCP connect to it is refused. This is a
//! best-effort check, not a reservation: another process may bind the port
//! between the probe and the export server starting on it.

use std::time::Duration;

use rand::Rng;
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::config::PortConfig;
use crate::error::{IntrospectionError, Result};
use crate::metrics::PORT_ALLOCATION_ATTEMPTS;

/// A connect that neither succeeds nor fails within this window counts as occupied
const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

/// Picks random free ports from a range
#[derive(Debug, Clone)]
pub struct PortAllocator {
    host: String,
    max_attempts: u32,
}

impl PortAllocator {
    pub fn new(host: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            host: host.into(),
            max_attempts,
        }
    }

    pub fn from_config(config: &PortConfig) -> Self {
        Self::new(config.bind_host.clone(), config.max_attempts)
    }

    /// Return a port in `[low, high]` that currently refuses connections
    ///
    /// Fails with `PortExhausted` after `max_attempts` random picks all hit
    /// listening ports.
    pub async fn allocate(&self, low: u16, high: u16) -> Result<u16> {
        if low > high {
            return Err(IntrospectionError::Config(format!(
                "invalid port range {}-{}",
                low, high
            )));
        }

        for attempt in 1..=self.max_attempts {
            let port = rand::thread_rng().gen_range(low..=high);

            if !self.is_occupied(port).await {
                PORT_ALLOCATION_ATTEMPTS.observe(attempt as f64);
                tracing::debug!(port, attempt, "allocated export port");
                return Ok(port);
            }

            tracing::trace!(port, attempt, "port in use, retrying");
        }

        PORT_ALLOCATION_ATTEMPTS.observe(self.max_attempts as f64);
        Err(IntrospectionError::PortExhausted {
            low,
            high,
            attempts: self.max_attempts,
        })
    }

    /// A successful connect means something is already listening
    async fn is_occupied(&self, port: u16) -> bool {
        match timeout(CONNECT_TIMEOUT, TcpStream::connect((self.host.as_str(), port))).await {
            Ok(Ok(_stream)) => true,
            Ok(Err(_)) => false,
            Err(_) => true,
        }
    }
}
