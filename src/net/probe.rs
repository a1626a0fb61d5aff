//! Readiness polling for block exports
//!
//! The hypervisor starts mirroring asynchronously, so the only signal that
//! the export is live is the port accepting connections. After the first
//! successful connect we wait a further settle delay before anything reads
//! from the stream. The delay is empirical; it does not guarantee the mirror
//! has caught up.

use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ProbeConfig;
use crate::error::{IntrospectionError, Result};

/// Upper bound on a single connect attempt
const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);

/// Bounded, cancellable TCP readiness probe
#[derive(Debug, Clone)]
pub struct ReadinessProbe {
    host: String,
    poll_interval: Duration,
    settle_delay: Duration,
    max_attempts: u32,
}

impl ReadinessProbe {
    pub fn new(
        host: impl Into<String>,
        poll_interval: Duration,
        settle_delay: Duration,
        max_attempts: u32,
    ) -> Self {
        Self {
            host: host.into(),
            poll_interval,
            settle_delay,
            max_attempts,
        }
    }

    pub fn from_config(host: impl Into<String>, config: &ProbeConfig) -> Self {
        Self::new(
            host,
            config.poll_interval(),
            config.settle_delay(),
            config.max_attempts,
        )
    }

    /// Wait until `port` accepts a connection, then sleep the settle delay
    ///
    /// # Errors
    /// * `Timeout` - `max_attempts` connects all failed
    /// * `Cancelled` - `cancel` fired while polling or settling
    pub async fn wait_ready(&self, port: u16, cancel: &CancellationToken) -> Result<()> {
        self.wait_listening(port, cancel).await?;
        self.settle(port, cancel).await
    }

    /// Poll until `port` accepts a connection; returns the attempt that succeeded
    pub async fn wait_listening(&self, port: u16, cancel: &CancellationToken) -> Result<u32> {
        for attempt in 1..=self.max_attempts {
            if self.try_connect(port, cancel).await? {
                tracing::debug!(port, attempt, "export reachable");
                return Ok(attempt);
            }

            if attempt < self.max_attempts {
                sleep_or_cancel(self.poll_interval, cancel, port).await?;
            }
        }

        Err(IntrospectionError::Timeout {
            port,
            attempts: self.max_attempts,
        })
    }

    async fn try_connect(&self, port: u16, cancel: &CancellationToken) -> Result<bool> {
        let connect = tokio::time::timeout(
            CONNECT_TIMEOUT,
            TcpStream::connect((self.host.as_str(), port)),
        );
        tokio::select! {
            _ = cancel.cancelled() => Err(cancelled(port)),
            res = connect => Ok(matches!(res, Ok(Ok(_)))),
        }
    }

    /// Sleep the settle delay unless cancelled
    pub async fn settle(&self, port: u16, cancel: &CancellationToken) -> Result<()> {
        tracing::debug!(port, settle_ms = self.settle_delay.as_millis() as u64, "settling");
        sleep_or_cancel(self.settle_delay, cancel, port).await
    }
}

async fn sleep_or_cancel(delay: Duration, cancel: &CancellationToken, port: u16) -> Result<()> {
    tokio::select! {
        _ = cancel.cancelled() => Err(cancelled(port)),
        _ = tokio::time::sleep(delay) => Ok(()),
    }
}

fn cancelled(port: u16) -> IntrospectionError {
    IntrospectionError::Cancelled(format!("readiness wait on port {}", port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    fn probe(max_attempts: u32) -> ReadinessProbe {
        ReadinessProbe::new(
            "127.0.0.1",
            Duration::from_millis(10),
            Duration::from_millis(10),
            max_attempts,
        )
    }

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_ready_when_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        probe(3).wait_ready(port, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            probe(3).wait_listening(port, &CancellationToken::new()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_timeout_when_never_listening() {
        let port = closed_port().await;
        let err = probe(3)
            .wait_ready(port, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, IntrospectionError::Timeout { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn test_becomes_ready_after_delay() {
        let port = closed_port().await;
        let server = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
            let _ = listener.accept().await;
        });

        probe(100).wait_ready(port, &CancellationToken::new()).await.unwrap();
        server.abort();
    }

    #[tokio::test]
    async fn test_cancel_interrupts_wait() {
        let port = closed_port().await;
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ReadinessProbe::new("127.0.0.1", Duration::from_secs(60), Duration::ZERO, 10)
            .wait_ready(port, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IntrospectionError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_unanswered_connect() {
        // 10.255.255.1 is unroutable; a connect there hangs or fails slowly
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let err = ReadinessProbe::new("10.255.255.1", Duration::from_secs(60), Duration::ZERO, 10)
            .wait_listening(9, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, IntrospectionError::Cancelled(_)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
