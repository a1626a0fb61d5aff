//! QMP client
//!
//! Talks to a domain's monitor over its Unix socket. QMP is line-delimited
//! JSON: the server greets, the client negotiates capabilities, then each
//! command gets exactly one `return` or `error` reply, possibly interleaved
//! with asynchronous events which we skip.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;

use super::monitor::{self, MonitorReply};
use crate::error::{IntrospectionError, Result};

/// Client for one domain's QMP socket
///
/// Each call opens a fresh connection; the hypervisor holds no state for us
/// between commands.
#[derive(Debug, Clone)]
pub struct QmpClient {
    socket_path: PathBuf,
    timeout: Duration,
}

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl QmpClient {
    /// Create a new QMP client
    ///
    /// # Arguments
    /// * `socket_path` - Path to the domain's monitor socket
    /// * `timeout` - Upper bound for connect + handshake + reply
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send an already-encoded QMP command and return its `return` value as JSON text
    pub async fn execute_raw(&self, command: &str) -> Result<String> {
        let exchange = async {
            let mut conn = self.connect().await?;
            conn.send(command).await?;
            conn.read_return().await
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(result) => result.map(|value| value.to_string()),
            Err(_) => Err(IntrospectionError::Monitor(format!(
                "no reply from {} within {:?}",
                self.socket_path.display(),
                self.timeout
            ))),
        }
    }

    async fn connect(&self) -> Result<Connection> {
        let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
            IntrospectionError::Monitor(format!(
                "cannot connect to {}: {}",
                self.socket_path.display(),
                e
            ))
        })?;
        let (read_half, writer) = stream.into_split();
        let mut conn = Connection {
            reader: BufReader::new(read_half),
            writer,
        };

        match conn.read_reply().await? {
            MonitorReply::Greeting => {}
            other => {
                return Err(IntrospectionError::Monitor(format!(
                    "expected greeting, got {:?}",
                    other
                )))
            }
        }

        conn.send(&monitor::qmp_capabilities()?).await?;
        conn.read_return().await?;
        Ok(conn)
    }
}

impl Connection {
    async fn send(&mut self, command: &str) -> Result<()> {
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn read_reply(&mut self) -> Result<MonitorReply> {
        let mut line = String::new();
        if self.reader.read_line(&mut line).await? == 0 {
            return Err(IntrospectionError::Monitor("monitor closed the connection".into()));
        }
        monitor::parse_reply(&line)
    }

    async fn read_return(&mut self) -> Result<serde_json::Value> {
        loop {
            match self.read_reply().await? {
                MonitorReply::Return(value) => return Ok(value),
                MonitorReply::Event(name) => tracing::trace!(event = %name, "skipping monitor event"),
                MonitorReply::Greeting => {
                    return Err(IntrospectionError::Monitor("unexpected second greeting".into()))
                }
            }
        }
    }
}
