//! External tool invocation
//!
//! Every tool run goes through `run_tool`, which captures stdout/stderr,
//! records the runtime, and turns a spawn failure or non-zero exit into
//! `ExternalToolFailure`. Children are killed if the session is cancelled
//! while they run.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::error::{IntrospectionError, Result};
use crate::metrics::TOOL_DURATION;

/// Captured stderr is cut to this many bytes in error messages
const STDERR_LIMIT: usize = 4096;

/// Program plus argument vector
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl ToolInvocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// File name of the program, used as the metric label and in errors
    pub fn label(&self) -> String {
        self.program
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// Result of a finished tool
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub tool: String,
    /// `None` when the process was killed by a signal
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Convert a non-zero exit into `ExternalToolFailure`
    pub fn into_result(self) -> Result<ToolOutput> {
        if self.success() {
            return Ok(self);
        }
        Err(IntrospectionError::ExternalToolFailure {
            tool: self.tool,
            exit_code: self.exit_code,
            stderr: truncate(self.stderr.trim(), STDERR_LIMIT),
        })
    }
}

/// Run a tool to completion
///
/// # Errors
/// * `ExternalToolFailure` - spawn failed or exit status non-zero
/// * `Cancelled` - `cancel` fired first; the child is killed
pub async fn run_tool(invocation: &ToolInvocation, cancel: &CancellationToken) -> Result<ToolOutput> {
    let tool = invocation.label();
    let start = Instant::now();

    let child = Command::new(&invocation.program)
        .args(&invocation.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| IntrospectionError::spawn_failure(tool.clone(), e))?;

    tracing::debug!(tool = %tool, pid = ?child.id(), args = ?invocation.args, "tool started");

    // Dropping the wait future drops the child, and kill_on_drop reaps it
    let output = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::warn!(tool = %tool, "tool cancelled, killing");
            return Err(IntrospectionError::Cancelled(format!("{} interrupted", tool)));
        }
        output = child.wait_with_output() => output
            .map_err(|e| IntrospectionError::spawn_failure(tool.clone(), e))?,
    };

    let duration = start.elapsed();
    TOOL_DURATION.with_label_values(&[&tool]).observe(duration.as_secs_f64());

    let result = ToolOutput {
        tool,
        exit_code: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        duration,
    };

    tracing::debug!(
        tool = %result.tool,
        exit_code = ?result.exit_code,
        duration_ms = duration.as_millis() as u64,
        "tool finished"
    );

    result.into_result()
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
