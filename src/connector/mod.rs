//! Execution connectors behind `POST /tasks/{id}/run`.
//!
//! The coordination core only authorizes a run and records its output;
//! spawning the process is the connector's job. `LocalExecConnector` runs
//! an allow-listed program directly (no shell) with:
//! - Working directory isolation
//! - Timeout enforcement
//! - Output capture and truncation

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::ConnectorConfig;
use crate::error::ConnectorError;

/// Maximum captured size per stream before truncation (64KB).
const MAX_OUTPUT_SIZE: usize = 64 * 1024;

/// What to run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunRequest {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// What came back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Executes commands on behalf of a worker.
#[async_trait]
pub trait Connector: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, request: &RunRequest) -> Result<RunOutput, ConnectorError>;
}

/// Runs allow-listed programs on the daemon host.
#[derive(Debug)]
pub struct LocalExecConnector {
    workdir: PathBuf,
    allowed: HashSet<String>,
    timeout: Duration,
}

impl LocalExecConnector {
    pub fn new(config: &ConnectorConfig) -> Self {
        Self {
            workdir: config.workdir.clone(),
            allowed: config.allowed_commands.iter().cloned().collect(),
            timeout: config.timeout,
        }
    }

    /// Bare program names from the allowlist only; no paths.
    fn check_allowed(&self, command: &str) -> Result<(), ConnectorError> {
        let command = command.trim();
        if command.is_empty() || command.contains(['/', '\\']) || !self.allowed.contains(command) {
            return Err(ConnectorError::NotAllowed(command.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Connector for LocalExecConnector {
    fn name(&self) -> &str {
        "local"
    }

    async fn run(&self, request: &RunRequest) -> Result<RunOutput, ConnectorError> {
        self.check_allowed(&request.command)?;

        let mut command = Command::new(request.command.trim());
        command
            .args(&request.args)
            .current_dir(&self.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| ConnectorError::SpawnFailed(format!("{}: {e}", request.command)))?;

        debug!(command = %request.command, args = ?request.args, "Command spawned");

        // Dropping the future on timeout kills the child.
        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| ConnectorError::SpawnFailed(e.to_string()))?,
            Err(_) => {
                warn!(command = %request.command, timeout = ?self.timeout, "Command timed out");
                return Err(ConnectorError::Timeout(self.timeout));
            }
        };

        Ok(RunOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: truncate_output(&String::from_utf8_lossy(&output.stdout)),
            stderr: truncate_output(&String::from_utf8_lossy(&output.stderr)),
        })
    }
}

/// Keep the head and tail of oversized output.
fn truncate_output(s: &str) -> String {
    if s.len() <= MAX_OUTPUT_SIZE {
        return s.to_string();
    }
    let half = MAX_OUTPUT_SIZE / 2;
    let head_end = floor_char_boundary(s, half);
    let tail_start = floor_char_boundary(s, s.len() - half);
    format!(
        "{}\n\n... [truncated {} bytes] ...\n\n{}",
        &s[..head_end],
        tail_start - head_end,
        &s[tail_start..]
    )
}

/// Largest byte index <= `i` that is a char boundary.
fn floor_char_boundary(s: &str, i: usize) -> usize {
    if i >= s.len() {
        return s.len();
    }
    let mut pos = i;
    while pos > 0 && !s.is_char_boundary(pos) {
        pos -= 1;
    }
    pos
}
