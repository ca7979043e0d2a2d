use std::{process::Stdio, time::Duration};

use async_trait::async_trait;
use thiserror::Error;
use tokio::{process::Command, time::timeout};
use tracing::trace;

use crate::snapshot::{parse_command_line, parse_working_dir};

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("Failed to start \"{command}\": {error}")]
    Spawn {
        command: String,
        error: std::io::Error,
    },
    #[error("\"{command}\" did not complete within {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("\"{command}\" failed with {status}: {stderr}")]
    Failed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },
    #[error("\"{command}\" produced non UTF-8 output")]
    Utf8 { command: String },
}

// Source of the raw GPU reports
#[async_trait]
pub trait GpuQuery: Send + Sync {
    // Per GPU "index, utilization" lines
    async fn utilization(&self) -> Result<String, CollaboratorError>;

    // Full report ending with the process table
    async fn process_table(&self) -> Result<String, CollaboratorError>;
}

// Per-process metadata lookups
#[async_trait]
pub trait ProcessInspector: Send + Sync {
    async fn command_line(&self, pid: u32) -> Result<String, CollaboratorError>;

    async fn working_dir(&self, pid: u32) -> Result<String, CollaboratorError>;
}

// Run a command to completion and return its stdout.
//
// The child is killed if it outlives `limit`, or if the future is
// dropped, so no process handle survives an aborted tick.
pub async fn run_command(
    program: &str,
    args: &[&str],
    limit: Duration,
) -> Result<String, CollaboratorError> {
    let command = std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ");

    trace!("Running \"{}\"", command);

    let child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|error| CollaboratorError::Spawn {
            command: command.clone(),
            error,
        })?;

    let output = match timeout(limit, child.wait_with_output()).await {
        Ok(result) => result.map_err(|error| CollaboratorError::Spawn {
            command: command.clone(),
            error,
        })?,
        Err(_) => {
            return Err(CollaboratorError::Timeout {
                command,
                timeout: limit,
            });
        }
    };

    if !output.status.success() {
        return Err(CollaboratorError::Failed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }

    String::from_utf8(output.stdout)
        .map_err(|_| CollaboratorError::Utf8 { command })
}

// GPU reports obtained from the nvidia-smi command line tool
pub struct NvidiaSmi {
    program: String,
    timeout: Duration,
}

impl NvidiaSmi {
    pub fn new(timeout: Duration) -> Self {
        Self {
            program: "nvidia-smi".to_string(),
            timeout,
        }
    }
}

#[async_trait]
impl GpuQuery for NvidiaSmi {
    async fn utilization(&self) -> Result<String, CollaboratorError> {
        run_command(
            &self.program,
            &["--query-gpu=index,utilization.gpu", "--format=csv,noheader"],
            self.timeout,
        )
        .await
    }

    async fn process_table(&self) -> Result<String, CollaboratorError> {
        run_command(&self.program, &[], self.timeout).await
    }
}

// Process lookups through `ps` and `pwdx`. Reading the working directory
// of processes owned by other users requires root.
pub struct ProcTools {
    timeout: Duration,
}

impl ProcTools {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ProcessInspector for ProcTools {
    async fn command_line(&self, pid: u32) -> Result<String, CollaboratorError> {
        let pid = pid.to_string();
        let output =
            run_command("ps", &["-o", "cmd", "fp", &pid], self.timeout).await?;

        Ok(parse_command_line(&output))
    }

    async fn working_dir(&self, pid: u32) -> Result<String, CollaboratorError> {
        let pid = pid.to_string();
        let output = run_command("pwdx", &[&pid], self.timeout).await?;

        Ok(parse_working_dir(&output))
    }
}
