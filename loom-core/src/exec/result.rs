//! Outcome and failure types for subprocess execution

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failures raised by the command gateway
#[derive(Error, Debug)]
pub enum ExecError {
    /// Command failed validation; no process was spawned
    #[error("Security rejected: {0}")]
    SecurityRejected(String),

    /// Working directory is outside every permitted root
    #[error("Permission denied: working directory {} is outside allowed directories", .0.display())]
    PermissionDenied(PathBuf),

    /// Command exceeded its timeout and its process group was terminated
    #[error("Command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    /// Executable could not be found
    #[error("Command not found: {0}")]
    ProcessNotFound(String),

    /// Non-zero exit, only raised when the caller opted into it
    #[error("Command failed with exit code {return_code}: {command}")]
    NonZeroExit {
        command: String,
        return_code: i32,
        stdout: String,
        stderr: String,
    },

    /// Spawning or talking to the process failed
    #[error("Process IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecError {
    /// Classification recorded on per-repository results
    pub fn kind(&self) -> ErrorKind {
        match self {
            ExecError::SecurityRejected(_) => ErrorKind::SecurityRejected,
            ExecError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            ExecError::Timeout { .. } => ErrorKind::Timeout,
            ExecError::ProcessNotFound(_) => ErrorKind::ProcessNotFound,
            ExecError::NonZeroExit { .. } => ErrorKind::NonZeroExit,
            ExecError::Io(_) => ErrorKind::Unexpected,
        }
    }
}

/// Failure classification attached to a [`CommandResult`](crate::bulk::CommandResult)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    SecurityRejected,
    PermissionDenied,
    Timeout,
    ProcessNotFound,
    NonZeroExit,
    /// Repository directory does not exist
    MissingDirectory,
    Unexpected,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SecurityRejected => "security_rejected",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ProcessNotFound => "process_not_found",
            ErrorKind::NonZeroExit => "non_zero_exit",
            ErrorKind::MissingDirectory => "missing_directory",
            ErrorKind::Unexpected => "unexpected",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured output of one finished command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOutput {
    /// Command text as executed
    pub command: String,
    /// Exit code (128 + signal when killed by a signal, -1 if unknown)
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    /// Wall time including retries
    pub duration_ms: u64,
    /// Process id of the final attempt
    pub pid: Option<u32>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.return_code == 0
    }

    /// Stdout and stderr joined, for pattern checks on git output
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }
}
