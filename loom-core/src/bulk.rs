//! Bulk execution: one command across many repositories

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::exec::{CommandGateway, ErrorKind, ExecError, ExecRequest, ProcessOutput};
use crate::fleet::RepositoryHandle;
use crate::pool::fan_out;
use crate::Error;

/// Outcome of running a command in one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub repo_name: String,
    pub repo_path: PathBuf,
    pub command: String,
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// -1 when no exit code was observed
    pub return_code: i32,
    /// Why the command did not produce a normal exit, if it did not
    pub error: Option<ErrorKind>,
    pub duration_ms: u64,
}

impl CommandResult {
    fn from_output(handle: &RepositoryHandle, output: ProcessOutput) -> Self {
        let success = output.success();
        Self {
            repo_name: handle.name().to_string(),
            repo_path: handle.path().to_path_buf(),
            command: output.command,
            success,
            stdout: output.stdout,
            stderr: output.stderr,
            return_code: output.return_code,
            error: (!success).then_some(ErrorKind::NonZeroExit),
            duration_ms: output.duration_ms,
        }
    }

    fn failed(handle: &RepositoryHandle, command: &str, kind: ErrorKind, message: String) -> Self {
        Self {
            repo_name: handle.name().to_string(),
            repo_path: handle.path().to_path_buf(),
            command: command.to_string(),
            success: false,
            stdout: String::new(),
            stderr: message,
            return_code: -1,
            error: Some(kind),
            duration_ms: 0,
        }
    }

    fn from_exec_error(handle: &RepositoryHandle, command: &str, err: ExecError) -> Self {
        Self::failed(handle, command, err.kind(), err.to_string())
    }
}

/// Totals over a bulk run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// `succeeded / total`, 0.0 for an empty run
    pub success_rate: f64,
}

/// Per-repository results plus success/failure partitions
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregatedResults {
    pub results: BTreeMap<String, CommandResult>,
    /// Names that succeeded, sorted
    pub successful: Vec<String>,
    /// Names that failed, sorted
    pub failed: Vec<String>,
    pub summary: ExecSummary,
}

impl AggregatedResults {
    pub fn from_results(results: BTreeMap<String, CommandResult>) -> Self {
        let (successful, failed): (Vec<String>, Vec<String>) = results
            .iter()
            .map(|(name, _)| name.clone())
            .partition(|name| results[name].success);

        let total = results.len();
        let success_rate = if total == 0 {
            0.0
        } else {
            successful.len() as f64 / total as f64
        };

        Self {
            summary: ExecSummary {
                total,
                succeeded: successful.len(),
                failed: failed.len(),
                success_rate,
            },
            results,
            successful,
            failed,
        }
    }
}

/// Runs one shell command in every selected repository
#[derive(Debug, Clone)]
pub struct BulkExecutor {
    gateway: CommandGateway,
}

impl BulkExecutor {
    pub fn new(gateway: CommandGateway) -> Self {
        Self { gateway }
    }

    /// Run `command` with each repository as working directory
    ///
    /// Every repository gets an entry. A missing directory is reported
    /// without touching the gateway; any other failure is folded into that
    /// repository's result.
    pub async fn run(
        &self,
        command: &str,
        handles: &[RepositoryHandle],
        max_workers: usize,
    ) -> BTreeMap<String, CommandResult> {
        debug!(command, repos = handles.len(), max_workers, "Bulk execution");

        let results = fan_out(handles, max_workers, |handle| {
            let gateway = self.gateway.clone();
            let command = command.to_string();
            async move { execute_in_repo(&gateway, &handle, &command).await }
        })
        .await;

        results
            .into_iter()
            .map(|(handle, outcome)| {
                let result = outcome.unwrap_or_else(|e| unexpected(&handle, command, e));
                (handle.name().to_string(), result)
            })
            .collect()
    }

    /// [`run`](Self::run) plus success/failure partitions and a summary
    pub async fn run_with_aggregation(
        &self,
        command: &str,
        handles: &[RepositoryHandle],
        max_workers: usize,
    ) -> AggregatedResults {
        AggregatedResults::from_results(self.run(command, handles, max_workers).await)
    }
}

async fn execute_in_repo(
    gateway: &CommandGateway,
    handle: &RepositoryHandle,
    command: &str,
) -> CommandResult {
    if !handle.exists() {
        return CommandResult::failed(
            handle,
            command,
            ErrorKind::MissingDirectory,
            format!(
                "Repository directory does not exist: {}",
                handle.path().display()
            ),
        );
    }

    match gateway
        .execute(ExecRequest::shell(command).in_dir(handle.path()))
        .await
    {
        Ok(output) => {
            if !output.success() {
                warn!(
                    "Command failed in {} with exit code {}",
                    handle.name(),
                    output.return_code
                );
            }
            CommandResult::from_output(handle, output)
        }
        Err(e) => {
            warn!("Command could not run in {}: {}", handle.name(), e);
            CommandResult::from_exec_error(handle, command, e)
        }
    }
}

fn unexpected(handle: &RepositoryHandle, command: &str, err: Error) -> CommandResult {
    CommandResult::failed(
        handle,
        command,
        ErrorKind::Unexpected,
        format!("Unexpected error: {}", err),
    )
}
