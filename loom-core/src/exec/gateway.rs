//! Command execution gateway
//!
//! Every subprocess Loom starts, git or otherwise, goes through
//! [`CommandGateway::execute`]. The gateway validates the command, confines
//! its working directory, bounds global concurrency with a semaphore, applies
//! the timeout and retries transient git lock failures.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use super::runner::{ProcessRunner, ProcessSpec, RawOutput, SystemProcessRunner};
use super::validate::{CommandPolicy, PathConfinement, ShellMode};
use super::{ExecError, Invocation, ProcessOutput};

/// Stderr fragments that mean another git process holds a lock
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "index.lock",
    "unable to create",
    "cannot lock ref",
    "another git process",
    "resource temporarily unavailable",
];

/// Whether a failed command should be retried
pub fn is_transient_failure(stderr: &str) -> bool {
    let stderr = stderr.to_lowercase();
    TRANSIENT_PATTERNS.iter().any(|p| stderr.contains(p))
}

/// Retry behaviour for transient failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }

    /// Single attempt
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1))
    }
}

/// Gateway configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub mode: ShellMode,
    /// Ceiling on subprocesses running at once across all callers
    pub max_concurrent: usize,
    pub default_timeout: Duration,
    pub kill_grace: Duration,
    /// Roots commands may run under; empty means unrestricted
    pub allowed_paths: Vec<PathBuf>,
    pub allowed_commands: Vec<String>,
    pub blocked_commands: Vec<String>,
    pub retry: RetryPolicy,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            mode: ShellMode::default(),
            max_concurrent: 10,
            default_timeout: Duration::from_secs(30),
            kill_grace: Duration::from_secs(2),
            allowed_paths: Vec::new(),
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
            retry: RetryPolicy::default(),
        }
    }
}

/// One command to execute
#[derive(Debug, Clone)]
pub struct ExecRequest {
    invocation: Invocation,
    cwd: Option<PathBuf>,
    env: HashMap<String, String>,
    stdin: Option<String>,
    timeout: Option<Duration>,
    retry: Option<RetryPolicy>,
    validate: bool,
    raise_on_failure: bool,
}

impl ExecRequest {
    pub fn new(invocation: Invocation) -> Self {
        Self {
            invocation,
            cwd: None,
            env: HashMap::new(),
            stdin: None,
            timeout: None,
            retry: None,
            validate: true,
            raise_on_failure: false,
        }
    }

    /// Command line run through `sh -c`
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new(Invocation::shell(command))
    }

    /// Program and arguments run without a shell
    pub fn argv<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(Invocation::argv(args))
    }

    pub fn in_dir(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Skip allow/deny-list and metacharacter checks
    pub fn skip_validation(mut self) -> Self {
        self.validate = false;
        self
    }

    /// Return [`ExecError::NonZeroExit`] instead of a failed output
    pub fn raise_on_failure(mut self) -> Self {
        self.raise_on_failure = true;
        self
    }

    pub fn invocation(&self) -> &Invocation {
        &self.invocation
    }
}

/// Secure, bounded, retrying subprocess execution
#[derive(Clone)]
pub struct CommandGateway {
    config: GatewayConfig,
    policy: CommandPolicy,
    confinement: PathConfinement,
    runner: Arc<dyn ProcessRunner>,
    gate: Arc<Semaphore>,
}

impl std::fmt::Debug for CommandGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandGateway")
            .field("config", &self.config)
            .field("available_permits", &self.gate.available_permits())
            .finish_non_exhaustive()
    }
}

impl CommandGateway {
    /// Gateway backed by real processes
    pub fn new(config: GatewayConfig) -> Self {
        Self::with_runner(config, Arc::new(SystemProcessRunner::new()))
    }

    /// Gateway with a custom process runner
    pub fn with_runner(config: GatewayConfig, runner: Arc<dyn ProcessRunner>) -> Self {
        let policy = CommandPolicy::new(
            config.mode,
            &config.allowed_commands,
            &config.blocked_commands,
        );
        let confinement = PathConfinement::new(&config.allowed_paths);
        let gate = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        Self {
            config,
            policy,
            confinement,
            runner,
            gate,
        }
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    /// Execute one command
    ///
    /// Validation and confinement failures are returned before anything is
    /// spawned. A non-zero exit is an `Ok` output unless the request opted
    /// into [`ExecRequest::raise_on_failure`].
    pub async fn execute(&self, request: ExecRequest) -> Result<ProcessOutput, ExecError> {
        let spec = self.prepare(&request)?;
        let command = request.invocation.display();
        let retry = request
            .retry
            .clone()
            .unwrap_or_else(|| self.config.retry.clone());
        let attempts = retry.max_attempts.max(1);
        let started = Instant::now();

        let mut attempt = 1;
        let raw = loop {
            let raw = self.run_gated(&spec, &command, attempt).await?;

            if raw.return_code != 0 && attempt < attempts && is_transient_failure(&raw.stderr) {
                warn!(
                    command = %command,
                    attempt,
                    max_attempts = attempts,
                    "Transient git failure, retrying: {}",
                    raw.stderr.trim()
                );
                tokio::time::sleep(retry.delay).await;
                attempt += 1;
                continue;
            }
            break raw;
        };

        let output = ProcessOutput {
            command,
            return_code: raw.return_code,
            stdout: raw.stdout,
            stderr: raw.stderr,
            duration_ms: started.elapsed().as_millis() as u64,
            pid: raw.pid,
        };

        if !output.success() && request.raise_on_failure {
            return Err(ExecError::NonZeroExit {
                command: output.command,
                return_code: output.return_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }

        Ok(output)
    }

    /// Execute several commands concurrently
    ///
    /// All requests are validated up front; one rejection fails the whole
    /// call without spawning anything. Results keep the input order.
    pub async fn execute_many(
        &self,
        requests: Vec<ExecRequest>,
    ) -> Result<Vec<Result<ProcessOutput, ExecError>>, ExecError> {
        for request in &requests {
            self.prepare(request)?;
        }

        let mut set = JoinSet::new();
        let count = requests.len();
        for (index, request) in requests.into_iter().enumerate() {
            let gateway = self.clone();
            set.spawn(async move { (index, gateway.execute(request).await) });
        }

        let mut results: Vec<Option<Result<ProcessOutput, ExecError>>> =
            (0..count).map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((index, result)) => results[index] = Some(result),
                Err(e) => warn!("Command task failed: {}", e),
            }
        }

        Ok(results
            .into_iter()
            .map(|r| {
                r.unwrap_or_else(|| {
                    Err(ExecError::Io(std::io::Error::other("command task did not complete")))
                })
            })
            .collect())
    }

    /// Run commands in sequence, feeding each stdout into the next stdin
    ///
    /// Stops at the first failing step; the returned output names that step.
    pub async fn execute_pipeline(
        &self,
        steps: Vec<ExecRequest>,
    ) -> Result<ProcessOutput, ExecError> {
        if steps.is_empty() {
            return Err(ExecError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "No commands provided for pipeline",
            )));
        }
        for step in &steps {
            self.prepare(step)?;
        }

        let command = steps
            .iter()
            .map(|s| s.invocation.display())
            .collect::<Vec<_>>()
            .join(" | ");
        let started = Instant::now();
        let mut input: Option<String> = None;
        let mut last_pid = None;

        for (index, mut step) in steps.into_iter().enumerate() {
            if let Some(previous) = input.take() {
                step.stdin = Some(previous);
            }
            step.raise_on_failure = false;

            let output = self.execute(step).await?;
            if !output.success() {
                return Ok(ProcessOutput {
                    command,
                    return_code: output.return_code,
                    stdout: output.stdout,
                    stderr: format!("Pipeline failed at step {}: {}", index + 1, output.stderr),
                    duration_ms: started.elapsed().as_millis() as u64,
                    pid: output.pid,
                });
            }
            last_pid = output.pid;
            input = Some(output.stdout);
        }

        Ok(ProcessOutput {
            command,
            return_code: 0,
            stdout: input.unwrap_or_default(),
            stderr: String::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            pid: last_pid,
        })
    }

    /// Best-effort terminate every process currently running through this gateway
    pub fn kill_all(&self) -> usize {
        let killed = self.runner.kill_all();
        if killed > 0 {
            warn!(killed, "Terminated running processes");
        }
        killed
    }

    /// Number of processes currently running
    pub fn active_count(&self) -> usize {
        self.runner.active_count()
    }

    fn prepare(&self, request: &ExecRequest) -> Result<ProcessSpec, ExecError> {
        if request.validate {
            self.policy.check(&request.invocation)?;
        }
        let cwd = match &request.cwd {
            Some(cwd) => Some(self.confinement.check(cwd)?),
            None => None,
        };

        Ok(ProcessSpec {
            invocation: request.invocation.clone(),
            cwd,
            env: request.env.clone(),
            stdin: request.stdin.clone(),
            timeout: request.timeout.unwrap_or(self.config.default_timeout),
            kill_grace: self.config.kill_grace,
        })
    }

    async fn run_gated(
        &self,
        spec: &ProcessSpec,
        command: &str,
        attempt: u32,
    ) -> Result<RawOutput, ExecError> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ExecError::Io(std::io::Error::other("execution gate closed")))?;

        debug!(command = %command, attempt, cwd = ?spec.cwd, "Executing command");
        self.runner.run(spec).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedRunner;
    use tempfile::TempDir;

    fn gateway_with(runner: Arc<ScriptedRunner>, config: GatewayConfig) -> CommandGateway {
        CommandGateway::with_runner(config, runner)
    }

    fn fast_retry() -> GatewayConfig {
        GatewayConfig {
            retry: RetryPolicy::new(3, Duration::from_millis(1)),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn test_transient_patterns() {
        assert!(is_transient_failure(
            "fatal: Unable to create '/repo/.git/index.lock': File exists."
        ));
        assert!(is_transient_failure("error: cannot lock ref 'refs/heads/main'"));
        assert!(!is_transient_failure("error: pathspec 'nope' did not match"));
    }

    #[tokio::test]
    async fn test_deny_listed_command_never_spawns() {
        let runner = Arc::new(ScriptedRunner::new());
        let gateway = gateway_with(Arc::clone(&runner), GatewayConfig::default());

        let err = gateway
            .execute(ExecRequest::shell("rm -rf /tmp/loom-test"))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SecurityRejected(_)));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_chained_commands_never_spawn() {
        let runner = Arc::new(ScriptedRunner::new());
        let config = GatewayConfig {
            mode: ShellMode::Safe,
            ..GatewayConfig::default()
        };
        let gateway = gateway_with(Arc::clone(&runner), config);

        for command in ["echo hi\nrm -rf /tmp/loom-test", "sleep 1 & rm -rf /tmp/loom-test"] {
            let err = gateway.execute(ExecRequest::shell(command)).await.unwrap_err();
            assert!(
                matches!(err, ExecError::SecurityRejected(_)),
                "{:?} gave {:?}",
                command,
                err
            );
        }
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_cwd_outside_allowed_paths_never_spawns() {
        let allowed = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        let config = GatewayConfig {
            allowed_paths: vec![allowed.path().to_path_buf()],
            ..GatewayConfig::default()
        };
        let gateway = gateway_with(Arc::clone(&runner), config);

        let err = gateway
            .execute(ExecRequest::shell("ls").in_dir(outside.path()))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::PermissionDenied(_)));
        assert_eq!(runner.calls(), 0);

        gateway
            .execute(ExecRequest::shell("ls").in_dir(allowed.path()))
            .await
            .unwrap();
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_retries_lock_contention() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(128, "fatal: Unable to create '.git/index.lock': File exists.");
        runner.push_failure(128, "fatal: Unable to create '.git/index.lock': File exists.");
        runner.push_success("ok\n");
        let gateway = gateway_with(Arc::clone(&runner), fast_retry());

        let output = gateway
            .execute(ExecRequest::argv(["git", "stash", "list"]))
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "ok\n");
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_max_attempts() {
        let runner = Arc::new(ScriptedRunner::new());
        for _ in 0..5 {
            runner.push_failure(128, "another git process seems to be running");
        }
        let gateway = gateway_with(Arc::clone(&runner), fast_retry());

        let output = gateway
            .execute(ExecRequest::argv(["git", "status"]))
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(runner.calls(), 3);
    }

    #[tokio::test]
    async fn test_other_failures_not_retried_or_raised() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(1, "error: pathspec did not match");
        let gateway = gateway_with(Arc::clone(&runner), fast_retry());

        let output = gateway
            .execute(ExecRequest::argv(["git", "checkout", "nope"]))
            .await
            .unwrap();
        assert_eq!(output.return_code, 1);
        assert_eq!(runner.calls(), 1);
    }

    #[tokio::test]
    async fn test_raise_on_failure() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_failure(2, "boom");
        let gateway = gateway_with(Arc::clone(&runner), fast_retry());

        let err = gateway
            .execute(ExecRequest::shell("false").raise_on_failure())
            .await
            .unwrap_err();
        match err {
            ExecError::NonZeroExit {
                return_code,
                stderr,
                ..
            } => {
                assert_eq!(return_code, 2);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_timeout_reaches_runner() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.push_success("");
        let gateway = gateway_with(Arc::clone(&runner), GatewayConfig::default());

        gateway
            .execute(ExecRequest::shell("true").timeout(Duration::from_millis(250)))
            .await
            .unwrap();
        let spec = runner.last_spec().unwrap();
        assert_eq!(spec.timeout, Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_real_timeout_is_reported_quickly() {
        let config = GatewayConfig {
            kill_grace: Duration::from_millis(200),
            ..GatewayConfig::default()
        };
        let gateway = CommandGateway::new(config);
        let started = Instant::now();

        let err = gateway
            .execute(ExecRequest::shell("sleep 10").timeout(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(gateway.active_count(), 0);
    }

    #[tokio::test]
    async fn test_execute_many_validates_everything_first() {
        let runner = Arc::new(ScriptedRunner::new());
        let gateway = gateway_with(Arc::clone(&runner), GatewayConfig::default());

        let err = gateway
            .execute_many(vec![
                ExecRequest::shell("echo one"),
                ExecRequest::shell("sudo echo two"),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::SecurityRejected(_)));
        assert_eq!(runner.calls(), 0);
    }

    #[tokio::test]
    async fn test_execute_many_keeps_order() {
        let gateway = CommandGateway::new(GatewayConfig::default());
        let results = gateway
            .execute_many(vec![
                ExecRequest::shell("sleep 0.2"),
                ExecRequest::shell("echo second"),
                ExecRequest::shell("false"),
            ])
            .await
            .unwrap();
        assert_eq!(results.len(), 3);
        assert!(results[0].as_ref().unwrap().success());
        assert_eq!(results[1].as_ref().unwrap().stdout, "second\n");
        assert_eq!(results[2].as_ref().unwrap().return_code, 1);
    }

    #[tokio::test]
    async fn test_pipeline_feeds_stdout_forward() {
        let gateway = CommandGateway::new(GatewayConfig::default());
        let output = gateway
            .execute_pipeline(vec![
                ExecRequest::shell("printf 'b\\na\\nc\\n'"),
                ExecRequest::shell("sort"),
                ExecRequest::shell("head -n 1"),
            ])
            .await
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "a\n");
        assert!(output.command.contains(" | sort | "));
    }

    #[tokio::test]
    async fn test_pipeline_reports_failing_step() {
        let gateway = CommandGateway::new(GatewayConfig::default());
        let output = gateway
            .execute_pipeline(vec![ExecRequest::shell("echo hi"), ExecRequest::shell("false")])
            .await
            .unwrap();
        assert!(!output.success());
        assert!(output.stderr.starts_with("Pipeline failed at step 2"));
    }

    #[tokio::test]
    async fn test_concurrency_gate_bounds_running_processes() {
        let runner = Arc::new(ScriptedRunner::new().with_delay(Duration::from_millis(50)));
        for _ in 0..6 {
            runner.push_success("");
        }
        let config = GatewayConfig {
            max_concurrent: 2,
            ..GatewayConfig::default()
        };
        let gateway = gateway_with(Arc::clone(&runner), config);

        let requests = (0..6).map(|_| ExecRequest::shell("true")).collect();
        let results = gateway.execute_many(requests).await.unwrap();
        assert!(results.iter().all(|r| r.is_ok()));
        assert_eq!(runner.calls(), 6);
        assert!(runner.max_in_flight() <= 2);
    }
}
