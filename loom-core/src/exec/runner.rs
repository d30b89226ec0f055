//! Process runner: spawns one command in its own process group
//!
//! The [`ProcessRunner`] trait is the seam between the gateway and the
//! operating system. Tests inject a scripted runner; production uses
//! [`SystemProcessRunner`].

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::task::JoinHandle;
use tracing::debug;

use super::{ExecError, Invocation};

/// Fully resolved description of one process to run
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    pub invocation: Invocation,
    pub cwd: Option<PathBuf>,
    /// Variables layered over the inherited environment
    pub env: HashMap<String, String>,
    /// Written to stdin, which is then closed
    pub stdin: Option<String>,
    pub timeout: Duration,
    /// Time between SIGTERM and SIGKILL on timeout
    pub kill_grace: Duration,
}

/// What a finished process produced
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub return_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub pid: Option<u32>,
}

/// Runs a process to completion or timeout
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run the process described by `spec`
    ///
    /// Must return [`ExecError::Timeout`] when `spec.timeout` elapses, after
    /// making sure nothing the command spawned is still running.
    async fn run(&self, spec: &ProcessSpec) -> Result<RawOutput, ExecError>;

    /// Best-effort termination of every tracked process; returns how many were signalled
    fn kill_all(&self) -> usize {
        0
    }

    /// Number of processes currently running
    fn active_count(&self) -> usize {
        0
    }
}

type ActiveSet = Arc<Mutex<HashSet<u32>>>;

fn lock(active: &ActiveSet) -> MutexGuard<'_, HashSet<u32>> {
    active.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Removes a pid from the active set when dropped
struct Tracked {
    active: ActiveSet,
    pid: u32,
}

impl Tracked {
    fn register(active: &ActiveSet, pid: u32) -> Self {
        lock(active).insert(pid);
        Self {
            active: Arc::clone(active),
            pid,
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.pid);
    }
}

/// Runner backed by `tokio::process`
///
/// Every child is the leader of a fresh process group so a timeout can take
/// down everything a shell pipeline started, not just the shell.
#[derive(Debug, Default, Clone)]
pub struct SystemProcessRunner {
    active: ActiveSet,
}

impl SystemProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<RawOutput, ExecError> {
        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(ExecError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("Working directory does not exist: {}", cwd.display()),
                )));
            }
        }

        let mut cmd = spec.invocation.to_command()?;
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ExecError::ProcessNotFound(spec.invocation.program_name())
            } else {
                ExecError::Io(e)
            }
        })?;

        let pid = child.id();
        let _tracked = pid.map(|pid| Tracked::register(&self.active, pid));

        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    debug!("Failed to write process stdin: {}", e);
                }
            });
        }

        let stdout_task = spawn_reader(child.stdout.take());
        let stderr_task = spawn_reader(child.stderr.take());

        // Waiting on the pipes as well as the exit status keeps a background
        // grandchild that holds stdout open inside the timeout.
        let completed = tokio::time::timeout(spec.timeout, async {
            let status = child.wait().await?;
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok::<_, std::io::Error>((status, stdout, stderr))
        })
        .await;

        match completed {
            Ok(Ok((status, stdout, stderr))) => Ok(RawOutput {
                return_code: exit_code(&status),
                stdout,
                stderr,
                pid,
            }),
            Ok(Err(e)) => Err(ExecError::Io(e)),
            Err(_) => {
                terminate(&mut child, pid, spec.kill_grace).await;
                Err(ExecError::Timeout {
                    command: spec.invocation.display(),
                    timeout: spec.timeout,
                })
            }
        }
    }

    fn kill_all(&self) -> usize {
        let pids: Vec<u32> = lock(&self.active).iter().copied().collect();
        pids.into_iter()
            .filter(|pid| signal_group(*pid, GroupSignal::Terminate))
            .count()
    }

    fn active_count(&self) -> usize {
        lock(&self.active).len()
    }
}

fn spawn_reader<R>(pipe: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            if let Err(e) = pipe.read_to_end(&mut buf).await {
                debug!("Failed to read process output: {}", e);
            }
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn exit_code(status: &ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

/// Graceful terminate of the whole group, then a forced kill after `grace`
async fn terminate(child: &mut Child, pid: Option<u32>, grace: Duration) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        signal_group(pid, GroupSignal::Terminate);
        if tokio::time::timeout(grace, child.wait()).await.is_err() {
            debug!(pid, "Process group survived SIGTERM, sending SIGKILL");
        }
        // Sweep anything left in the group even when the leader already exited.
        signal_group(pid, GroupSignal::Kill);
        if let Err(e) = child.wait().await {
            debug!(pid, "Failed to reap timed out process: {}", e);
        }
        return;
    }

    let _ = grace;
    if let Err(e) = child.start_kill() {
        debug!("Failed to kill timed out process: {}", e);
    }
    if let Err(e) = child.wait().await {
        debug!("Failed to reap timed out process: {}", e);
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: GroupSignal) -> bool {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    #[allow(clippy::cast_possible_wrap)]
    let target = Pid::from_raw(pgid as i32);
    killpg(target, signal).is_ok()
}

#[cfg(not(unix))]
fn signal_group(_pgid: u32, _signal: GroupSignal) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tempfile::TempDir;

    fn spec(command: &str, timeout: Duration) -> ProcessSpec {
        ProcessSpec {
            invocation: Invocation::shell(command),
            cwd: None,
            env: HashMap::new(),
            stdin: None,
            timeout,
            kill_grace: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn test_captures_stdout_and_exit_code() {
        let runner = SystemProcessRunner::new();
        let out = runner
            .run(&spec("echo hi; echo oops >&2; exit 3", Duration::from_secs(10)))
            .await
            .unwrap();
        assert_eq!(out.stdout, "hi\n");
        assert_eq!(out.stderr, "oops\n");
        assert_eq!(out.return_code, 3);
        assert!(out.pid.is_some());
        assert_eq!(runner.active_count(), 0);
    }

    #[tokio::test]
    async fn test_env_and_stdin() {
        let runner = SystemProcessRunner::new();
        let mut s = spec("printf '%s-' \"$LOOM_TEST_VAR\"; cat", Duration::from_secs(10));
        s.env.insert("LOOM_TEST_VAR".to_string(), "value".to_string());
        s.stdin = Some("from stdin".to_string());
        let out = runner.run(&s).await.unwrap();
        assert_eq!(out.stdout, "value-from stdin");
    }

    #[tokio::test]
    async fn test_cwd() {
        let dir = TempDir::new().unwrap();
        let runner = SystemProcessRunner::new();
        let mut s = spec("pwd", Duration::from_secs(10));
        s.cwd = Some(dir.path().canonicalize().unwrap());
        let out = runner.run(&s).await.unwrap();
        assert_eq!(
            PathBuf::from(out.stdout.trim()),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn test_missing_program() {
        let runner = SystemProcessRunner::new();
        let mut s = spec("", Duration::from_secs(5));
        s.invocation = Invocation::argv(["/nonexistent/loom-test-binary-12345"]);
        let err = runner.run(&s).await.unwrap_err();
        assert!(matches!(err, ExecError::ProcessNotFound(_)));
    }

    #[tokio::test]
    async fn test_missing_cwd() {
        let runner = SystemProcessRunner::new();
        let mut s = spec("true", Duration::from_secs(5));
        s.cwd = Some(PathBuf::from("/nonexistent/loom/dir"));
        assert!(matches!(runner.run(&s).await, Err(ExecError::Io(_))));
    }

    /// A pid counts as running unless it is gone or only a zombie is left
    #[cfg(target_os = "linux")]
    fn is_running(pid: i32) -> bool {
        let Ok(stat) = std::fs::read_to_string(format!("/proc/{}/stat", pid)) else {
            return false;
        };
        let state = stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next());
        !matches!(state, None | Some('Z') | Some('X'))
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_timeout_kills_process_group() {
        let dir = TempDir::new().unwrap();
        let pid_file = dir.path().join("background.pid");
        let command = format!("sleep 10 & echo $! > {}; sleep 10", pid_file.display());

        let runner = SystemProcessRunner::new();
        let started = Instant::now();
        let err = runner
            .run(&spec(&command, Duration::from_millis(300)))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(3));
        assert_eq!(runner.active_count(), 0);

        // The background sleep belonged to the same group and must be gone.
        let pid: i32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        let mut alive = true;
        for _ in 0..50 {
            if !is_running(pid) {
                alive = false;
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!alive, "background process {} survived the timeout", pid);
    }

    #[tokio::test]
    async fn test_kill_all_signals_running_processes() {
        let runner = Arc::new(SystemProcessRunner::new());
        let background = Arc::clone(&runner);
        let handle = tokio::spawn(async move {
            background
                .run(&spec("sleep 10", Duration::from_secs(30)))
                .await
        });

        for _ in 0..100 {
            if runner.active_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(runner.active_count(), 1);
        assert_eq!(runner.kill_all(), 1);

        let out = handle.await.unwrap().unwrap();
        assert_eq!(out.return_code, 128 + 15);
        assert_eq!(runner.active_count(), 0);
    }
}
