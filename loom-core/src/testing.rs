//! Shared test helpers

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;

use crate::exec::{ExecError, ProcessRunner, ProcessSpec, RawOutput};

/// Runner that replays queued outputs instead of spawning processes
#[derive(Default)]
pub struct ScriptedRunner {
    script: Mutex<VecDeque<RawOutput>>,
    specs: Mutex<Vec<ProcessSpec>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Duration,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn push_success(&self, stdout: &str) {
        self.push(0, stdout, "");
    }

    pub fn push_failure(&self, return_code: i32, stderr: &str) {
        self.push(return_code, "", stderr);
    }

    fn push(&self, return_code: i32, stdout: &str, stderr: &str) {
        self.script.lock().unwrap().push_back(RawOutput {
            return_code,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            pid: Some(4242),
        });
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn last_spec(&self) -> Option<ProcessSpec> {
        self.specs.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl ProcessRunner for ScriptedRunner {
    async fn run(&self, spec: &ProcessSpec) -> Result<RawOutput, ExecError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.specs.lock().unwrap().push(spec.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let next = self.script.lock().unwrap().pop_front();
        Ok(next.unwrap_or(RawOutput {
            return_code: 0,
            stdout: String::new(),
            stderr: String::new(),
            pid: Some(4242),
        }))
    }
}

/// Run git in `dir`, panicking on failure
pub fn git(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "Loom Test")
        .env("GIT_AUTHOR_EMAIL", "loom@example.com")
        .env("GIT_COMMITTER_NAME", "Loom Test")
        .env("GIT_COMMITTER_EMAIL", "loom@example.com")
        .output()
        .expect("failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8_lossy(&output.stdout).into_owned()
}

/// Initialise a repository on branch `main` with one commit of `README.md`
pub fn init_repo(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    git(dir, &["init", "-q"]);
    git(dir, &["symbolic-ref", "HEAD", "refs/heads/main"]);
    git(dir, &["config", "user.name", "Loom Test"]);
    git(dir, &["config", "user.email", "loom@example.com"]);
    git(dir, &["config", "commit.gpgsign", "false"]);
    commit_file(dir, "README.md", "hello\n", "initial commit");
}

/// Write a file, commit it and return the new HEAD sha
pub fn commit_file(dir: &Path, name: &str, contents: &str, message: &str) -> String {
    fs::write(dir.join(name), contents).unwrap();
    git(dir, &["add", name]);
    git(dir, &["commit", "-q", "-m", message]);
    head_sha(dir)
}

pub fn head_sha(dir: &Path) -> String {
    git(dir, &["rev-parse", "HEAD"]).trim().to_string()
}
