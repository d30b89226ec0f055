//! Git sub-commands executed through the command gateway
//!
//! Anything that mutates a repository (stash, reset) shells out to `git` so it
//! shares the gateway's timeout, concurrency gate and lock-contention retry.

use std::path::Path;

use crate::exec::{CommandGateway, ExecError, ExecRequest, ProcessOutput};

/// One line of `git stash list`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StashEntry {
    /// e.g. `stash@{0}`
    pub stash_ref: String,
    pub index: usize,
    /// e.g. `On main`
    pub branch_info: String,
    pub message: String,
}

/// Parse `git stash list` output
///
/// Lines that do not have the `ref: branch: message` shape are ignored.
pub fn parse_stash_list(output: &str) -> Vec<StashEntry> {
    output
        .lines()
        .filter_map(|line| {
            let mut parts = line.splitn(3, ": ");
            let stash_ref = parts.next()?.trim();
            let branch_info = parts.next()?;
            let message = parts.next()?;
            let index = stash_ref
                .strip_prefix("stash@{")?
                .strip_suffix('}')?
                .parse()
                .ok()?;

            Some(StashEntry {
                stash_ref: stash_ref.to_string(),
                index,
                branch_info: branch_info.to_string(),
                message: message.to_string(),
            })
        })
        .collect()
}

/// Typed git invocations
#[derive(Debug, Clone)]
pub struct GitCommands {
    gateway: CommandGateway,
}

impl GitCommands {
    pub fn new(gateway: CommandGateway) -> Self {
        Self { gateway }
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    async fn git(&self, dir: &Path, args: &[&str]) -> Result<ProcessOutput, ExecError> {
        let argv = std::iter::once("git").chain(args.iter().copied());
        self.gateway
            .execute(ExecRequest::argv(argv).in_dir(dir))
            .await
    }

    /// `git stash push -u -m <message>`, untracked files included
    pub async fn stash_push(&self, dir: &Path, message: &str) -> Result<ProcessOutput, ExecError> {
        self.git(dir, &["stash", "push", "-u", "-m", message]).await
    }

    /// Current stash entries, newest first
    pub async fn stash_list(&self, dir: &Path) -> Result<Vec<StashEntry>, ExecError> {
        let output = self.git(dir, &["stash", "list"]).await?;
        if !output.success() {
            return Err(non_zero(output));
        }
        Ok(parse_stash_list(&output.stdout))
    }

    pub async fn stash_apply(&self, dir: &Path, stash_ref: &str) -> Result<ProcessOutput, ExecError> {
        self.git(dir, &["stash", "apply", stash_ref]).await
    }

    pub async fn stash_drop(&self, dir: &Path, stash_ref: &str) -> Result<ProcessOutput, ExecError> {
        self.git(dir, &["stash", "drop", stash_ref]).await
    }

    /// Move HEAD, index and working tree to `commit`
    pub async fn reset_hard(&self, dir: &Path, commit: &str) -> Result<ProcessOutput, ExecError> {
        self.git(dir, &["reset", "--hard", commit]).await
    }
}

/// Turn a failed output into the matching error
pub(crate) fn non_zero(output: ProcessOutput) -> ExecError {
    ExecError::NonZeroExit {
        command: output.command,
        return_code: output.return_code,
        stdout: output.stdout,
        stderr: output.stderr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::GatewayConfig;
    use crate::testing::{commit_file, git, head_sha, init_repo};
    use std::fs;
    use tempfile::TempDir;

    fn commands() -> GitCommands {
        GitCommands::new(CommandGateway::new(GatewayConfig::default()))
    }

    #[test]
    fn test_parse_stash_list() {
        let output = "stash@{0}: On main: loom-stash-wip\n\
                      stash@{1}: WIP on main: 1a2b3c4 first: with colon\n\
                      garbage line\n";
        let entries = parse_stash_list(output);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].stash_ref, "stash@{0}");
        assert_eq!(entries[0].index, 0);
        assert_eq!(entries[0].branch_info, "On main");
        assert_eq!(entries[0].message, "loom-stash-wip");
        assert_eq!(entries[1].index, 1);
        assert_eq!(entries[1].message, "1a2b3c4 first: with colon");
    }

    #[tokio::test]
    async fn test_stash_push_list_apply_drop() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("README.md"), "edited\n").unwrap();
        fs::write(dir.path().join("new.txt"), "new\n").unwrap();

        let git_cmd = commands();
        let pushed = git_cmd.stash_push(dir.path(), "loom-stash-test").await.unwrap();
        assert!(pushed.success(), "{}", pushed.stderr);
        assert!(!dir.path().join("new.txt").exists());

        let entries = git_cmd.stash_list(dir.path()).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].message, "loom-stash-test");

        let applied = git_cmd.stash_apply(dir.path(), "stash@{0}").await.unwrap();
        assert!(applied.success(), "{}", applied.stderr);
        assert!(dir.path().join("new.txt").exists());

        let dropped = git_cmd.stash_drop(dir.path(), "stash@{0}").await.unwrap();
        assert!(dropped.success());
        assert!(git_cmd.stash_list(dir.path()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reset_hard() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let first = head_sha(dir.path());
        commit_file(dir.path(), "later.txt", "later\n", "later");

        let output = commands().reset_hard(dir.path(), &first).await.unwrap();
        assert!(output.success());
        assert_eq!(head_sha(dir.path()), first);
        assert!(!dir.path().join("later.txt").exists());
        assert!(git(dir.path(), &["status", "--porcelain"]).is_empty());
    }

    #[tokio::test]
    async fn test_stash_list_outside_repo_is_error() {
        let dir = TempDir::new().unwrap();
        let err = commands().stash_list(dir.path()).await.unwrap_err();
        assert!(matches!(err, ExecError::NonZeroExit { .. }));
    }
}
