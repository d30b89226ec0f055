//! Live repository state reads

use std::path::Path;

use serde::{Deserialize, Serialize};

use super::repo::GitRepo;
use crate::Result;

/// Everything Loom reads from a repository at one instant
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoState {
    /// Checked-out branch, `None` when detached
    pub branch: Option<String>,
    pub head_sha: Option<String>,
    pub upstream: Option<String>,
    pub remote: Option<String>,
    pub ahead: usize,
    pub behind: usize,
    pub last_commit_message: Option<String>,
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

impl RepoState {
    /// Tracked files differ from HEAD
    pub fn is_dirty(&self) -> bool {
        !self.staged.is_empty() || !self.unstaged.is_empty()
    }

    pub fn has_untracked(&self) -> bool {
        !self.untracked.is_empty()
    }

    /// No tracked changes and no untracked files
    pub fn is_clean(&self) -> bool {
        !self.is_dirty() && !self.has_untracked()
    }
}

/// Reads the live git state of a repository
///
/// Implementations are synchronous; callers run them on the blocking pool.
pub trait GitStateReader: Send + Sync {
    fn read_state(&self, path: &Path) -> Result<RepoState>;
}

/// [`GitStateReader`] backed by libgit2
#[derive(Debug, Clone, Copy, Default)]
pub struct Git2StateReader;

impl GitStateReader for Git2StateReader {
    fn read_state(&self, path: &Path) -> Result<RepoState> {
        let repo = GitRepo::open(path)?;
        let tree = repo.working_tree_status()?;
        let upstream = repo.upstream()?;

        Ok(RepoState {
            branch: repo.current_branch()?,
            head_sha: repo.head_sha()?,
            remote: repo.default_remote()?.map(|r| r.name),
            ahead: upstream.as_ref().map_or(0, |u| u.ahead),
            behind: upstream.as_ref().map_or(0, |u| u.behind),
            upstream: upstream.map(|u| u.name),
            last_commit_message: repo.last_commit_message()?,
            staged: tree.staged,
            unstaged: tree.unstaged,
            untracked: tree.untracked,
        })
    }
}

/// The last commit as shown in a status summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LastCommit {
    pub sha: String,
    pub message: String,
}

/// Serialisable per-repository status used by the fleet summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStatus {
    pub branch: Option<String>,
    pub upstream: Option<String>,
    pub remote: Option<String>,
    pub clean: bool,
    pub ahead: usize,
    pub behind: usize,
    pub last_commit: Option<LastCommit>,
    pub staged: Vec<String>,
    pub modified: Vec<String>,
    pub untracked: Vec<String>,
    pub staged_count: usize,
    pub modified_count: usize,
    pub untracked_count: usize,
}

impl From<RepoState> for RepoStatus {
    fn from(state: RepoState) -> Self {
        let clean = state.is_clean();
        let last_commit = state.head_sha.map(|sha| LastCommit {
            sha,
            message: state.last_commit_message.unwrap_or_default(),
        });

        Self {
            branch: state.branch,
            upstream: state.upstream,
            remote: state.remote,
            clean,
            ahead: state.ahead,
            behind: state.behind,
            last_commit,
            staged_count: state.staged.len(),
            modified_count: state.unstaged.len(),
            untracked_count: state.untracked.len(),
            staged: state.staged,
            modified: state.unstaged,
            untracked: state.untracked,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{head_sha, init_repo};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_git2_reader() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        fs::write(dir.path().join("scratch.txt"), "x").unwrap();

        let state = Git2StateReader.read_state(dir.path()).unwrap();
        assert_eq!(state.branch.as_deref(), Some("main"));
        assert_eq!(state.head_sha, Some(head_sha(dir.path())));
        assert!(!state.is_dirty());
        assert!(state.has_untracked());
        assert!(!state.is_clean());
    }

    #[test]
    fn test_reader_rejects_plain_directory() {
        let dir = TempDir::new().unwrap();
        assert!(Git2StateReader.read_state(dir.path()).is_err());
    }

    #[test]
    fn test_status_view_counts() {
        let state = RepoState {
            branch: Some("main".to_string()),
            head_sha: Some("abc123".to_string()),
            last_commit_message: Some("fix".to_string()),
            unstaged: vec!["a.rs".to_string(), "b.rs".to_string()],
            ..RepoState::default()
        };
        let status = RepoStatus::from(state);
        assert!(!status.clean);
        assert_eq!(status.modified_count, 2);
        assert_eq!(status.staged_count, 0);
        assert_eq!(status.last_commit.unwrap().message, "fix");
    }
}
