//! Git repository inspection via libgit2

use std::path::{Path, PathBuf};

use git2::{BranchType, Repository, Status, StatusOptions};

use crate::{Error, Result};

/// Information about a git remote
#[derive(Debug, Clone)]
pub struct RemoteInfo {
    /// Name of the remote (e.g., "origin")
    pub name: String,
    /// URL of the remote
    pub url: String,
}

/// Upstream tracking information for the checked-out branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamInfo {
    /// Short name, e.g. `origin/main`
    pub name: String,
    /// Commits on the local branch not on the upstream
    pub ahead: usize,
    /// Commits on the upstream not on the local branch
    pub behind: usize,
}

/// Working tree changes bucketed the way `git status` shows them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingTreeStatus {
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
}

impl WorkingTreeStatus {
    /// Tracked files differ from HEAD (in the index or the working tree)
    pub fn has_tracked_changes(&self) -> bool {
        !self.staged.is_empty() || !self.unstaged.is_empty()
    }

    pub fn is_clean(&self) -> bool {
        !self.has_tracked_changes() && self.untracked.is_empty()
    }
}

/// A git repository wrapper providing the reads Loom needs
pub struct GitRepo {
    /// The underlying git2 repository
    repo: Repository,
    /// Path to the repository root
    root: PathBuf,
}

impl std::fmt::Debug for GitRepo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitRepo")
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl GitRepo {
    /// Open the git repository rooted exactly at `path`
    ///
    /// Unlike discovery, a directory nested inside some other repository is
    /// not accepted.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let repo = Repository::open(path).map_err(|e| {
            if e.code() == git2::ErrorCode::NotFound {
                Error::Config(format!("Not a git repository: {}", path.display()))
            } else {
                Error::Git(e.message().to_string())
            }
        })?;

        let root = repo
            .workdir()
            .ok_or_else(|| Error::Config("Bare repositories are not supported".to_string()))?
            .to_path_buf();

        Ok(Self { repo, root })
    }

    /// Get the repository root path
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check if `path` is the root of a git repository
    pub fn is_git_repo(path: impl AsRef<Path>) -> bool {
        Repository::open(path.as_ref()).is_ok()
    }

    /// Full SHA of HEAD, `None` on an unborn branch
    pub fn head_sha(&self) -> Result<Option<String>> {
        match self.repo.head() {
            Ok(head) => Ok(head.target().map(|oid| oid.to_string())),
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get the current branch name
    ///
    /// Returns `None` when HEAD is detached. On an unborn branch the name
    /// HEAD points at is returned.
    pub fn current_branch(&self) -> Result<Option<String>> {
        let head = match self.repo.head() {
            Ok(h) => h,
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => {
                let head = self.repo.find_reference("HEAD")?;
                return Ok(head
                    .symbolic_target()
                    .and_then(|t| t.strip_prefix("refs/heads/"))
                    .map(str::to_string));
            }
            Err(e) => return Err(e.into()),
        };

        if head.is_branch() {
            Ok(head.shorthand().map(|s| s.to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn is_detached(&self) -> Result<bool> {
        Ok(self.repo.head_detached()?)
    }

    /// Bucket every changed path into staged, unstaged and untracked
    pub fn working_tree_status(&self) -> Result<WorkingTreeStatus> {
        let mut options = StatusOptions::new();
        options
            .include_untracked(true)
            .recurse_untracked_dirs(true)
            .include_ignored(false);

        let statuses = self.repo.statuses(Some(&mut options))?;
        let mut result = WorkingTreeStatus::default();

        let staged_mask = Status::INDEX_NEW
            | Status::INDEX_MODIFIED
            | Status::INDEX_DELETED
            | Status::INDEX_RENAMED
            | Status::INDEX_TYPECHANGE;
        let unstaged_mask = Status::WT_MODIFIED
            | Status::WT_DELETED
            | Status::WT_RENAMED
            | Status::WT_TYPECHANGE
            | Status::CONFLICTED;

        for entry in statuses.iter() {
            let Some(path) = entry.path() else {
                continue;
            };
            let status = entry.status();

            if status.contains(Status::WT_NEW) {
                result.untracked.push(path.to_string());
                continue;
            }
            if status.intersects(staged_mask) {
                result.staged.push(path.to_string());
            }
            if status.intersects(unstaged_mask) {
                result.unstaged.push(path.to_string());
            }
        }

        Ok(result)
    }

    /// Upstream of the checked-out branch with ahead/behind counts
    pub fn upstream(&self) -> Result<Option<UpstreamInfo>> {
        let Some(branch_name) = self.current_branch()? else {
            return Ok(None);
        };
        let branch = match self.repo.find_branch(&branch_name, BranchType::Local) {
            Ok(b) => b,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let upstream = match branch.upstream() {
            Ok(u) => u,
            Err(e) if e.code() == git2::ErrorCode::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let name = upstream.name()?.unwrap_or_default().to_string();
        let (ahead, behind) = match (branch.get().target(), upstream.get().target()) {
            (Some(local), Some(remote)) => self.repo.graph_ahead_behind(local, remote)?,
            _ => (0, 0),
        };

        Ok(Some(UpstreamInfo {
            name,
            ahead,
            behind,
        }))
    }

    /// Get the default remote (usually "origin")
    pub fn default_remote(&self) -> Result<Option<RemoteInfo>> {
        if let Ok(remote) = self.repo.find_remote("origin") {
            if let Some(url) = remote.url() {
                return Ok(Some(RemoteInfo {
                    name: "origin".to_string(),
                    url: url.to_string(),
                }));
            }
        }

        let remotes = self.repo.remotes()?;
        for remote_name in remotes.iter().flatten() {
            if let Ok(remote) = self.repo.find_remote(remote_name) {
                if let Some(url) = remote.url() {
                    return Ok(Some(RemoteInfo {
                        name: remote_name.to_string(),
                        url: url.to_string(),
                    }));
                }
            }
        }

        Ok(None)
    }

    /// Subject and body of the HEAD commit, trimmed
    pub fn last_commit_message(&self) -> Result<Option<String>> {
        let head = match self.repo.head() {
            Ok(h) => h,
            Err(e) if e.code() == git2::ErrorCode::UnbornBranch => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let commit = head.peel_to_commit()?;
        Ok(commit.message().map(|m| m.trim().to_string()))
    }

    /// Get access to the underlying git2 repository
    pub fn inner(&self) -> &Repository {
        &self.repo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{commit_file, git, head_sha, init_repo};
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_open_non_git_dir() {
        let dir = TempDir::new().unwrap();
        assert!(!GitRepo::is_git_repo(dir.path()));
        assert!(GitRepo::open(dir.path()).is_err());
    }

    #[test]
    fn test_nested_directory_is_not_a_repo() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let nested = dir.path().join("sub");
        fs::create_dir(&nested).unwrap();
        assert!(!GitRepo::is_git_repo(&nested));
    }

    #[test]
    fn test_head_and_branch() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).unwrap();

        assert_eq!(repo.head_sha().unwrap(), Some(head_sha(dir.path())));
        assert_eq!(repo.current_branch().unwrap(), Some("main".to_string()));
        assert!(!repo.is_detached().unwrap());
        assert_eq!(
            repo.last_commit_message().unwrap(),
            Some("initial commit".to_string())
        );
    }

    #[test]
    fn test_detached_head() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let sha = head_sha(dir.path());
        git(dir.path(), &["checkout", "-q", &sha]);

        let repo = GitRepo::open(dir.path()).unwrap();
        assert_eq!(repo.current_branch().unwrap(), None);
        assert!(repo.is_detached().unwrap());
    }

    #[test]
    fn test_working_tree_buckets() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        commit_file(dir.path(), "b.txt", "b\n", "add b");

        fs::write(dir.path().join("README.md"), "changed\n").unwrap();
        fs::write(dir.path().join("b.txt"), "staged\n").unwrap();
        git(dir.path(), &["add", "b.txt"]);
        fs::write(dir.path().join("new.txt"), "new\n").unwrap();

        let repo = GitRepo::open(dir.path()).unwrap();
        let status = repo.working_tree_status().unwrap();
        assert_eq!(status.staged, vec!["b.txt".to_string()]);
        assert_eq!(status.unstaged, vec!["README.md".to_string()]);
        assert_eq!(status.untracked, vec!["new.txt".to_string()]);
        assert!(status.has_tracked_changes());
        assert!(!status.is_clean());
    }

    #[test]
    fn test_upstream_ahead_behind() {
        let origin = TempDir::new().unwrap();
        init_repo(origin.path());
        let clone_root = TempDir::new().unwrap();
        let clone = clone_root.path().join("clone");
        git(
            clone_root.path(),
            &["clone", "-q", origin.path().to_str().unwrap(), "clone"],
        );
        git(&clone, &["config", "user.name", "Loom Test"]);
        git(&clone, &["config", "user.email", "loom@example.com"]);

        commit_file(origin.path(), "upstream.txt", "u\n", "upstream change");
        git(&clone, &["fetch", "-q"]);
        commit_file(&clone, "local1.txt", "1\n", "local one");
        commit_file(&clone, "local2.txt", "2\n", "local two");

        let repo = GitRepo::open(&clone).unwrap();
        let upstream = repo.upstream().unwrap().unwrap();
        assert_eq!(upstream.name, "origin/main");
        assert_eq!(upstream.ahead, 2);
        assert_eq!(upstream.behind, 1);

        let remote = repo.default_remote().unwrap().unwrap();
        assert_eq!(remote.name, "origin");
    }

    #[test]
    fn test_no_upstream() {
        let dir = TempDir::new().unwrap();
        init_repo(dir.path());
        let repo = GitRepo::open(dir.path()).unwrap();
        assert_eq!(repo.upstream().unwrap(), None);
        assert!(repo.default_remote().unwrap().is_none());
    }
}
