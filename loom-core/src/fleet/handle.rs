//! A single managed repository

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::git::{GitRepo, GitStateReader, RepoState};
use crate::{Error, Result};

/// A named repository in the fleet
///
/// Only the name and path are stored. Branch, head commit and dirty state are
/// read fresh on every call to [`RepositoryHandle::state`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepositoryHandle {
    name: String,
    path: PathBuf,
}

impl RepositoryHandle {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The repository directory exists
    pub fn exists(&self) -> bool {
        self.path.is_dir()
    }

    /// Fail with [`Error::InvalidRepository`] unless the path is a git repository
    pub fn validate(&self) -> Result<()> {
        if !self.exists() {
            return Err(self.invalid("directory does not exist"));
        }
        GitRepo::open(&self.path)
            .map(|_| ())
            .map_err(|e| self.invalid(&e.to_string()))
    }

    /// Read the live git state on the blocking pool
    pub async fn state(&self, reader: Arc<dyn GitStateReader>) -> Result<RepoState> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || reader.read_state(&path)).await?
    }

    pub(crate) fn invalid(&self, reason: &str) -> Error {
        Error::InvalidRepository {
            name: self.name.clone(),
            path: self.path.clone(),
            reason: reason.to_string(),
        }
    }
}
