//! The fleet: every configured repository, keyed by unique name

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use super::RepositoryHandle;
use crate::config::FleetConfig;
use crate::git::{GitStateReader, RepoStatus};
use crate::pool::fan_out;
use crate::{Error, Result};

/// Pattern selecting every repository
pub const ALL_PATTERN: &str = "*";

/// Ordered set of repositories with unique names
#[derive(Debug, Clone, Default)]
pub struct Fleet {
    repos: Vec<RepositoryHandle>,
}

impl Fleet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the fleet from `[[fleet.repos]]`, expanding path placeholders
    pub fn from_config(config: &FleetConfig) -> Result<Self> {
        let mut fleet = Self::new();
        for entry in &config.repos {
            let path = config.expand_path(&entry.path)?;
            fleet.add(RepositoryHandle::new(entry.name.clone(), path))?;
        }
        Ok(fleet)
    }

    /// Register a repository; names must be unique
    pub fn add(&mut self, handle: RepositoryHandle) -> Result<()> {
        if self.get(handle.name()).is_some() {
            return Err(Error::DuplicateRepository(handle.name().to_string()));
        }
        self.repos.push(handle);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&RepositoryHandle> {
        self.repos.iter().find(|r| r.name() == name)
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RepositoryHandle> {
        self.repos.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.repos.iter().map(|r| r.name()).collect()
    }

    /// Select repositories by exact name
    ///
    /// No patterns, or any `*`, selects the whole fleet in configured order.
    /// Otherwise handles come back in pattern order; unknown names are
    /// skipped with a warning and repeats are collapsed.
    pub fn resolve<S: AsRef<str>>(&self, patterns: &[S]) -> Vec<RepositoryHandle> {
        if patterns.is_empty() || patterns.iter().any(|p| p.as_ref() == ALL_PATTERN) {
            return self.repos.clone();
        }

        let mut seen = HashSet::new();
        let mut resolved = Vec::new();
        for pattern in patterns {
            let name = pattern.as_ref();
            if !seen.insert(name.to_string()) {
                continue;
            }
            match self.get(name) {
                Some(handle) => resolved.push(handle.clone()),
                None => warn!("Unknown repository '{}'", name),
            }
        }
        resolved
    }

    /// Live status of every repository in the fleet
    pub async fn summary(
        &self,
        reader: Arc<dyn GitStateReader>,
        max_workers: usize,
    ) -> BTreeMap<String, Result<RepoStatus>> {
        summarize(&self.repos, reader, max_workers).await
    }
}

/// Read the live status of each handle concurrently
///
/// A failed read is recorded for that repository only.
pub async fn summarize(
    handles: &[RepositoryHandle],
    reader: Arc<dyn GitStateReader>,
    max_workers: usize,
) -> BTreeMap<String, Result<RepoStatus>> {
    let results = fan_out(handles, max_workers, |handle| {
        let reader = Arc::clone(&reader);
        async move { handle.state(reader).await.map(RepoStatus::from) }
    })
    .await;

    results
        .into_iter()
        .map(|(handle, outcome)| {
            let status = outcome.and_then(|r| r);
            if let Err(e) = &status {
                warn!("Failed to read status of {}: {}", handle.name(), e);
            }
            (handle.name().to_string(), status)
        })
        .collect()
}
