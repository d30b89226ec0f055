//! Stash coordination across the fleet
//!
//! Loom marks the stashes it creates with a message prefix so they can be
//! told apart from stashes made by hand. There is no state beyond git's own
//! stash list.
//!
//! Restoring without an explicit reference picks the most recent stash that
//! carries the prefix; manual stashes are never applied implicitly.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::fleet::RepositoryHandle;
use crate::git::{non_zero, GitCommands, GitStateReader, StashEntry};
use crate::pool::fan_out;
use crate::{Error, Result};

/// Message prefix of stashes created by Loom
pub const DEFAULT_STASH_PREFIX: &str = "loom-stash";

/// A stash entry in one repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashRecord {
    pub repo: String,
    /// e.g. `stash@{0}`
    pub stash_ref: String,
    pub index: usize,
    /// e.g. `On main`
    pub branch: String,
    pub message: String,
    /// Created by Loom
    pub owned: bool,
}

/// A repository whose operation failed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoError {
    pub repo: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashedRepo {
    pub repo: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveReport {
    pub stashed: Vec<StashedRepo>,
    /// Nothing to stash
    pub clean: Vec<String>,
    pub errors: Vec<RepoError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnstashedRepo {
    pub repo: String,
    pub stash_ref: String,
}

/// A stash that could not be applied cleanly and was left in place
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashConflictInfo {
    pub repo: String,
    pub stash_ref: String,
    pub detail: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub unstashed: Vec<UnstashedRepo>,
    pub no_stash: Vec<String>,
    /// Manual resolution required
    pub conflicts: Vec<StashConflictInfo>,
    pub errors: Vec<RepoError>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashListing {
    /// Only repositories that have at least one stash
    pub stashes: BTreeMap<String, Vec<StashRecord>>,
    pub errors: Vec<RepoError>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearedRepo {
    pub repo: String,
    pub count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClearReport {
    pub cleared: Vec<ClearedRepo>,
    pub no_stashes: Vec<String>,
    pub errors: Vec<RepoError>,
}

/// Fleet-wide stash counts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StashStatus {
    pub total_repos: usize,
    pub repos_with_stashes: usize,
    pub repos_with_owned_stashes: usize,
    pub total_stashes: usize,
    pub owned_stashes: usize,
    pub details: BTreeMap<String, Vec<StashRecord>>,
}

enum SaveOutcome {
    Stashed(String),
    Clean,
}

enum ClearOutcome {
    /// Some stashes were dropped; `failure` holds the last drop that was not
    Cleared { count: usize, failure: Option<Error> },
    Nothing,
}

/// Save, restore, list and clear stashes across repositories
#[derive(Clone)]
pub struct StashCoordinator {
    git: GitCommands,
    reader: Arc<dyn GitStateReader>,
    prefix: String,
    max_workers: usize,
}

impl std::fmt::Debug for StashCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StashCoordinator")
            .field("prefix", &self.prefix)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl StashCoordinator {
    pub fn new(
        git: GitCommands,
        reader: Arc<dyn GitStateReader>,
        prefix: impl Into<String>,
        max_workers: usize,
    ) -> Self {
        Self {
            git,
            reader,
            prefix: prefix.into(),
            max_workers,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether a stash message marks a Loom stash, i.e. reads `{prefix}-...`
    pub fn is_owned(&self, message: &str) -> bool {
        message
            .strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| rest.starts_with('-'))
    }

    /// Stash message for a save, from the caller's text or the current time
    pub fn stash_message(&self, message: Option<&str>) -> String {
        match message {
            Some(m) => format!("{}-{}", self.prefix, m),
            None => format!(
                "{}-{}",
                self.prefix,
                chrono::Local::now().format("%Y%m%d_%H%M%S")
            ),
        }
    }

    /// Stash local changes, untracked files included, in every dirty repository
    pub async fn save(&self, handles: &[RepositoryHandle], message: Option<&str>) -> SaveReport {
        let message = self.stash_message(message);
        let outcomes = fan_out(handles, self.max_workers, |handle| {
            let this = self.clone();
            let message = message.clone();
            async move { this.save_one(&handle, &message).await }
        })
        .await;

        let mut report = SaveReport::default();
        for (handle, outcome) in outcomes {
            match outcome.and_then(|r| r) {
                Ok(SaveOutcome::Stashed(message)) => report.stashed.push(StashedRepo {
                    repo: handle.name().to_string(),
                    message,
                }),
                Ok(SaveOutcome::Clean) => report.clean.push(handle.name().to_string()),
                Err(e) => report.errors.push(repo_error(&handle, e)),
            }
        }
        report.stashed.sort_by(|a, b| a.repo.cmp(&b.repo));
        report.clean.sort();
        sort_errors(&mut report.errors);
        report
    }

    async fn save_one(&self, handle: &RepositoryHandle, message: &str) -> Result<SaveOutcome> {
        let state = handle
            .state(Arc::clone(&self.reader))
            .await
            .map_err(|e| handle.invalid(&e.to_string()))?;
        if state.is_clean() {
            return Ok(SaveOutcome::Clean);
        }

        let output = self.git.stash_push(handle.path(), message).await?;
        if !output.success() {
            return Err(non_zero(output).into());
        }
        Ok(SaveOutcome::Stashed(message.to_string()))
    }

    /// Apply then drop a stash in every repository
    ///
    /// Without `stash_ref` the most recent Loom stash is used. A conflicting
    /// apply leaves the stash in the list.
    pub async fn restore(
        &self,
        handles: &[RepositoryHandle],
        stash_ref: Option<&str>,
    ) -> RestoreReport {
        let stash_ref = stash_ref.map(str::to_string);
        let outcomes = fan_out(handles, self.max_workers, |handle| {
            let this = self.clone();
            let stash_ref = stash_ref.clone();
            async move { this.restore_one(&handle, stash_ref.as_deref()).await }
        })
        .await;

        let mut report = RestoreReport::default();
        for (handle, outcome) in outcomes {
            let repo = handle.name().to_string();
            match outcome.and_then(|r| r) {
                Ok(Some(stash_ref)) => report.unstashed.push(UnstashedRepo { repo, stash_ref }),
                Ok(None) => report.no_stash.push(repo),
                Err(e) => {
                    if let Error::StashConflict { stash_ref, .. } = &e {
                        let stash_ref = stash_ref.clone();
                        report.conflicts.push(StashConflictInfo {
                            repo,
                            stash_ref,
                            detail: e.to_string(),
                        });
                    } else {
                        report.errors.push(repo_error(&handle, e));
                    }
                }
            }
        }
        report.unstashed.sort_by(|a, b| a.repo.cmp(&b.repo));
        report.no_stash.sort();
        report.conflicts.sort_by(|a, b| a.repo.cmp(&b.repo));
        sort_errors(&mut report.errors);
        report
    }

    async fn restore_one(
        &self,
        handle: &RepositoryHandle,
        stash_ref: Option<&str>,
    ) -> Result<Option<String>> {
        let entries = self.git.stash_list(handle.path()).await?;
        if entries.is_empty() {
            return Ok(None);
        }

        let target = match stash_ref {
            Some(r) => r.to_string(),
            None => match entries.iter().find(|e| self.is_owned(&e.message)) {
                Some(entry) => entry.stash_ref.clone(),
                None => return Ok(None),
            },
        };

        let applied = self.git.stash_apply(handle.path(), &target).await?;
        if !applied.success() {
            if applied.combined_output().to_lowercase().contains("conflict") {
                warn!("Stash {} conflicts in {}, left in place", target, handle.name());
                return Err(Error::StashConflict {
                    repo: handle.name().to_string(),
                    stash_ref: target,
                });
            }
            return Err(non_zero(applied).into());
        }

        let dropped = self.git.stash_drop(handle.path(), &target).await?;
        if !dropped.success() {
            return Err(Error::Git(format!(
                "applied {} but could not drop it: {}",
                target,
                dropped.stderr.trim()
            )));
        }
        Ok(Some(target))
    }

    /// Every stash in every repository, flagged by ownership
    pub async fn list(&self, handles: &[RepositoryHandle]) -> StashListing {
        let outcomes = fan_out(handles, self.max_workers, |handle| {
            let this = self.clone();
            async move { this.records(&handle).await }
        })
        .await;

        let mut listing = StashListing::default();
        for (handle, outcome) in outcomes {
            match outcome.and_then(|r| r) {
                Ok(records) if records.is_empty() => {}
                Ok(records) => {
                    listing.stashes.insert(handle.name().to_string(), records);
                }
                Err(e) => listing.errors.push(repo_error(&handle, e)),
            }
        }
        sort_errors(&mut listing.errors);
        listing
    }

    async fn records(&self, handle: &RepositoryHandle) -> Result<Vec<StashRecord>> {
        let entries = self.git.stash_list(handle.path()).await?;
        Ok(entries
            .into_iter()
            .map(|entry| self.record(handle, entry))
            .collect())
    }

    fn record(&self, handle: &RepositoryHandle, entry: StashEntry) -> StashRecord {
        StashRecord {
            repo: handle.name().to_string(),
            owned: self.is_owned(&entry.message),
            stash_ref: entry.stash_ref,
            index: entry.index,
            branch: entry.branch_info,
            message: entry.message,
        }
    }

    /// Drop every Loom stash, leaving manual stashes alone
    pub async fn clear_owned(&self, handles: &[RepositoryHandle]) -> ClearReport {
        let outcomes = fan_out(handles, self.max_workers, |handle| {
            let this = self.clone();
            async move { this.clear_one(&handle).await }
        })
        .await;

        let mut report = ClearReport::default();
        for (handle, outcome) in outcomes {
            match outcome.and_then(|r| r) {
                Ok(ClearOutcome::Cleared { count, failure }) => {
                    report.cleared.push(ClearedRepo {
                        repo: handle.name().to_string(),
                        count,
                    });
                    if let Some(e) = failure {
                        report.errors.push(repo_error(&handle, e));
                    }
                }
                Ok(ClearOutcome::Nothing) => report.no_stashes.push(handle.name().to_string()),
                Err(e) => report.errors.push(repo_error(&handle, e)),
            }
        }
        report.cleared.sort_by(|a, b| a.repo.cmp(&b.repo));
        report.no_stashes.sort();
        sort_errors(&mut report.errors);
        report
    }

    async fn clear_one(&self, handle: &RepositoryHandle) -> Result<ClearOutcome> {
        let mut owned: Vec<StashEntry> = self
            .git
            .stash_list(handle.path())
            .await?
            .into_iter()
            .filter(|e| self.is_owned(&e.message))
            .collect();
        if owned.is_empty() {
            return Ok(ClearOutcome::Nothing);
        }

        // Highest index first so the remaining indices stay valid
        owned.sort_by(|a, b| b.index.cmp(&a.index));

        let mut dropped = 0;
        let mut last_failure = None;
        for entry in &owned {
            match self.git.stash_drop(handle.path(), &entry.stash_ref).await {
                Ok(output) if output.success() => dropped += 1,
                Ok(output) => {
                    warn!(
                        "Failed to drop {} in {}: {}",
                        entry.stash_ref,
                        handle.name(),
                        output.stderr.trim()
                    );
                    last_failure = Some(Error::from(non_zero(output)));
                }
                Err(e) => {
                    warn!("Failed to drop {} in {}: {}", entry.stash_ref, handle.name(), e);
                    last_failure = Some(Error::from(e));
                }
            }
        }

        match (dropped, last_failure) {
            (0, Some(e)) => Err(e),
            (0, None) => Ok(ClearOutcome::Nothing),
            (n, failure) => {
                info!("Cleared {} Loom stashes in {}", n, handle.name());
                Ok(ClearOutcome::Cleared { count: n, failure })
            }
        }
    }

    /// Stash totals across the given repositories
    pub async fn status(&self, handles: &[RepositoryHandle]) -> StashStatus {
        let listing = self.list(handles).await;

        let mut status = StashStatus {
            total_repos: handles.len(),
            ..StashStatus::default()
        };
        for records in listing.stashes.values() {
            let owned = records.iter().filter(|r| r.owned).count();
            status.repos_with_stashes += 1;
            status.total_stashes += records.len();
            if owned > 0 {
                status.repos_with_owned_stashes += 1;
                status.owned_stashes += owned;
            }
        }
        status.details = listing.stashes;
        status
    }
}

fn repo_error(handle: &RepositoryHandle, err: Error) -> RepoError {
    warn!("Stash operation failed in {}: {}", handle.name(), err);
    RepoError {
        repo: handle.name().to_string(),
        error: err.to_string(),
    }
}

fn sort_errors(errors: &mut [RepoError]) {
    errors.sort_by(|a, b| a.repo.cmp(&b.repo));
}
