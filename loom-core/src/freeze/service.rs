//! Freeze creation and restoration

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::store::{is_valid_id, FreezeRecord, FreezeStore, RepoFreezeState, DETACHED_BRANCH};
use super::FreezeSnapshot;
use crate::fleet::RepositoryHandle;
use crate::git::{non_zero, GitCommands, GitStateReader, RepoState};
use crate::pool::fan_out;
use crate::stash::RepoError;
use crate::{Error, Result};

/// Stash message prefix for local work saved before a restore
pub const BACKUP_STASH_PREFIX: &str = "loom-freeze-backup";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoredRepo {
    pub repo: String,
    pub commit: String,
    /// Message of the stash holding local changes, if any were saved
    pub backup_stash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkippedRepo {
    pub repo: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeRestoreReport {
    pub restored: Vec<RestoredRepo>,
    /// Not part of the freeze
    pub skipped: Vec<SkippedRepo>,
    pub errors: Vec<RepoError>,
}

/// Creates, restores, lists and deletes freezes
#[derive(Clone)]
pub struct FreezeService {
    store: FreezeStore,
    git: GitCommands,
    reader: Arc<dyn GitStateReader>,
    max_workers: usize,
}

impl std::fmt::Debug for FreezeService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreezeService")
            .field("store", &self.store)
            .field("max_workers", &self.max_workers)
            .finish_non_exhaustive()
    }
}

impl FreezeService {
    pub fn new(
        store: FreezeStore,
        git: GitCommands,
        reader: Arc<dyn GitStateReader>,
        max_workers: usize,
    ) -> Self {
        Self {
            store,
            git,
            reader,
            max_workers,
        }
    }

    pub fn store(&self) -> &FreezeStore {
        &self.store
    }

    /// Record the current commit of every handle under `tag`
    pub async fn create(&self, handles: &[RepositoryHandle], tag: &str) -> Result<FreezeSnapshot> {
        self.create_at(handles, tag, Local::now()).await
    }

    /// [`create`](Self::create) with an explicit timestamp, which fixes the id
    ///
    /// Nothing is written unless every handle can be read.
    pub async fn create_at(
        &self,
        handles: &[RepositoryHandle],
        tag: &str,
        now: DateTime<Local>,
    ) -> Result<FreezeSnapshot> {
        if !is_valid_id(tag) {
            return Err(Error::InvalidTag(tag.to_string()));
        }
        let id = format!("{}_{}", tag, now.format("%Y%m%d_%H%M%S"));
        if self.store.exists(&id) {
            return Err(Error::DuplicateFreezeId(id));
        }

        let mut repositories = BTreeMap::new();
        for (handle, state) in self.read_states(handles).await? {
            let commit = state
                .head_sha
                .clone()
                .ok_or_else(|| handle.invalid("repository has no commits"))?;
            repositories.insert(
                handle.name().to_string(),
                RepoFreezeState {
                    path: handle.path().to_path_buf(),
                    branch: state
                        .branch
                        .clone()
                        .unwrap_or_else(|| DETACHED_BRANCH.to_string()),
                    commit,
                    is_dirty: state.is_dirty(),
                    untracked_files: state.untracked,
                },
            );
        }

        let snapshot: FreezeSnapshot = repositories
            .iter()
            .map(|(name, state)| (name.clone(), state.commit.clone()))
            .collect();
        let record = FreezeRecord {
            id: id.clone(),
            tag: tag.to_string(),
            bom_hash: snapshot.bom_hash().to_string(),
            created_at: now.fixed_offset(),
            repositories,
        };

        let path = self.store.create(&record)?;
        info!("Created freeze {} at {:?}: {}", id, path, snapshot.describe());
        Ok(snapshot)
    }

    /// Read every handle, failing on the first one that is not a usable repository
    async fn read_states(
        &self,
        handles: &[RepositoryHandle],
    ) -> Result<Vec<(RepositoryHandle, RepoState)>> {
        let outcomes = fan_out(handles, self.max_workers, |handle| {
            let reader = Arc::clone(&self.reader);
            async move { handle.state(reader).await }
        })
        .await;

        let mut states = Vec::with_capacity(outcomes.len());
        for (handle, outcome) in outcomes {
            match outcome.and_then(|r| r) {
                Ok(state) => states.push((handle, state)),
                Err(e) => return Err(handle.invalid(&e.to_string())),
            }
        }
        Ok(states)
    }

    /// Put every handle in the freeze back on its recorded commit
    ///
    /// Local changes are stashed first, never discarded. Handles the freeze
    /// does not know about are skipped.
    pub async fn restore(
        &self,
        freeze_id: &str,
        handles: &[RepositoryHandle],
    ) -> Result<FreezeRestoreReport> {
        let record = self.store.load(freeze_id)?;

        let outcomes = fan_out(handles, self.max_workers, |handle| {
            let this = self.clone();
            let target = record.repositories.get(handle.name()).cloned();
            async move {
                match target {
                    Some(target) => this.restore_one(&handle, &target.commit).await.map(Some),
                    None => Ok(None),
                }
            }
        })
        .await;

        let mut report = FreezeRestoreReport::default();
        for (handle, outcome) in outcomes {
            let repo = handle.name().to_string();
            match outcome.and_then(|r| r) {
                Ok(Some(restored)) => report.restored.push(restored),
                Ok(None) => report.skipped.push(SkippedRepo {
                    repo,
                    reason: "not in freeze snapshot".to_string(),
                }),
                Err(e) => {
                    warn!("Failed to restore {} from freeze {}: {}", repo, freeze_id, e);
                    report.errors.push(RepoError {
                        repo,
                        error: e.to_string(),
                    });
                }
            }
        }

        report.restored.sort_by(|a, b| a.repo.cmp(&b.repo));
        report.skipped.sort_by(|a, b| a.repo.cmp(&b.repo));
        report.errors.sort_by(|a, b| a.repo.cmp(&b.repo));
        info!(
            "Restored freeze {}: {} restored, {} skipped, {} errors",
            freeze_id,
            report.restored.len(),
            report.skipped.len(),
            report.errors.len()
        );
        Ok(report)
    }

    async fn restore_one(&self, handle: &RepositoryHandle, commit: &str) -> Result<RestoredRepo> {
        let state = handle.state(Arc::clone(&self.reader)).await?;

        let backup_stash = if state.is_clean() {
            None
        } else {
            let message = format!(
                "{}-{}",
                BACKUP_STASH_PREFIX,
                Local::now().format("%Y%m%d_%H%M%S")
            );
            let output = self.git.stash_push(handle.path(), &message).await?;
            if !output.success() {
                return Err(non_zero(output).into());
            }
            Some(message)
        };

        let output = self.git.reset_hard(handle.path(), commit).await?;
        if !output.success() {
            return Err(non_zero(output).into());
        }

        Ok(RestoredRepo {
            repo: handle.name().to_string(),
            commit: commit.to_string(),
            backup_stash,
        })
    }

    /// All freezes, newest first
    pub fn list(&self) -> Result<Vec<FreezeRecord>> {
        self.store.list()
    }

    /// One freeze by id
    pub fn get(&self, freeze_id: &str) -> Result<FreezeRecord> {
        self.store.load(freeze_id)
    }

    /// Remove a freeze; `false` if it did not exist
    pub fn delete(&self, freeze_id: &str) -> bool {
        self.store.delete(freeze_id)
    }
}
