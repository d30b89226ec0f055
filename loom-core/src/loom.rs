//! Entry point tying configuration, fleet and services together

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bulk::{AggregatedResults, BulkExecutor, CommandResult};
use crate::config::Config;
use crate::exec::{CommandGateway, ProcessRunner, SystemProcessRunner};
use crate::fleet::{summarize, Fleet, RepositoryHandle};
use crate::freeze::{FreezeRecord, FreezeRestoreReport, FreezeService, FreezeSnapshot, FreezeStore};
use crate::git::{Git2StateReader, GitCommands, GitStateReader, RepoStatus};
use crate::stash::{ClearReport, RestoreReport, SaveReport, StashCoordinator, StashListing, StashStatus};
use crate::Result;

/// The fleet plus every service that operates on it
///
/// All services share one [`CommandGateway`], so its concurrency ceiling
/// holds across everything running through a `Loom`.
#[derive(Clone)]
pub struct Loom {
    config: Config,
    fleet: Fleet,
    gateway: CommandGateway,
    reader: Arc<dyn GitStateReader>,
    bulk: BulkExecutor,
    stash: StashCoordinator,
    freeze: FreezeService,
}

impl std::fmt::Debug for Loom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Loom")
            .field("fleet", &self.fleet.names())
            .field("gateway", &self.gateway)
            .finish_non_exhaustive()
    }
}

impl Loom {
    /// Build from configuration with the real process runner and libgit2 reader
    pub fn new(config: Config) -> Result<Self> {
        let fleet = Fleet::from_config(&config.fleet)?;
        Ok(Self::with_parts(
            config,
            fleet,
            Arc::new(SystemProcessRunner::new()),
            Arc::new(Git2StateReader),
        ))
    }

    /// Build with an explicit fleet and injected runner and reader
    pub fn with_parts(
        config: Config,
        fleet: Fleet,
        runner: Arc<dyn ProcessRunner>,
        reader: Arc<dyn GitStateReader>,
    ) -> Self {
        let gateway = CommandGateway::with_runner(config.exec.gateway_config(), runner);
        let git = GitCommands::new(gateway.clone());
        let max_workers = config.pool.max_workers;

        let bulk = BulkExecutor::new(gateway.clone());
        let stash = StashCoordinator::new(
            git.clone(),
            Arc::clone(&reader),
            config.stash.prefix.clone(),
            max_workers,
        );
        let freeze = FreezeService::new(
            FreezeStore::new(config.snapshots_dir()),
            git,
            Arc::clone(&reader),
            max_workers,
        );

        Self {
            config,
            fleet,
            gateway,
            reader,
            bulk,
            stash,
            freeze,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn fleet(&self) -> &Fleet {
        &self.fleet
    }

    pub fn gateway(&self) -> &CommandGateway {
        &self.gateway
    }

    fn workers(&self, max_workers: Option<usize>) -> usize {
        max_workers.unwrap_or(self.config.pool.max_workers).max(1)
    }

    /// Handles for exact names; empty or `*` selects every repository
    pub fn resolve_fleet<S: AsRef<str>>(&self, patterns: &[S]) -> Vec<RepositoryHandle> {
        self.fleet.resolve(patterns)
    }

    /// Live status of each handle
    pub async fn fleet_summary(
        &self,
        handles: &[RepositoryHandle],
        max_workers: Option<usize>,
    ) -> BTreeMap<String, Result<RepoStatus>> {
        summarize(handles, Arc::clone(&self.reader), self.workers(max_workers)).await
    }

    pub async fn bulk_execute(
        &self,
        command: &str,
        handles: &[RepositoryHandle],
        max_workers: Option<usize>,
    ) -> BTreeMap<String, CommandResult> {
        self.bulk
            .run(command, handles, self.workers(max_workers))
            .await
    }

    pub async fn bulk_execute_aggregated(
        &self,
        command: &str,
        handles: &[RepositoryHandle],
        max_workers: Option<usize>,
    ) -> AggregatedResults {
        self.bulk
            .run_with_aggregation(command, handles, self.workers(max_workers))
            .await
    }

    pub async fn stash_save(&self, handles: &[RepositoryHandle], message: Option<&str>) -> SaveReport {
        self.stash.save(handles, message).await
    }

    pub async fn stash_restore(
        &self,
        handles: &[RepositoryHandle],
        stash_ref: Option<&str>,
    ) -> RestoreReport {
        self.stash.restore(handles, stash_ref).await
    }

    pub async fn stash_list(&self, handles: &[RepositoryHandle]) -> StashListing {
        self.stash.list(handles).await
    }

    pub async fn stash_clear_owned(&self, handles: &[RepositoryHandle]) -> ClearReport {
        self.stash.clear_owned(handles).await
    }

    pub async fn stash_status(&self, handles: &[RepositoryHandle]) -> StashStatus {
        self.stash.status(handles).await
    }

    /// Fails if any handle is not a repository or the id already exists
    pub async fn freeze_create(
        &self,
        handles: &[RepositoryHandle],
        tag: &str,
    ) -> Result<FreezeSnapshot> {
        self.freeze.create(handles, tag).await
    }

    /// Fails only if `freeze_id` has no record
    pub async fn freeze_restore(
        &self,
        freeze_id: &str,
        handles: &[RepositoryHandle],
    ) -> Result<FreezeRestoreReport> {
        self.freeze.restore(freeze_id, handles).await
    }

    pub fn freeze_list(&self) -> Result<Vec<FreezeRecord>> {
        self.freeze.list()
    }

    pub fn freeze_get(&self, freeze_id: &str) -> Result<FreezeRecord> {
        self.freeze.get(freeze_id)
    }

    pub fn freeze_delete(&self, freeze_id: &str) -> bool {
        self.freeze.delete(freeze_id)
    }

    /// Terminate every subprocess currently running; returns how many were signalled
    pub fn kill_all(&self) -> usize {
        self.gateway.kill_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RepoEntry;
    use crate::testing::{head_sha, init_repo, ScriptedRunner};
    use std::fs;
    use tempfile::TempDir;

    fn config_for(root: &TempDir, names: &[&str]) -> Config {
        let mut config = Config::default();
        config.fleet.dev_root = Some(root.path().to_path_buf());
        config.freeze.snapshots_dir = root.path().join("snapshots");
        config.fleet.repos = names
            .iter()
            .map(|n| RepoEntry {
                name: n.to_string(),
                path: format!("$DEV_ROOT/{}", n),
            })
            .collect();
        config
    }

    #[tokio::test]
    async fn test_end_to_end() {
        let root = TempDir::new().unwrap();
        init_repo(&root.path().join("api"));
        init_repo(&root.path().join("web"));
        let loom = Loom::new(config_for(&root, &["api", "web"])).unwrap();

        let all = loom.resolve_fleet::<&str>(&[]);
        assert_eq!(all.len(), 2);

        let aggregated = loom.bulk_execute_aggregated("git status --short", &all, None).await;
        assert_eq!(aggregated.summary.succeeded, 2);

        let summary = loom.fleet_summary(&all, Some(1)).await;
        assert!(summary["api"].as_ref().unwrap().clean);

        let api_sha = head_sha(&root.path().join("api"));
        let snapshot = loom.freeze_create(&all, "e2e").await.unwrap();
        assert_eq!(snapshot.commit("api"), Some(api_sha.as_str()));

        fs::write(root.path().join("web/README.md"), "dirty\n").unwrap();
        let saved = loom.stash_save(&all, None).await;
        assert_eq!(saved.stashed.len(), 1);
        assert_eq!(loom.stash_status(&all).await.owned_stashes, 1);

        let records = loom.freeze_list().unwrap();
        assert_eq!(records.len(), 1);
        let report = loom.freeze_restore(&records[0].id, &all).await.unwrap();
        assert_eq!(report.restored.len(), 2);
        assert!(loom.freeze_delete(&records[0].id));
    }

    #[tokio::test]
    async fn test_kill_all_with_nothing_running() {
        let root = TempDir::new().unwrap();
        let loom = Loom::with_parts(
            config_for(&root, &[]),
            Fleet::new(),
            Arc::new(ScriptedRunner::new()),
            Arc::new(Git2StateReader),
        );
        assert_eq!(loom.kill_all(), 0);
        assert_eq!(loom.gateway().active_count(), 0);
    }
}
