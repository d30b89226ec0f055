//! On-disk freeze records, one JSON file per id

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::FreezeSnapshot;
use crate::{Error, Result};

/// Branch name recorded when HEAD is detached
pub const DETACHED_BRANCH: &str = "detached";

/// State of one repository at freeze time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFreezeState {
    pub path: PathBuf,
    /// Branch name, or `detached`
    pub branch: String,
    pub commit: String,
    /// Tracked files differed from HEAD
    pub is_dirty: bool,
    pub untracked_files: Vec<String>,
}

/// A persisted freeze
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeRecord {
    /// `{tag}_{YYYYmmdd_HHMMSS}`
    pub id: String,
    pub tag: String,
    pub bom_hash: String,
    pub created_at: DateTime<FixedOffset>,
    pub repositories: BTreeMap<String, RepoFreezeState>,
}

impl FreezeRecord {
    /// The name to commit mapping this record pins
    pub fn snapshot(&self) -> FreezeSnapshot {
        self.repositories
            .iter()
            .map(|(name, state)| (name.clone(), state.commit.clone()))
            .collect()
    }
}

/// Directory of freeze record files
#[derive(Debug, Clone)]
pub struct FreezeStore {
    dir: PathBuf,
}

impl FreezeStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File holding the record `id`
    pub fn path_for(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }

    pub fn exists(&self, id: &str) -> bool {
        is_valid_id(id) && self.path_for(id).exists()
    }

    /// Write a new record; never replaces an existing file
    pub fn create(&self, record: &FreezeRecord) -> Result<PathBuf> {
        if !is_valid_id(&record.id) {
            return Err(Error::InvalidTag(record.tag.clone()));
        }
        fs::create_dir_all(&self.dir)?;

        let path = self.path_for(&record.id);
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(Error::DuplicateFreezeId(record.id.clone()));
            }
            Err(e) => return Err(e.into()),
        };

        let json = serde_json::to_string_pretty(record)?;
        if let Err(e) = file.write_all(json.as_bytes()) {
            // Remove the partial file
            drop(file);
            let _ = fs::remove_file(&path);
            return Err(e.into());
        }
        Ok(path)
    }

    /// Load one record
    pub fn load(&self, id: &str) -> Result<FreezeRecord> {
        if !is_valid_id(id) {
            return Err(Error::FreezeNotFound(id.to_string()));
        }
        let contents = match fs::read_to_string(self.path_for(id)) {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(Error::FreezeNotFound(id.to_string()));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&contents)?)
    }

    /// Every readable record, newest first
    ///
    /// Files that fail to parse are skipped.
    pub fn list(&self) -> Result<Vec<FreezeRecord>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(Error::from)
                .and_then(|c| serde_json::from_str::<FreezeRecord>(&c).map_err(Error::from));
            match parsed {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable freeze record {:?}: {}", path, e),
            }
        }

        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(records)
    }

    /// Remove a record; `false` if there was nothing to remove
    pub fn delete(&self, id: &str) -> bool {
        if !is_valid_id(id) {
            return false;
        }
        match fs::remove_file(self.path_for(id)) {
            Ok(()) => {
                info!("Deleted freeze {}", id);
                true
            }
            Err(e) => {
                if e.kind() != ErrorKind::NotFound {
                    warn!("Failed to delete freeze {}: {}", id, e);
                }
                false
            }
        }
    }
}

/// Tags and ids become file names
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(['/', '\\', '\0'])
}
