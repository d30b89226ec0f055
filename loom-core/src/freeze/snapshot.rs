//! Content-addressed fleet state

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Repository name to commit SHA, plus the BOM hash over that mapping
///
/// Immutable: [`FreezeSnapshot::with_commit`] returns a new snapshot with a
/// recomputed hash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreezeSnapshot {
    repos: BTreeMap<String, String>,
    bom_hash: String,
}

impl FreezeSnapshot {
    pub fn new(repos: BTreeMap<String, String>) -> Self {
        let bom_hash = bom_hash(&repos);
        Self { repos, bom_hash }
    }

    pub fn repos(&self) -> &BTreeMap<String, String> {
        &self.repos
    }

    pub fn bom_hash(&self) -> &str {
        &self.bom_hash
    }

    pub fn commit(&self, name: &str) -> Option<&str> {
        self.repos.get(name).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.repos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.repos.is_empty()
    }

    /// Copy with `name` pinned to `sha`
    pub fn with_commit(&self, name: impl Into<String>, sha: impl Into<String>) -> Self {
        let mut repos = self.repos.clone();
        repos.insert(name.into(), sha.into());
        Self::new(repos)
    }

    /// One-line summary, e.g. `Freeze snapshot capturing 3 repo(s), BOM 1a2b3c4d`
    pub fn describe(&self) -> String {
        if self.repos.is_empty() {
            return "Freeze snapshot (empty)".to_string();
        }
        let short: String = self.bom_hash.chars().take(8).collect();
        format!(
            "Freeze snapshot capturing {} repo(s), BOM {}",
            self.repos.len(),
            short
        )
    }
}

impl FromIterator<(String, String)> for FreezeSnapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// SHA-256 over `name:sha` lines in name order; empty for an empty mapping
pub fn bom_hash(repos: &BTreeMap<String, String>) -> String {
    if repos.is_empty() {
        return String::new();
    }
    let canonical = repos
        .iter()
        .map(|(name, sha)| format!("{}:{}", name, sha))
        .collect::<Vec<_>>()
        .join("\n");
    hex::encode(Sha256::digest(canonical.as_bytes()))
}
