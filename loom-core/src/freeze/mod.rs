//! Freeze snapshots: record and restore the commit of every repository
//!
//! A freeze pins each repository to its HEAD commit and identifies the whole
//! set by a BOM hash over the sorted `name:sha` pairs. Records are stored as
//! one JSON file per id under the snapshots directory.

mod service;
mod snapshot;
mod store;

pub use service::{
    FreezeRestoreReport, FreezeService, RestoredRepo, SkippedRepo, BACKUP_STASH_PREFIX,
};
pub use snapshot::{bom_hash, FreezeSnapshot};
pub use store::{is_valid_id, FreezeRecord, FreezeStore, RepoFreezeState, DETACHED_BRANCH};
