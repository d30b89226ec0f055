//! Loom Core - orchestration for a fleet of git repositories
//!
//! A fleet is a set of independently versioned repositories managed as one
//! unit. This crate fans shell and git operations out across the fleet,
//! coordinates stashes and records and restores freezes (point-in-time commit
//! snapshots identified by a BOM hash).
//!
//! Every subprocess goes through the [`exec::CommandGateway`], which validates
//! commands, confines working directories, bounds concurrency and kills
//! whole process groups on timeout.

pub mod bulk;
pub mod config;
pub mod error;
pub mod exec;
pub mod fleet;
pub mod freeze;
pub mod git;
mod loom;
pub mod pool;
pub mod stash;

#[cfg(test)]
mod testing;

pub use bulk::{AggregatedResults, BulkExecutor, CommandResult, ExecSummary};
pub use config::Config;
pub use error::{Error, Result};
pub use exec::{CommandGateway, ErrorKind, ExecError, ExecRequest, ShellMode};
pub use fleet::{Fleet, RepositoryHandle};
pub use freeze::{FreezeRecord, FreezeService, FreezeSnapshot};
pub use loom::Loom;
pub use stash::StashCoordinator;
