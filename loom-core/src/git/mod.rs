//! Git plumbing
//!
//! Reads go through libgit2 ([`GitRepo`], [`GitStateReader`]); mutations go
//! through the command gateway ([`GitCommands`]).

mod commands;
mod reader;
mod repo;

pub use commands::{parse_stash_list, GitCommands, StashEntry};
pub use reader::{Git2StateReader, GitStateReader, LastCommit, RepoState, RepoStatus};
pub use repo::{GitRepo, RemoteInfo, UpstreamInfo, WorkingTreeStatus};

pub(crate) use commands::non_zero;
