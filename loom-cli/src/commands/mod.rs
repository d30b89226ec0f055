//! CLI command implementations

pub mod exec;
pub mod freeze;
pub mod stash;
pub mod status;

pub use exec::ExecArgs;
pub use freeze::FreezeArgs;
pub use stash::StashArgs;
pub use status::StatusArgs;

use clap::Args;
use loom_core::{Loom, RepositoryHandle};

/// Which repositories a command applies to
#[derive(Args, Debug, Clone, Default)]
pub struct RepoSelection {
    /// Repository names, comma separated (default: all)
    #[arg(short, long, value_delimiter = ',')]
    pub repos: Vec<String>,
}

impl RepoSelection {
    pub fn resolve(&self, loom: &Loom) -> anyhow::Result<Vec<RepositoryHandle>> {
        let handles = loom.resolve_fleet(self.repos.as_slice());
        if handles.is_empty() {
            if loom.fleet().is_empty() {
                anyhow::bail!("No repositories configured. Add [[fleet.repos]] entries to the config file.");
            }
            anyhow::bail!("None of the requested repositories are in the fleet: {}", self.repos.join(", "));
        }
        Ok(handles)
    }
}

fn print_errors(errors: &[loom_core::stash::RepoError]) {
    for e in errors {
        println!("  ! {}: {}", e.repo, e.error);
    }
}
