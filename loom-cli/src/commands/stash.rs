//! Fleet-wide stash commands

use clap::{Args, Subcommand};
use loom_core::Loom;

use super::{print_errors, RepoSelection};

/// Stash management commands
#[derive(Args, Debug)]
pub struct StashArgs {
    #[command(subcommand)]
    pub command: StashCommand,
}

#[derive(Subcommand, Debug)]
pub enum StashCommand {
    /// Stash uncommitted work (including untracked files) in dirty repositories
    Save {
        /// Text appended to the stash message
        #[arg(short, long)]
        message: Option<String>,

        #[command(flatten)]
        selection: RepoSelection,
    },

    /// Apply and drop a stash in each repository
    Restore {
        /// Stash to restore, e.g. `stash@{1}` (default: most recent loom stash)
        #[arg(long = "ref")]
        stash_ref: Option<String>,

        #[command(flatten)]
        selection: RepoSelection,
    },

    /// List stashes per repository
    List {
        /// Only show stashes created by loom
        #[arg(long)]
        owned: bool,

        #[command(flatten)]
        selection: RepoSelection,
    },

    /// Drop every stash created by loom
    Clear {
        #[command(flatten)]
        selection: RepoSelection,
    },

    /// Count stashes across the fleet
    Status {
        #[command(flatten)]
        selection: RepoSelection,
    },
}

impl StashArgs {
    /// Execute the stash command
    pub async fn execute(&self, loom: &Loom) -> anyhow::Result<()> {
        match &self.command {
            StashCommand::Save { message, selection } => {
                save(loom, selection, message.as_deref()).await
            }
            StashCommand::Restore {
                stash_ref,
                selection,
            } => restore(loom, selection, stash_ref.as_deref()).await,
            StashCommand::List { owned, selection } => list(loom, selection, *owned).await,
            StashCommand::Clear { selection } => clear(loom, selection).await,
            StashCommand::Status { selection } => status(loom, selection).await,
        }
    }
}

async fn save(loom: &Loom, selection: &RepoSelection, message: Option<&str>) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let report = loom.stash_save(&handles, message).await;

    for s in &report.stashed {
        println!("  stashed {}: {}", s.repo, s.message);
    }
    if !report.clean.is_empty() {
        println!("  clean: {}", report.clean.join(", "));
    }
    print_errors(&report.errors);

    println!();
    println!(
        "Stashed {} repositories, {} already clean",
        report.stashed.len(),
        report.clean.len()
    );
    if !report.errors.is_empty() {
        anyhow::bail!("Stash failed in {} repositories", report.errors.len());
    }
    Ok(())
}

async fn restore(
    loom: &Loom,
    selection: &RepoSelection,
    stash_ref: Option<&str>,
) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let report = loom.stash_restore(&handles, stash_ref).await;

    for u in &report.unstashed {
        println!("  restored {} from {}", u.repo, u.stash_ref);
    }
    if !report.no_stash.is_empty() {
        println!("  nothing to restore: {}", report.no_stash.join(", "));
    }
    for c in &report.conflicts {
        println!("  CONFLICT {} ({}): stash kept", c.repo, c.stash_ref);
    }
    print_errors(&report.errors);

    println!();
    println!(
        "Restored {} repositories, {} conflicts",
        report.unstashed.len(),
        report.conflicts.len()
    );
    if !report.conflicts.is_empty() || !report.errors.is_empty() {
        anyhow::bail!(
            "Restore incomplete: {} conflicts, {} errors",
            report.conflicts.len(),
            report.errors.len()
        );
    }
    Ok(())
}

async fn list(loom: &Loom, selection: &RepoSelection, owned_only: bool) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let listing = loom.stash_list(&handles).await;

    let mut shown = 0;
    for (repo, stashes) in &listing.stashes {
        let stashes: Vec<_> = stashes.iter().filter(|s| !owned_only || s.owned).collect();
        if stashes.is_empty() {
            continue;
        }
        println!("{}:", repo);
        for s in stashes {
            let marker = if s.owned { "*" } else { " " };
            println!("  {} {:<12} {} {}", marker, s.stash_ref, s.branch, s.message);
            shown += 1;
        }
    }
    print_errors(&listing.errors);

    if shown == 0 {
        println!("No stashes found.");
    }
    Ok(())
}

async fn clear(loom: &Loom, selection: &RepoSelection) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let report = loom.stash_clear_owned(&handles).await;

    for c in &report.cleared {
        println!("  dropped {} stash(es) in {}", c.count, c.repo);
    }
    print_errors(&report.errors);

    let total: usize = report.cleared.iter().map(|c| c.count).sum();
    println!();
    println!(
        "Dropped {} stashes across {} repositories",
        total,
        report.cleared.len()
    );
    Ok(())
}

async fn status(loom: &Loom, selection: &RepoSelection) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let status = loom.stash_status(&handles).await;

    println!("Stash Status");
    println!("============");
    println!("  repositories:          {}", status.total_repos);
    println!("  with stashes:          {}", status.repos_with_stashes);
    println!("  with loom stashes:     {}", status.repos_with_owned_stashes);
    println!("  total stashes:         {}", status.total_stashes);
    println!("  loom stashes:          {}", status.owned_stashes);

    if !status.details.is_empty() {
        println!();
        for (repo, stashes) in &status.details {
            let owned = stashes.iter().filter(|s| s.owned).count();
            println!("  {:<24} {} ({} loom)", repo, stashes.len(), owned);
        }
    }
    Ok(())
}
