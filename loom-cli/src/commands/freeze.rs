//! Freeze snapshot commands

use clap::{Args, Subcommand};
use loom_core::Loom;

use super::{print_errors, RepoSelection};

/// Freeze management commands
#[derive(Args, Debug)]
pub struct FreezeArgs {
    #[command(subcommand)]
    pub command: FreezeCommand,
}

#[derive(Subcommand, Debug)]
pub enum FreezeCommand {
    /// Record the HEAD commit of every selected repository
    Create {
        /// Label for the freeze; the id becomes `{tag}_{timestamp}`
        tag: String,

        #[command(flatten)]
        selection: RepoSelection,
    },

    /// Check out the recorded commits, stashing local changes first
    Restore {
        /// Freeze id
        id: String,

        #[command(flatten)]
        selection: RepoSelection,
    },

    /// List recorded freezes, newest first
    List,

    /// Show the repositories pinned by a freeze
    Show {
        /// Freeze id
        id: String,
    },

    /// Delete a freeze record
    Delete {
        /// Freeze id
        id: String,
    },
}

impl FreezeArgs {
    /// Execute the freeze command
    pub async fn execute(&self, loom: &Loom) -> anyhow::Result<()> {
        match &self.command {
            FreezeCommand::Create { tag, selection } => create(loom, selection, tag).await,
            FreezeCommand::Restore { id, selection } => restore(loom, selection, id).await,
            FreezeCommand::List => list(loom),
            FreezeCommand::Show { id } => show(loom, id),
            FreezeCommand::Delete { id } => delete(loom, id),
        }
    }
}

async fn create(loom: &Loom, selection: &RepoSelection, tag: &str) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let snapshot = loom.freeze_create(&handles, tag).await?;

    for (repo, sha) in snapshot.repos() {
        println!("  {:<24} {}", repo, sha);
    }
    println!();
    println!("{}", snapshot.describe());
    Ok(())
}

async fn restore(loom: &Loom, selection: &RepoSelection, id: &str) -> anyhow::Result<()> {
    let handles = selection.resolve(loom)?;
    let report = loom.freeze_restore(id, &handles).await?;

    for r in &report.restored {
        let short: String = r.commit.chars().take(12).collect();
        match &r.backup_stash {
            Some(stash) => println!("  {:<24} {} (local changes saved as {})", r.repo, short, stash),
            None => println!("  {:<24} {}", r.repo, short),
        }
    }
    for s in &report.skipped {
        println!("  skipped {}: {}", s.repo, s.reason);
    }
    print_errors(&report.errors);

    println!();
    println!(
        "Restored {} repositories, skipped {}",
        report.restored.len(),
        report.skipped.len()
    );
    if !report.errors.is_empty() {
        anyhow::bail!("Restore failed in {} repositories", report.errors.len());
    }
    Ok(())
}

fn list(loom: &Loom) -> anyhow::Result<()> {
    let records = loom.freeze_list()?;
    if records.is_empty() {
        println!("No freezes recorded.");
        return Ok(());
    }

    println!("{:<40} {:<20} {:>5}  BOM", "ID", "CREATED", "REPOS");
    for record in &records {
        let short: String = record.bom_hash.chars().take(8).collect();
        println!(
            "{:<40} {:<20} {:>5}  {}",
            record.id,
            record.created_at.format("%Y-%m-%d %H:%M:%S"),
            record.repositories.len(),
            short
        );
    }
    Ok(())
}

fn show(loom: &Loom, id: &str) -> anyhow::Result<()> {
    let record = loom.freeze_get(id)?;

    println!("Freeze: {}", record.id);
    println!("  Tag: {}", record.tag);
    println!("  Created: {}", record.created_at.to_rfc3339());
    println!("  BOM: {}", record.bom_hash);
    println!();
    for (repo, state) in &record.repositories {
        let mut line = format!("  {:<24} {:<20} {}", repo, state.branch, state.commit);
        if state.is_dirty {
            line.push_str(" (dirty)");
        }
        if !state.untracked_files.is_empty() {
            line.push_str(&format!(" ({} untracked)", state.untracked_files.len()));
        }
        println!("{}", line);
    }
    Ok(())
}

fn delete(loom: &Loom, id: &str) -> anyhow::Result<()> {
    if loom.freeze_delete(id) {
        println!("Deleted freeze {}", id);
        Ok(())
    } else {
        anyhow::bail!("No freeze named {}", id)
    }
}
