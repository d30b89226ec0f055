//! Fleet status command

use clap::Args;
use loom_core::Loom;

use super::RepoSelection;

/// Show branch, cleanliness and upstream drift per repository
#[derive(Args, Debug)]
pub struct StatusArgs {
    #[command(flatten)]
    pub selection: RepoSelection,

    /// Number of repositories read concurrently
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// List the changed files as well
    #[arg(short, long)]
    pub files: bool,
}

impl StatusArgs {
    pub async fn execute(&self, loom: &Loom) -> anyhow::Result<()> {
        let handles = self.selection.resolve(loom)?;
        let summary = loom.fleet_summary(&handles, self.workers).await;

        println!("Fleet Status");
        println!("============");
        println!();

        let mut dirty = 0;
        let mut failed = 0;
        for (name, status) in &summary {
            let status = match status {
                Ok(status) => status,
                Err(e) => {
                    failed += 1;
                    println!("{:<24} error: {}", name, e);
                    continue;
                }
            };

            let branch = status.branch.as_deref().unwrap_or("(detached)");
            let state = if status.clean { "clean" } else { "dirty" };
            if !status.clean {
                dirty += 1;
            }

            let mut line = format!("{:<24} {:<20} {}", name, branch, state);
            if status.ahead > 0 || status.behind > 0 {
                line.push_str(&format!("  +{} -{}", status.ahead, status.behind));
            }
            if status.staged_count + status.modified_count + status.untracked_count > 0 {
                line.push_str(&format!(
                    "  ({} staged, {} modified, {} untracked)",
                    status.staged_count, status.modified_count, status.untracked_count
                ));
            }
            println!("{}", line);

            if self.files {
                for f in &status.staged {
                    println!("    S {}", f);
                }
                for f in &status.modified {
                    println!("    M {}", f);
                }
                for f in &status.untracked {
                    println!("    ? {}", f);
                }
            }
        }

        println!();
        println!(
            "{} repositories: {} clean, {} dirty, {} unreadable",
            summary.len(),
            summary.len() - dirty - failed,
            dirty,
            failed
        );
        Ok(())
    }
}
