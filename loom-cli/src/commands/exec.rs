//! Bulk command execution

use clap::Args;
use loom_core::Loom;

use super::RepoSelection;

/// Run one shell command in each selected repository
#[derive(Args, Debug)]
pub struct ExecArgs {
    /// Command to run; quote it or pass it after `--`
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,

    #[command(flatten)]
    pub selection: RepoSelection,

    /// Number of repositories run concurrently
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Only print the summary and failures
    #[arg(short, long)]
    pub quiet: bool,
}

impl ExecArgs {
    pub async fn execute(&self, loom: &Loom, verbose: bool) -> anyhow::Result<()> {
        let command = self.command.join(" ");
        let handles = self.selection.resolve(loom)?;

        let aggregated = loom
            .bulk_execute_aggregated(&command, &handles, self.workers)
            .await;

        for (name, result) in &aggregated.results {
            if self.quiet && result.success {
                continue;
            }
            let mark = if result.success { "ok" } else { "FAILED" };
            println!("== {} [{}] exit {} ==", name, mark, result.return_code);
            if verbose {
                println!("   {} in {} ({} ms)", result.command, result.repo_path.display(), result.duration_ms);
            }
            let stdout = result.stdout.trim_end();
            if !stdout.is_empty() {
                println!("{}", stdout);
            }
            let stderr = result.stderr.trim_end();
            if !stderr.is_empty() {
                println!("{}", stderr);
            }
            if let Some(kind) = &result.error {
                println!("   error: {}", kind.as_str());
            }
        }

        let summary = &aggregated.summary;
        println!();
        println!(
            "{}/{} succeeded ({:.0}%)",
            summary.succeeded,
            summary.total,
            summary.success_rate * 100.0
        );

        if !aggregated.failed.is_empty() {
            anyhow::bail!("Command failed in: {}", aggregated.failed.join(", "));
        }
        Ok(())
    }
}
