//! Loom CLI - Command line interface for Loom
//!
//! Runs commands, stashes and freezes across a fleet of git repositories.

mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use loom_core::config::CliOverrides;
use loom_core::{Config, Loom, ShellMode};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use commands::{ExecArgs, FreezeArgs, StashArgs, StatusArgs};

/// Loom: orchestrate a fleet of git repositories
#[derive(Parser, Debug)]
#[command(name = "loom")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to ~/.config/loom/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Root directory of the fleet (overrides config and env)
    #[arg(long, global = true)]
    dev_root: Option<PathBuf>,

    /// Directory holding freeze records (overrides config and env)
    #[arg(long, global = true)]
    snapshots_dir: Option<PathBuf>,

    /// Command validation mode: safe, restricted or permissive
    #[arg(long, global = true)]
    mode: Option<ShellMode>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show version information
    Version,

    /// Show the git status of every repository
    #[command(visible_alias = "st")]
    Status(StatusArgs),

    /// Run a shell command in every repository
    #[command(visible_alias = "x")]
    Exec(ExecArgs),

    /// Save, restore and inspect stashes across the fleet
    Stash(StashArgs),

    /// Record and restore fleet-wide commit snapshots
    Freeze(FreezeArgs),

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();

    let overrides = CliOverrides {
        dev_root: cli.dev_root.clone(),
        snapshots_dir: cli.snapshots_dir.clone(),
        mode: cli.mode,
        max_workers: None,
    };
    let config = Config::load_with_overrides(cli.config.as_deref(), overrides)?;

    if cli.verbose {
        tracing::info!(
            repos = config.fleet.repos.len(),
            mode = ?config.exec.mode,
            max_workers = config.pool.max_workers,
            "Configuration loaded"
        );
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("loom {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Status(args)) => {
            let loom = Loom::new(config)?;
            args.execute(&loom).await?;
        }
        Some(Commands::Exec(args)) => {
            let loom = Loom::new(config)?;
            args.execute(&loom, cli.verbose).await?;
        }
        Some(Commands::Stash(args)) => {
            let loom = Loom::new(config)?;
            args.execute(&loom).await?;
        }
        Some(Commands::Freeze(args)) => {
            let loom = Loom::new(config)?;
            args.execute(&loom).await?;
        }
        Some(Commands::Config) => print_config(&config, cli.config.as_deref()),
        None => {
            println!("Loom - multi-repository orchestration");
            println!();
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

fn print_config(config: &Config, explicit: Option<&std::path::Path>) {
    println!("Loom Configuration");
    println!("==================");
    println!();
    println!("Fleet:");
    match &config.fleet.dev_root {
        Some(root) => println!("  dev_root: {}", root.display()),
        None => println!("  dev_root: (not set)"),
    }
    println!("  foundry_dir: {}", config.fleet.foundry_dir);
    for entry in &config.fleet.repos {
        match config.fleet.expand_path(&entry.path) {
            Ok(path) => println!("  - {}: {}", entry.name, path.display()),
            Err(e) => println!("  - {}: {} ({})", entry.name, entry.path, e),
        }
    }
    println!();
    println!("Execution:");
    println!("  mode: {:?}", config.exec.mode);
    println!("  max_concurrent: {}", config.exec.max_concurrent);
    println!("  default_timeout: {:?}", config.exec.default_timeout);
    println!("  kill_grace: {:?}", config.exec.kill_grace);
    println!(
        "  retry: {} attempts, {:?} apart",
        config.exec.retry_attempts, config.exec.retry_delay
    );
    println!("  max_workers: {}", config.pool.max_workers);
    println!();
    println!("Snapshots: {}", config.snapshots_dir().display());
    println!("Stash prefix: {}", config.stash.prefix);
    println!();

    let path = explicit
        .map(|p| p.to_path_buf())
        .or_else(Config::default_config_path);
    if let Some(path) = path {
        println!("Config file: {}", path.display());
        if path.exists() {
            println!("  (exists)");
        } else {
            println!("  (not found - using defaults)");
        }
    }
}
