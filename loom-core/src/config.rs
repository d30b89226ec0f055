//! Configuration management for Loom
//!
//! Configuration is loaded with the following priority (highest to lowest):
//! 1. CLI flags
//! 2. Environment variables (LOOM_*)
//! 3. Config file (~/.config/loom/config.toml)
//! 4. Default values

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::exec::{GatewayConfig, RetryPolicy, ShellMode};
use crate::pool::DEFAULT_MAX_WORKERS;
use crate::{Error, Result};

/// One configured repository
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RepoEntry {
    /// Unique name within the fleet
    pub name: String,
    /// Path; may use `~`, `$DEV_ROOT` and `$FOUNDRY_DIR`
    pub path: String,
}

/// Fleet membership
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FleetConfig {
    /// Root directory all repositories live under
    pub dev_root: Option<PathBuf>,

    /// Name of the directory holding the core repositories
    pub foundry_dir: String,

    pub repos: Vec<RepoEntry>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            dev_root: None,
            foundry_dir: "foundry".to_string(),
            repos: Vec::new(),
        }
    }
}

impl FleetConfig {
    /// Resolve a configured path to an absolute one
    ///
    /// Relative results are taken relative to `dev_root`.
    pub fn expand_path(&self, raw: &str) -> Result<PathBuf> {
        let mut expanded = raw.to_string();

        if expanded.contains("$DEV_ROOT") || expanded.contains("${DEV_ROOT}") {
            let dev_root = self.dev_root_expanded().ok_or_else(|| {
                Error::Config(format!("'{}' uses $DEV_ROOT but no dev_root is configured", raw))
            })?;
            let dev_root = dev_root.to_string_lossy();
            expanded = expanded
                .replace("${DEV_ROOT}", &dev_root)
                .replace("$DEV_ROOT", &dev_root);
        }
        expanded = expanded
            .replace("${FOUNDRY_DIR}", &self.foundry_dir)
            .replace("$FOUNDRY_DIR", &self.foundry_dir);

        let path = expand_tilde(&expanded);
        if path.is_relative() {
            if let Some(root) = self.dev_root_expanded() {
                return Ok(root.join(path));
            }
        }
        Ok(path)
    }

    fn dev_root_expanded(&self) -> Option<PathBuf> {
        self.dev_root
            .as_ref()
            .map(|p| expand_tilde(&p.to_string_lossy()))
    }
}

/// Subprocess execution settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ExecConfig {
    /// Validation strictness for shell commands
    pub mode: ShellMode,

    /// Ceiling on subprocesses running at once
    pub max_concurrent: usize,

    #[serde(with = "humantime_serde")]
    pub default_timeout: Duration,

    /// Time between SIGTERM and SIGKILL on timeout
    #[serde(with = "humantime_serde")]
    pub kill_grace: Duration,

    /// Total attempts for transient git failures
    pub retry_attempts: u32,

    #[serde(with = "humantime_serde")]
    pub retry_delay: Duration,

    /// Roots commands may run under; empty means anywhere
    pub allowed_paths: Vec<PathBuf>,

    /// Added to the built-in allow-list (safe mode)
    pub allowed_commands: Vec<String>,

    /// Added to the built-in deny-list
    pub blocked_commands: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        let gateway = GatewayConfig::default();
        Self {
            mode: gateway.mode,
            max_concurrent: gateway.max_concurrent,
            default_timeout: gateway.default_timeout,
            kill_grace: gateway.kill_grace,
            retry_attempts: gateway.retry.max_attempts,
            retry_delay: gateway.retry.delay,
            allowed_paths: Vec::new(),
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
        }
    }
}

impl ExecConfig {
    /// Gateway settings with `~` expanded in allowed paths
    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            mode: self.mode,
            max_concurrent: self.max_concurrent,
            default_timeout: self.default_timeout,
            kill_grace: self.kill_grace,
            allowed_paths: self
                .allowed_paths
                .iter()
                .map(|p| expand_tilde(&p.to_string_lossy()))
                .collect(),
            allowed_commands: self.allowed_commands.clone(),
            blocked_commands: self.blocked_commands.clone(),
            retry: RetryPolicy::new(self.retry_attempts, self.retry_delay),
        }
    }
}

/// Fan-out settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Repositories processed concurrently by one operation
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
        }
    }
}

/// Freeze snapshot settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FreezeConfig {
    pub snapshots_dir: PathBuf,
}

impl Default for FreezeConfig {
    fn default() -> Self {
        Self {
            snapshots_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".loom")
                .join("snapshots"),
        }
    }
}

/// Stash settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StashConfig {
    /// Message prefix marking stashes created by Loom
    pub prefix: String,
}

impl Default for StashConfig {
    fn default() -> Self {
        Self {
            prefix: crate::stash::DEFAULT_STASH_PREFIX.to_string(),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub fleet: FleetConfig,
    pub exec: ExecConfig,
    pub pool: PoolConfig,
    pub freeze: FreezeConfig,
    pub stash: StashConfig,
}

/// Values given on the command line
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub dev_root: Option<PathBuf>,
    pub snapshots_dir: Option<PathBuf>,
    pub mode: Option<ShellMode>,
    pub max_workers: Option<usize>,
}

impl Config {
    /// Load configuration from the default config file location
    ///
    /// Returns default config if file doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path();

        if let Some(path) = config_path {
            if path.exists() {
                return Self::load_from_file(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Get the default config file path
    ///
    /// Returns `~/.config/loom/config.toml` on Linux
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("loom").join("config.toml"))
    }

    /// Apply environment variable overrides
    ///
    /// Supported variables:
    /// - LOOM_DEV_ROOT: Root directory of the fleet
    /// - LOOM_SNAPSHOTS_DIR: Where freeze records are stored
    /// - LOOM_SHELL_MODE: safe, restricted or permissive
    /// - LOOM_MAX_WORKERS: Fan-out width
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(dev_root) = std::env::var("LOOM_DEV_ROOT") {
            self.fleet.dev_root = Some(PathBuf::from(dev_root));
        }

        if let Ok(dir) = std::env::var("LOOM_SNAPSHOTS_DIR") {
            self.freeze.snapshots_dir = PathBuf::from(dir);
        }

        if let Ok(mode) = std::env::var("LOOM_SHELL_MODE") {
            match mode.parse() {
                Ok(mode) => self.exec.mode = mode,
                Err(e) => warn!("Ignoring LOOM_SHELL_MODE: {}", e),
            }
        }

        if let Ok(workers) = std::env::var("LOOM_MAX_WORKERS") {
            match workers.parse::<usize>() {
                Ok(n) if n > 0 => self.pool.max_workers = n,
                _ => warn!("Ignoring LOOM_MAX_WORKERS: '{}' is not a positive integer", workers),
            }
        }

        self
    }

    /// Apply CLI flag overrides
    pub fn with_cli_overrides(mut self, overrides: CliOverrides) -> Self {
        if let Some(dev_root) = overrides.dev_root {
            self.fleet.dev_root = Some(dev_root);
        }

        if let Some(dir) = overrides.snapshots_dir {
            self.freeze.snapshots_dir = dir;
        }

        if let Some(mode) = overrides.mode {
            self.exec.mode = mode;
        }

        if let Some(n) = overrides.max_workers {
            self.pool.max_workers = n.max(1);
        }

        self
    }

    /// Load configuration with all overrides applied
    ///
    /// Priority: CLI > env > config file > defaults
    pub fn load_with_overrides(
        config_file: Option<&Path>,
        overrides: CliOverrides,
    ) -> Result<Self> {
        let base = match config_file {
            Some(path) => Self::load_from_file(path)?,
            None => Self::load()?,
        };
        Ok(base.with_env_overrides().with_cli_overrides(overrides))
    }

    /// Snapshot directory with `~` expanded
    pub fn snapshots_dir(&self) -> PathBuf {
        expand_tilde(&self.freeze.snapshots_dir.to_string_lossy())
    }
}

/// Replace a leading `~` with the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
