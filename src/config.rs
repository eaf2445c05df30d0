use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{tlog_debug, Error, Result};

/// How a worker's workspace is isolated from its siblings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IsolationMode {
    /// A git worktree on a dedicated branch; the object store is shared.
    #[default]
    Worktree,
    /// A plain scratch directory (for repositories that are not git).
    Directory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Maximum burst of executor invocations.
    #[serde(default = "default_rate_capacity")]
    pub capacity: u32,
    /// Tokens added per second, shared by every run on the machine.
    #[serde(default = "default_refill_per_sec")]
    pub refill_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: default_rate_capacity(),
            refill_per_sec: default_refill_per_sec(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecutorConfig {
    /// Executor command line; the prompt is appended as the last argument.
    pub command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_max_parallel_workers")]
    pub max_parallel_workers: usize,
    #[serde(default = "default_max_active_runs")]
    pub max_active_runs: usize,
    #[serde(default = "default_worker_timeout_secs")]
    pub worker_timeout_secs: u64,
    #[serde(default = "default_grace_period_secs")]
    pub grace_period_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    #[serde(default = "default_lock_stale_secs")]
    pub lock_stale_secs: u64,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub isolation: IsolationMode,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    pub workspace_dir: Option<String>,
    pub state_dir: Option<String>,
}

fn default_max_parallel_workers() -> usize {
    4
}

fn default_max_active_runs() -> usize {
    2
}

fn default_worker_timeout_secs() -> u64 {
    1800
}

fn default_grace_period_secs() -> u64 {
    10
}

fn default_lock_timeout_secs() -> u64 {
    30
}

fn default_lock_stale_secs() -> u64 {
    60
}

fn default_rate_capacity() -> u32 {
    10
}

fn default_refill_per_sec() -> f64 {
    1.0
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_parallel_workers: default_max_parallel_workers(),
            max_active_runs: default_max_active_runs(),
            worker_timeout_secs: default_worker_timeout_secs(),
            grace_period_secs: default_grace_period_secs(),
            lock_timeout_secs: default_lock_timeout_secs(),
            lock_stale_secs: default_lock_stale_secs(),
            max_retries: 0,
            isolation: IsolationMode::default(),
            rate_limit: RateLimitConfig::default(),
            executor: ExecutorConfig::default(),
            workspace_dir: None,
            state_dir: None,
        }
    }
}

/// Resolved, typed settings consumed by the coordinator and registry.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub max_parallel_workers: usize,
    pub max_active_runs: usize,
    pub worker_timeout: Duration,
    pub grace_period: Duration,
    pub lock_timeout: Duration,
    pub lock_stale_after: Duration,
    pub max_retries: u32,
    pub isolation: IsolationMode,
    pub rate_limit: RateLimitConfig,
    /// Root for per-run and per-worker workspaces.
    pub workspace_dir: PathBuf,
    /// Root for state records, lock records, results and logs.
    pub state_dir: PathBuf,
}

impl RunSettings {
    /// Settings rooted in one directory; handy for tests and embedded use.
    pub fn rooted_at(root: &Path) -> Self {
        Config::default().settings_with_root(root)
    }

    pub fn lock_dir(&self) -> PathBuf {
        self.state_dir.join("locks")
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir.join("runs")
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.runs_dir().join(run_id)
    }

    pub fn registry_path(&self) -> PathBuf {
        self.state_dir.join("registry.json")
    }

    pub fn rate_limit_path(&self) -> PathBuf {
        self.state_dir.join("rate_limit.json")
    }
}

impl Config {
    pub fn tandem_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".tandem"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::tandem_dir()?.join("tandem.toml"))
    }

    pub fn effective_command(&self) -> &str {
        self.executor
            .command
            .as_deref()
            .unwrap_or("claude -p --output-format json")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        tlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            tlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        tlog_debug!(
            "Config loaded: max_parallel_workers={}, max_active_runs={}, isolation={:?}",
            config.max_parallel_workers,
            config.max_active_runs,
            config.isolation
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::tandem_dir()?;
        if !dir.exists() {
            tlog_debug!("Creating tandem directory");
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        tlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    /// Resolve into typed settings rooted in `~/.tandem`.
    pub fn settings(&self) -> Result<RunSettings> {
        Ok(self.settings_with_root(&Self::tandem_dir()?))
    }

    /// Resolve into typed settings; unset directories fall back below `root`.
    pub fn settings_with_root(&self, root: &Path) -> RunSettings {
        let workspace_dir = self
            .workspace_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| root.join("workspaces"));
        let state_dir = self
            .state_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(|| root.join("state"));
        RunSettings {
            max_parallel_workers: self.max_parallel_workers.max(1),
            max_active_runs: self.max_active_runs.max(1),
            worker_timeout: Duration::from_secs(self.worker_timeout_secs),
            grace_period: Duration::from_secs(self.grace_period_secs),
            lock_timeout: Duration::from_secs(self.lock_timeout_secs),
            lock_stale_after: Duration::from_secs(self.lock_stale_secs),
            max_retries: self.max_retries,
            isolation: self.isolation,
            rate_limit: self.rate_limit.clone(),
            workspace_dir,
            state_dir,
        }
    }

    pub fn ensure_dirs(settings: &RunSettings) -> Result<()> {
        for dir in [
            &settings.workspace_dir,
            &settings.state_dir,
            &settings.lock_dir(),
            &settings.runs_dir(),
        ] {
            if !dir.exists() {
                tlog_debug!("Creating directory: {}", dir.display());
                fs::create_dir_all(dir)?;
            }
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
