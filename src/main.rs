use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use tandem::config::{Config, IsolationMode, RunSettings};
use tandem::core::WorkGraph;
use tandem::git::GitOps;
use tandem::lock::{FileLockManager, LockManager};
use tandem::orchestration::{
    CommandExecutor, Executor, Registry, RunEvent, RunRegistryEntry, WorkspaceManager,
};
use tandem::state::{RunState, StateStore};
use tandem::{tlog, tlog_error, Error, Result};

/// Tandem - dependency-aware parallel execution of work units
#[derive(Parser, Debug)]
#[command(name = "tandem")]
#[command(version, about, long_about = None)]
#[command(after_help = "ENVIRONMENT:\n    TANDEM_DEBUG=1     Enable debug logging (alternative to --debug)")]
pub struct Cli {
    /// Enable debug logging (writes to ~/.tandem/tandem.log)
    #[arg(short = 'd', long, global = true)]
    pub debug: bool,

    /// Config file (default: ~/.tandem/tandem.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// Validate a work specification and print its batches
    Plan {
        /// Work specification (JSON)
        spec: PathBuf,
    },

    /// Execute a work specification
    Run {
        /// Work specification (JSON)
        spec: PathBuf,

        /// Run name (default: the spec's file stem)
        #[arg(long)]
        name: Option<String>,

        /// Override max_parallel_workers
        #[arg(long, short = 'j')]
        workers: Option<usize>,

        /// Use plain directories instead of git worktrees
        #[arg(long)]
        directory: bool,
    },

    /// Show one run, unit by unit
    Status {
        run_id: String,
    },

    /// List active and recently finished runs
    List,

    /// Stop a run (in this or another process)
    Stop {
        run_id: String,
    },

    /// Reap dead runs and remove orphaned workspaces
    Cleanup,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    tandem::log::init_with_debug(cli.debug);

    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };

    let rt = tokio::runtime::Runtime::new()?;
    let result = rt.block_on(dispatch(cli.command, config));
    drop(rt);
    match result {
        Ok(true) => Ok(()),
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tlog_error!("tandem failed: {}", e);
            Err(e)
        }
    }
}

/// Returns whether the command succeeded; errors are reported by `main`.
async fn dispatch(command: Command, config: Config) -> Result<bool> {
    match command {
        Command::Plan { spec } => run_plan(&spec),
        Command::Run {
            spec,
            name,
            workers,
            directory,
        } => run_spec(config, &spec, name, workers, directory).await,
        Command::Status { run_id } => run_status(config, &run_id).await,
        Command::List => run_list(config).await,
        Command::Stop { run_id } => run_stop(config, &run_id).await,
        Command::Cleanup => run_cleanup(config).await,
    }
}

fn run_plan(spec: &Path) -> Result<bool> {
    let graph = WorkGraph::load(spec)?;
    print!("{}", graph.get_execution_plan()?);
    Ok(true)
}

/// Settings, lock manager and registry shared by every subcommand.
fn open_registry(config: &Config, strict_executor: bool) -> Result<Arc<Registry>> {
    let settings = config.settings()?;
    Config::ensure_dirs(&settings)?;
    let locks: Arc<dyn LockManager> =
        Arc::new(FileLockManager::new(&settings.lock_dir(), settings.lock_stale_after)?);
    let executor = executor_for(config, strict_executor)?;
    let git = repository(&settings)?;
    Ok(Arc::new(Registry::open(settings, locks, executor, git)?))
}

fn executor_for(config: &Config, strict: bool) -> Result<Arc<dyn Executor>> {
    let command = config.effective_command();
    match CommandExecutor::from_command_line(command) {
        Ok(exec) => Ok(Arc::new(exec)),
        Err(e) if strict => Err(e),
        // Status queries never invoke the executor.
        Err(_) => {
            let mut parts = command.split_whitespace();
            let program = parts.next().unwrap_or("true").to_string();
            Ok(Arc::new(CommandExecutor::new(program, parts)))
        }
    }
}

fn repository(settings: &RunSettings) -> Result<Option<GitOps>> {
    if settings.isolation != IsolationMode::Worktree {
        return Ok(None);
    }
    let cwd = std::env::current_dir()?;
    if GitOps::is_repo(&cwd) {
        Ok(Some(GitOps::new(&cwd)?))
    } else {
        Ok(None)
    }
}

async fn run_spec(
    mut config: Config,
    spec: &Path,
    name: Option<String>,
    workers: Option<usize>,
    directory: bool,
) -> Result<bool> {
    if let Some(workers) = workers {
        config.max_parallel_workers = workers;
    }
    if directory {
        config.isolation = IsolationMode::Directory;
    }
    let graph = WorkGraph::load(spec)?;
    graph.validate()?;
    let name = name.unwrap_or_else(|| {
        spec.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "run".to_string())
    });

    let registry = open_registry(&config, true)?;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = registry.launch(&name, graph, Some(tx)).await?;
    println!("Run {} registered", handle.run_id);
    tlog!("CLI run {} from {}", handle.run_id, spec.display());

    let printer = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            print_event(&event);
        }
    });

    let run_id = handle.run_id.clone();
    let wait = handle.wait();
    tokio::pin!(wait);
    let result = tokio::select! {
        result = &mut wait => result,
        _ = tokio::signal::ctrl_c() => {
            println!("Interrupted; stopping run {} (Ctrl-C again to force)", run_id);
            registry.stop(&run_id).await?;
            tokio::select! {
                result = &mut wait => result,
                _ = tokio::signal::ctrl_c() => Err(Error::Cancelled),
            }
        }
    };
    if result.is_ok() {
        let _ = printer.await;
    } else {
        printer.abort();
    }

    let report = result?;
    println!();
    print!("{}", report);
    Ok(report.is_success())
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::UnitStarted { unit, attempt, .. } => println!("  > {} (attempt {})", unit, attempt),
        RunEvent::UnitCompleted { unit, .. } => println!("  + {}", unit),
        RunEvent::UnitFailed {
            unit,
            reason,
            will_retry,
            ..
        } => println!(
            "  x {}: {}{}",
            unit,
            reason,
            if *will_retry { " (retrying)" } else { "" }
        ),
        RunEvent::UnitBlocked { unit, reason } => println!("  - {}: {}", unit, reason),
        RunEvent::UnitCancelled { unit } => println!("  ~ {} cancelled", unit),
        RunEvent::Progress(counters) => tlog!("Progress: {}", counters),
        RunEvent::RunFinished { status, .. } => println!("Run finished: {}", status),
    }
}

fn print_entry(entry: &RunRegistryEntry) {
    println!(
        "  {:<24} {:<10} {:<28} {}",
        entry.run_id,
        entry.status.to_string(),
        entry.branch.as_deref().unwrap_or("-"),
        entry.counters
    );
}

async fn run_status(config: Config, run_id: &str) -> Result<bool> {
    let registry = open_registry(&config, false)?;
    let entry = registry.status(run_id).await?;
    print_entry(&entry);
    if entry.stop_requested {
        println!("  stop requested");
    }

    let settings = registry.settings();
    let path = settings.run_dir(&entry.run_id).join("state.json");
    if !path.exists() {
        return Ok(true);
    }
    let locks: Arc<dyn LockManager> =
        Arc::new(FileLockManager::new(&settings.lock_dir(), settings.lock_stale_after)?);
    let store: Arc<StateStore<RunState>> =
        Arc::new(StateStore::new(&path, locks, settings.lock_timeout)?);
    let state = store.snapshot().await?;
    println!();
    for (id, record) in &state.units {
        println!(
            "  {:<24} {:<24} attempts={} tokens={}",
            id.as_str(),
            record.status.to_string(),
            record.attempts,
            record.tokens_used
        );
    }
    Ok(true)
}

async fn run_list(config: Config) -> Result<bool> {
    let registry = open_registry(&config, false)?;
    let active = registry.list().await?;
    println!("Active runs: {}", active.len());
    for entry in &active {
        print_entry(entry);
    }
    let archived = registry.archived().await?;
    if !archived.is_empty() {
        println!();
        println!("Recently finished:");
        for entry in archived.iter().rev().take(10) {
            print_entry(entry);
        }
    }
    Ok(true)
}

async fn run_stop(config: Config, run_id: &str) -> Result<bool> {
    let registry = open_registry(&config, false)?;
    registry.stop(run_id).await?;
    println!("Stop requested for {}", run_id);
    Ok(true)
}

async fn run_cleanup(config: Config) -> Result<bool> {
    let registry = open_registry(&config, false)?;
    let reaped = registry.reap_orphans().await?;
    println!("Reaped runs: {}", reaped.len());
    for id in &reaped {
        println!("  {}", id);
    }

    let settings = registry.settings().clone();
    let known: HashSet<PathBuf> = registry
        .list()
        .await?
        .into_iter()
        .map(|e| e.workspace)
        .collect();
    let workspaces = WorkspaceManager::directories(&settings.workspace_dir)?;
    let mut report = tandem::util::blocking(move || workspaces.cleanup_orphans(&known)).await?;
    if let Some(git) = repository(&settings)? {
        report.pruned_worktrees += tandem::util::blocking(move || git.prune_worktrees()).await?;
    }
    println!("Removed workspaces: {}", report.removed.len());
    for path in &report.removed {
        println!("  {}", path.display());
    }
    for (path, reason) in &report.failed {
        println!("  failed: {} ({})", path.display(), reason);
    }
    if report.pruned_worktrees > 0 {
        println!("Pruned worktree entries: {}", report.pruned_worktrees);
    }

    let locks = FileLockManager::new(&settings.lock_dir(), settings.lock_stale_after)?;
    let stale: Vec<_> = locks
        .list()?
        .into_iter()
        .filter(|record| record.is_stale())
        .collect();
    println!("Stale locks (reclaimed on next acquire): {}", stale.len());
    for record in &stale {
        println!("  {} held by {}", record.name, record.holder);
    }

    if !report.is_success() {
        return Err(Error::Validation(format!(
            "{} workspaces could not be removed",
            report.failed.len()
        )));
    }
    Ok(true)
}
