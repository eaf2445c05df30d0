//! Several runs at once.
//!
//! The registry hands every run its own name, branch and workspace root,
//! keeps a persisted record of all active runs in `registry.json`, and
//! enforces the machine-wide ceiling on runs executing at the same time.
//! Runs over the ceiling are queued, not rejected.
//!
//! Stopping a run owned by another process sets `stop_requested` in the
//! record; the owner notices through a file watcher on the state
//! directory (with a slow poll as backstop) and cancels its coordinator.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use notify::{Config as WatchConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::coordinator::{Coordinator, RunEvent, RunReport};
use super::executor::Executor;
use super::rate_limit::{BucketState, RateLimiter};
use super::workspace::WorkspaceManager;
use crate::config::{IsolationMode, RunSettings};
use crate::core::WorkGraph;
use crate::git::GitOps;
use crate::lock::LockManager;
use crate::state::{RunCounters, RunStatus, StateStore};
use crate::util::{blocking, blocking_with_timeout, is_process_alive, sanitize_name};
use crate::{tlog, tlog_debug, tlog_warn, Error, Result};

/// Finished runs kept in the record for `status` queries.
const ARCHIVE_LIMIT: usize = 100;

/// Backstop interval when no file event arrives.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistryStatus {
    /// Waiting for an active-run slot.
    Queued,
    Running,
    Completed,
    Failed,
    Cancelled,
    Stuck,
}

impl RegistryStatus {
    pub fn is_active(self) -> bool {
        matches!(self, RegistryStatus::Queued | RegistryStatus::Running)
    }
}

impl From<RunStatus> for RegistryStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Pending => RegistryStatus::Queued,
            RunStatus::Running => RegistryStatus::Running,
            RunStatus::Completed => RegistryStatus::Completed,
            RunStatus::Failed => RegistryStatus::Failed,
            RunStatus::Cancelled => RegistryStatus::Cancelled,
            RunStatus::Stuck => RegistryStatus::Stuck,
        }
    }
}

impl std::fmt::Display for RegistryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RegistryStatus::Queued => "queued",
            RegistryStatus::Running => "running",
            RegistryStatus::Completed => "completed",
            RegistryStatus::Failed => "failed",
            RegistryStatus::Cancelled => "cancelled",
            RegistryStatus::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

/// One top-level run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRegistryEntry {
    /// Unique name after collision renaming.
    pub run_id: String,
    /// The id the caller asked for.
    pub requested_id: String,
    /// Run branch, in worktree mode.
    pub branch: Option<String>,
    /// Root holding this run's worker workspaces.
    pub workspace: PathBuf,
    pub status: RegistryStatus,
    #[serde(default)]
    pub counters: RunCounters,
    pub owner_pid: u32,
    #[serde(default)]
    pub stop_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl RunRegistryEntry {
    /// The owning process is gone but the entry still claims to be active.
    pub fn is_orphaned(&self) -> bool {
        self.status.is_active() && !is_process_alive(self.owner_pid)
    }
}

/// The persisted registry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryRecord {
    #[serde(default)]
    pub active: BTreeMap<String, RunRegistryEntry>,
    /// Most recent last.
    #[serde(default)]
    pub archived: Vec<RunRegistryEntry>,
}

impl RegistryRecord {
    fn running_elsewhere(&self, run_id: &str) -> usize {
        self.active
            .values()
            .filter(|e| e.run_id != run_id && e.status == RegistryStatus::Running)
            .filter(|e| is_process_alive(e.owner_pid))
            .count()
    }

    fn archive(&mut self, run_id: &str) -> Option<RunRegistryEntry> {
        let entry = self.active.remove(run_id)?;
        self.archived.push(entry.clone());
        if self.archived.len() > ARCHIVE_LIMIT {
            let excess = self.archived.len() - ARCHIVE_LIMIT;
            self.archived.drain(..excess);
        }
        Some(entry)
    }
}

enum SlotClaim {
    Claimed,
    Wait,
    Stopped,
}

/// A launched run.
pub struct RunHandle {
    pub run_id: String,
    cancel: CancellationToken,
    task: JoinHandle<Result<RunReport>>,
}

impl RunHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<RunReport> {
        self.task
            .await
            .map_err(|e| Error::TaskJoin(e.to_string()))?
    }
}

pub struct Registry {
    settings: RunSettings,
    store: Arc<StateStore<RegistryRecord>>,
    locks: Arc<dyn LockManager>,
    executor: Arc<dyn Executor>,
    git: Option<GitOps>,
    rate_limiter: Arc<RateLimiter>,
    /// Cancel tokens of runs owned by this process.
    local: Mutex<HashMap<String, CancellationToken>>,
    changes: Arc<Notify>,
    watcher: Mutex<Option<RecommendedWatcher>>,
}

impl Registry {
    /// Open the registry under `settings.state_dir`.
    ///
    /// `git` is the repository run branches are cut from; without it every
    /// run uses plain directories regardless of the isolation setting.
    pub fn open(
        settings: RunSettings,
        locks: Arc<dyn LockManager>,
        executor: Arc<dyn Executor>,
        git: Option<GitOps>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&settings.state_dir)?;
        std::fs::create_dir_all(&settings.workspace_dir)?;
        let store = Arc::new(StateStore::new(
            &settings.registry_path(),
            Arc::clone(&locks),
            settings.lock_timeout,
        )?);
        let bucket: Arc<StateStore<BucketState>> = Arc::new(StateStore::new(
            &settings.rate_limit_path(),
            Arc::clone(&locks),
            settings.lock_timeout,
        )?);
        let rate_limiter = Arc::new(RateLimiter::new(bucket, &settings.rate_limit));

        let registry = Self {
            settings,
            store,
            locks,
            executor,
            git,
            rate_limiter,
            local: Mutex::new(HashMap::new()),
            changes: Arc::new(Notify::new()),
            watcher: Mutex::new(None),
        };
        match registry.watch() {
            Ok(watcher) => {
                if let Ok(mut slot) = registry.watcher.lock() {
                    *slot = Some(watcher);
                }
            }
            Err(e) => tlog_warn!("Registry watcher unavailable, polling instead: {}", e),
        }
        Ok(registry)
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Watch the state directory for registry rewrites.
    fn watch(&self) -> Result<RecommendedWatcher> {
        let (tx, rx) = crossbeam_channel::bounded::<()>(1);
        let file_name = self
            .settings
            .registry_path()
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let Ok(event) = res else {
                    return;
                };
                if !matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_)) {
                    return;
                }
                if event.paths.iter().any(|p| p.file_name() == Some(file_name.as_os_str())) {
                    // A full channel already carries a pending wakeup.
                    let _ = tx.try_send(());
                }
            },
            WatchConfig::default(),
        )?;
        watcher.watch(&self.settings.state_dir, RecursiveMode::NonRecursive)?;

        // Bridge into tokio; ends once the watcher (and its sender) is dropped.
        let changes = Arc::clone(&self.changes);
        std::thread::spawn(move || {
            while rx.recv().is_ok() {
                changes.notify_waiters();
            }
        });
        tlog_debug!("Watching {}", self.settings.state_dir.display());
        Ok(watcher)
    }

    /// Sleep until the registry file changes or the poll interval passes.
    async fn wait_for_change(&self) {
        tokio::select! {
            _ = self.changes.notified() => {}
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }

    fn use_worktrees(&self) -> bool {
        self.settings.isolation == IsolationMode::Worktree && self.git.is_some()
    }

    /// Register a run under a unique name and allocate its branch and
    /// workspace root. The run starts out queued.
    ///
    /// A taken name (existing branch, registry entry or directory) gets a
    /// `-2`, `-3`, ... suffix.
    pub async fn create(&self, run_id: &str) -> Result<RunRegistryEntry> {
        let requested = run_id.to_string();
        let base = sanitize_name(run_id);
        let workspace_dir = self.settings.workspace_dir.clone();
        let runs_dir = self.settings.runs_dir();
        let git = if self.use_worktrees() { self.git.clone() } else { None };

        let entry = self
            .store
            .update(move |record| -> Result<RunRegistryEntry> {
                let mut n = 1u32;
                let name = loop {
                    let candidate = if n == 1 { base.clone() } else { format!("{}-{}", base, n) };
                    let taken = record.active.contains_key(&candidate)
                        || workspace_dir.join(&candidate).exists()
                        || runs_dir.join(&candidate).exists()
                        || match &git {
                            Some(git) => git.branch_exists(&format!("tandem/{}", candidate))?,
                            None => false,
                        };
                    if !taken {
                        break candidate;
                    }
                    n += 1;
                };

                let branch = match &git {
                    Some(git) => {
                        let branch = format!("tandem/{}", name);
                        git.create_branch(&branch, None)?;
                        Some(branch)
                    }
                    None => None,
                };
                let workspace = workspace_dir.join(&name);
                std::fs::create_dir_all(&workspace)?;

                let now = Utc::now();
                let entry = RunRegistryEntry {
                    run_id: name.clone(),
                    requested_id: requested,
                    branch,
                    workspace,
                    status: RegistryStatus::Queued,
                    counters: RunCounters::default(),
                    owner_pid: std::process::id(),
                    stop_requested: false,
                    created_at: now,
                    updated_at: now,
                    started_at: None,
                    finished_at: None,
                };
                record.active.insert(name, entry.clone());
                Ok(entry)
            })
            .await??;

        if entry.run_id != sanitize_name(&entry.requested_id) {
            tlog!("Run name '{}' taken; using '{}'", entry.requested_id, entry.run_id);
        }
        tlog!(
            "Registered run {} ({})",
            entry.run_id,
            entry.branch.as_deref().unwrap_or("directory workspace")
        );
        Ok(entry)
    }

    /// Create a run and start it in the background.
    pub async fn launch(
        self: &Arc<Self>,
        run_id: &str,
        graph: WorkGraph,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Result<RunHandle> {
        graph.validate()?;
        let entry = self.create(run_id).await?;
        self.start(entry, graph, events)
    }

    /// Start a created run. It waits for an active-run slot first.
    pub fn start(
        self: &Arc<Self>,
        entry: RunRegistryEntry,
        graph: WorkGraph,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> Result<RunHandle> {
        let cancel = CancellationToken::new();
        if let Ok(mut local) = self.local.lock() {
            local.insert(entry.run_id.clone(), cancel.clone());
        }
        let run_id = entry.run_id.clone();
        let registry = Arc::clone(self);
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            let result = registry.drive(&entry, graph, events, token).await;
            registry.finish(&entry, &result).await;
            result
        });
        Ok(RunHandle { run_id, cancel, task })
    }

    async fn drive(
        &self,
        entry: &RunRegistryEntry,
        graph: WorkGraph,
        events: Option<mpsc::UnboundedSender<RunEvent>>,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        if !self.wait_for_slot(&entry.run_id, &cancel).await? {
            return Err(Error::Cancelled);
        }

        let workspaces = match (&entry.branch, &self.git) {
            (Some(branch), Some(git)) if self.use_worktrees() => {
                WorkspaceManager::worktrees(&entry.workspace, git.clone(), branch)?
            }
            _ => WorkspaceManager::directories(&entry.workspace)?,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let progress = self.track_progress(&entry.run_id, rx, events);
        let coordinator = Coordinator::new(
            &entry.run_id,
            graph,
            self.settings.clone(),
            Arc::clone(&self.executor),
            workspaces,
            Arc::clone(&self.locks),
        )
        .with_rate_limiter(Arc::clone(&self.rate_limiter))
        .with_events(tx)
        .with_cancel(cancel.clone());

        let run = coordinator.run();
        tokio::pin!(run);
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = self.wait_for_change(), if !cancel.is_cancelled() => {
                    self.forward_stop(&entry.run_id, &cancel).await;
                }
            }
        };
        // The coordinator dropped its sender; the tracker drains and exits.
        if let Err(e) = progress.await {
            tlog_warn!("Progress tracker for {} ended abnormally: {}", entry.run_id, e);
        }
        result
    }

    /// Take an active-run slot, waiting while the ceiling is reached.
    ///
    /// Returns `false` if the run was stopped while queued.
    async fn wait_for_slot(&self, run_id: &str, cancel: &CancellationToken) -> Result<bool> {
        let max = self.settings.max_active_runs;
        let mut announced = false;
        loop {
            let id = run_id.to_string();
            let claim = self
                .store
                .update(move |record| {
                    let running = record.running_elsewhere(&id);
                    let Some(entry) = record.active.get_mut(&id) else {
                        return SlotClaim::Stopped;
                    };
                    if entry.stop_requested {
                        return SlotClaim::Stopped;
                    }
                    if running >= max {
                        return SlotClaim::Wait;
                    }
                    let now = Utc::now();
                    entry.status = RegistryStatus::Running;
                    entry.started_at = Some(now);
                    entry.updated_at = now;
                    SlotClaim::Claimed
                })
                .await?;
            match claim {
                SlotClaim::Claimed => {
                    tlog!("Run {} started", run_id);
                    return Ok(true);
                }
                SlotClaim::Stopped => return Ok(false),
                SlotClaim::Wait => {
                    if !announced {
                        tlog!("Run {} queued: {} runs already active", run_id, max);
                        announced = true;
                    }
                }
            }
            tokio::select! {
                _ = self.wait_for_change() => {}
                _ = cancel.cancelled() => return Ok(false),
            }
        }
    }

    /// Cancel the run if another process asked for it to stop.
    async fn forward_stop(&self, run_id: &str, cancel: &CancellationToken) {
        let requested = match self.store.snapshot().await {
            Ok(record) => record
                .active
                .get(run_id)
                .map(|e| e.stop_requested)
                .unwrap_or(false),
            Err(e) => {
                tlog_warn!("Could not read registry while watching {}: {}", run_id, e);
                false
            }
        };
        if requested {
            tlog!("Stop requested for run {}; cancelling", run_id);
            cancel.cancel();
        }
    }

    /// Fold coordinator progress into the registry and forward events.
    fn track_progress(
        &self,
        run_id: &str,
        mut rx: mpsc::UnboundedReceiver<RunEvent>,
        forward: Option<mpsc::UnboundedSender<RunEvent>>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let run_id = run_id.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if let RunEvent::Progress(counters) = &event {
                    let id = run_id.clone();
                    let counters = *counters;
                    let updated = store
                        .update(move |record| {
                            if let Some(entry) = record.active.get_mut(&id) {
                                entry.counters = counters;
                                entry.updated_at = Utc::now();
                            }
                        })
                        .await;
                    if let Err(e) = updated {
                        tlog_warn!("Registry progress update for {} failed: {}", run_id, e);
                    }
                }
                if let Some(tx) = &forward {
                    let _ = tx.send(event);
                }
            }
        })
    }

    /// Archive the entry and drop the run's workspace root.
    async fn finish(&self, entry: &RunRegistryEntry, result: &Result<RunReport>) {
        let status = match result {
            Ok(report) => RegistryStatus::from(report.status),
            Err(Error::Cancelled) => RegistryStatus::Cancelled,
            Err(Error::Stuck { .. }) => RegistryStatus::Stuck,
            Err(_) => RegistryStatus::Failed,
        };
        let counters = result.as_ref().ok().map(|r| r.counters);
        let id = entry.run_id.clone();
        let archived = self
            .store
            .update(move |record| {
                if let Some(e) = record.active.get_mut(&id) {
                    let now = Utc::now();
                    e.status = status;
                    e.finished_at = Some(now);
                    e.updated_at = now;
                    if let Some(counters) = counters {
                        e.counters = counters;
                    }
                }
                record.archive(&id)
            })
            .await;
        if let Err(e) = archived {
            tlog_warn!("Could not archive run {}: {}", entry.run_id, e);
        }

        let root = entry.workspace.clone();
        let git = if self.use_worktrees() { self.git.clone() } else { None };
        let removed = blocking_with_timeout(Duration::from_secs(60), move || {
            remove_workspace_root(&root, git.as_ref())
        })
        .await;
        if let Err(e) = removed {
            tlog_warn!("Could not remove workspace root {}: {}", entry.workspace.display(), e);
        }
        if let Ok(mut local) = self.local.lock() {
            local.remove(&entry.run_id);
        }
        tlog!("Run {} ended: {}", entry.run_id, status);
    }

    /// Active runs, oldest first.
    pub async fn list(&self) -> Result<Vec<RunRegistryEntry>> {
        let record = self.store.snapshot().await?;
        let mut entries: Vec<RunRegistryEntry> = record.active.into_values().collect();
        entries.sort_by_key(|e| e.created_at);
        Ok(entries)
    }

    /// Recently finished runs, most recent last.
    pub async fn archived(&self) -> Result<Vec<RunRegistryEntry>> {
        Ok(self.store.snapshot().await?.archived)
    }

    /// An active run, or the latest archived run of that name.
    pub async fn status(&self, run_id: &str) -> Result<RunRegistryEntry> {
        let record = self.store.snapshot().await?;
        if let Some(entry) = record.active.get(run_id) {
            return Ok(entry.clone());
        }
        record
            .archived
            .iter()
            .rev()
            .find(|e| e.run_id == run_id)
            .cloned()
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))
    }

    /// Stop a run. Runs owned here are cancelled directly; runs owned by
    /// another process get `stop_requested`, which their owner forwards.
    pub async fn stop(&self, run_id: &str) -> Result<()> {
        let local = self
            .local
            .lock()
            .ok()
            .and_then(|local| local.get(run_id).cloned());

        let id = run_id.to_string();
        let found = self
            .store
            .update(move |record| {
                let Some(entry) = record.active.get_mut(&id) else {
                    return false;
                };
                entry.stop_requested = true;
                entry.updated_at = Utc::now();
                // Nobody is left to honour the request.
                let orphaned = entry.is_orphaned();
                if orphaned {
                    entry.status = RegistryStatus::Cancelled;
                    entry.finished_at = Some(Utc::now());
                    record.archive(&id);
                }
                true
            })
            .await?;

        match (local, found) {
            (Some(token), _) => {
                tlog!("Stopping run {}", run_id);
                token.cancel();
                Ok(())
            }
            (None, true) => {
                tlog!("Stop requested for run {}", run_id);
                Ok(())
            }
            (None, false) => Err(Error::RunNotFound(run_id.to_string())),
        }
    }

    /// Archive entries whose owner process died, and remove their
    /// workspace roots. Returns the archived run ids.
    pub async fn reap_orphans(&self) -> Result<Vec<String>> {
        let reaped = self
            .store
            .update(|record| {
                let orphaned: Vec<String> = record
                    .active
                    .values()
                    .filter(|e| e.is_orphaned())
                    .map(|e| e.run_id.clone())
                    .collect();
                let mut reaped = Vec::new();
                for id in orphaned {
                    if let Some(e) = record.active.get_mut(&id) {
                        e.status = RegistryStatus::Failed;
                        e.finished_at = Some(Utc::now());
                    }
                    if let Some(entry) = record.archive(&id) {
                        reaped.push(entry);
                    }
                }
                reaped
            })
            .await?;

        let removals = reaped.into_iter().map(|entry| {
            let git = self.git.clone();
            async move {
                tlog_warn!("Reaped run {} (owner pid {} is gone)", entry.run_id, entry.owner_pid);
                let root = entry.workspace.clone();
                let removed = blocking(move || remove_workspace_root(&root, git.as_ref())).await;
                if let Err(e) = removed {
                    tlog_warn!("Could not remove {}: {}", entry.workspace.display(), e);
                }
                entry.run_id
            }
        });
        let ids = join_all(removals).await;
        Ok(ids)
    }
}

fn remove_workspace_root(root: &Path, git: Option<&GitOps>) -> Result<()> {
    if root.exists() {
        std::fs::remove_dir_all(root)?;
    }
    if let Some(git) = git {
        git.prune_worktrees()?;
    }
    Ok(())
}
