//! Running a single unit in isolation.
//!
//! A [`WorkerHandle`] is the ephemeral record of one attempt. It moves
//! strictly forward: `pending -> running -> completed | failed | timed_out`.
//! A retry is a new handle with the next attempt number; nothing is ever
//! reset in place.
//!
//! The [`WorkerRunner`] allocates the workspace, invokes the executor, folds
//! successful work into the run branch, writes the result record exactly
//! once, and releases the workspace. It never touches shared run state.

use std::fs::OpenOptions;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::{EndReason, Executor, ExecutorOutcome, InvokeControl};
use super::workspace::{Workspace, WorkspaceManager};
use crate::core::{UnitId, WorkUnit};
use crate::git::MergeOutcome;
use crate::util::{blocking, signal_process_group, StopSignal};
use crate::{tlog, tlog_debug, tlog_warn, Error, Result};

/// How long past its own deadline an executor may run before it is abandoned.
pub const KILL_SLACK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(Uuid);

impl WorkerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for WorkerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Pending,
    Running,
    Completed,
    Failed,
    TimedOut,
}

impl WorkerState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkerState::Completed | WorkerState::Failed | WorkerState::TimedOut
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Pending => "pending",
            WorkerState::Running => "running",
            WorkerState::Completed => "completed",
            WorkerState::Failed => "failed",
            WorkerState::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Ephemeral execution record for one attempt of one unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerHandle {
    pub id: WorkerId,
    pub unit: UnitId,
    pub attempt: u32,
    /// Pid of the executor process (its process group id).
    pub pid: Option<u32>,
    pub workspace: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    state: WorkerState,
}

impl WorkerHandle {
    pub fn new(unit: UnitId, attempt: u32) -> Self {
        Self {
            id: WorkerId::new(),
            unit,
            attempt,
            pid: None,
            workspace: None,
            started_at: None,
            finished_at: None,
            state: WorkerState::Pending,
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state
    }

    pub fn can_transition(&self, target: WorkerState) -> bool {
        matches!(
            (self.state, target),
            (WorkerState::Pending, WorkerState::Running)
                | (WorkerState::Pending, WorkerState::Failed)
                | (WorkerState::Running, WorkerState::Completed)
                | (WorkerState::Running, WorkerState::Failed)
                | (WorkerState::Running, WorkerState::TimedOut)
        )
    }

    pub fn transition(&mut self, target: WorkerState) -> Result<()> {
        if !self.can_transition(target) {
            return Err(Error::InvalidTransition {
                from: self.state.to_string(),
                to: target.to_string(),
            });
        }
        self.state = target;
        match target {
            WorkerState::Running => self.started_at = Some(Utc::now()),
            _ if target.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    pub fn start(&mut self, workspace: &Path) -> Result<()> {
        self.transition(WorkerState::Running)?;
        self.workspace = Some(workspace.to_path_buf());
        Ok(())
    }

    /// The handle for the next attempt of the same unit.
    pub fn retry(&self) -> Self {
        Self::new(self.unit.clone(), self.attempt + 1)
    }
}

/// The result record a worker writes once.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerResult {
    pub worker_id: WorkerId,
    pub unit: UnitId,
    pub attempt: u32,
    pub state: WorkerState,
    pub pid: Option<u32>,
    pub workspace: Option<PathBuf>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: ExecutorOutcome,
    /// Commit the run branch moved to, if the work was integrated.
    pub integrated_commit: Option<String>,
}

impl WorkerResult {
    pub fn succeeded(&self) -> bool {
        self.state == WorkerState::Completed
    }

    pub fn was_cancelled(&self) -> bool {
        self.outcome.ended == EndReason::Cancelled
    }

    /// Human-readable failure reason.
    pub fn reason(&self) -> String {
        match self.state {
            WorkerState::Completed => "completed".to_string(),
            _ => self
                .outcome
                .error
                .clone()
                .unwrap_or_else(|| self.state.to_string()),
        }
    }

    /// Write the record to `path`; refuses to overwrite.
    pub fn write_once(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        file.write_all(&serde_json::to_vec_pretty(self)?)?;
        file.sync_all()?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(serde_json::from_str(&std::fs::read_to_string(path)?)?)
    }
}

/// Render the executor prompt for a unit.
pub fn render_prompt(unit: &WorkUnit, completed_dependencies: &[&WorkUnit]) -> String {
    let mut prompt = format!("Implement work unit {}: {}\n", unit.id, unit.title);
    if !unit.description.trim().is_empty() {
        prompt.push('\n');
        prompt.push_str(unit.description.trim());
        prompt.push('\n');
    }
    if !completed_dependencies.is_empty() {
        prompt.push_str("\nAlready completed and available in this workspace:\n");
        for dep in completed_dependencies {
            prompt.push_str(&format!("- {}: {}\n", dep.id, dep.title));
        }
    }
    if !unit.file_scope.is_empty() {
        prompt.push_str("\nLimit changes to these paths:\n");
        for path in &unit.file_scope {
            prompt.push_str(&format!("- {}\n", path.display()));
        }
    }
    prompt
}

/// Await an invocation, abandoning it once it overstays its timeout or
/// ignores cancellation past the grace period.
///
/// Executors are expected to honour both themselves; this bounds the ones
/// that do not. An abandoned invocation has its process group killed.
async fn bounded<F>(invocation: F, control: &InvokeControl, timeout: Duration) -> Result<ExecutorOutcome>
where
    F: Future<Output = Result<ExecutorOutcome>>,
{
    tokio::pin!(invocation);
    let hard_limit = timeout + control.grace_period + KILL_SLACK;
    let ended = tokio::select! {
        result = &mut invocation => return result,
        _ = tokio::time::sleep(hard_limit) => EndReason::TimedOut,
        _ = control.cancel.cancelled() => {
            match tokio::time::timeout(control.grace_period + KILL_SLACK, &mut invocation).await {
                Ok(result) => return result,
                Err(_) => EndReason::Cancelled,
            }
        }
    };

    tlog_warn!("Executor did not stop on its own ({:?}); abandoning it", ended);
    if let Some(pid) = control.spawned_pid() {
        signal_process_group(pid, StopSignal::Kill);
    }
    let error = match ended {
        EndReason::TimedOut => Error::WorkerTimeout(timeout).to_string(),
        _ => Error::Cancelled.to_string(),
    };
    let mut outcome = ExecutorOutcome::failed(error);
    outcome.ended = ended;
    Ok(outcome)
}

/// Everything a worker needs from its run, shared by all workers.
#[derive(Clone)]
pub struct RunContext {
    pub run_id: String,
    /// Holds `results/` and `logs/`.
    pub run_dir: PathBuf,
    pub workspaces: WorkspaceManager,
    pub executor: Arc<dyn Executor>,
    pub worker_timeout: Duration,
    pub grace_period: Duration,
}

impl RunContext {
    pub fn result_path(&self, unit: &UnitId, attempt: u32) -> PathBuf {
        self.run_dir
            .join("results")
            .join(format!("{}-{}.json", unit.file_stem(), attempt))
    }

    pub fn log_path(&self, unit: &UnitId, attempt: u32) -> PathBuf {
        self.run_dir
            .join("logs")
            .join(format!("{}-{}.log", unit.file_stem(), attempt))
    }
}

pub struct WorkerRunner {
    ctx: RunContext,
}

impl WorkerRunner {
    pub fn new(ctx: RunContext) -> Self {
        Self { ctx }
    }

    /// Execute one attempt and return its written result.
    ///
    /// `Err` only for failures to record the result; executor and workspace
    /// problems are reported as a failed result.
    pub async fn run(
        &self,
        mut handle: WorkerHandle,
        unit: WorkUnit,
        prompt: String,
        cancel: CancellationToken,
    ) -> Result<WorkerResult> {
        let ctx = &self.ctx;
        let log_path = ctx.log_path(&unit.id, handle.attempt);
        if let Some(parent) = log_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let workspace = {
            let workspaces = ctx.workspaces.clone();
            let id = unit.id.clone();
            let attempt = handle.attempt;
            blocking(move || workspaces.allocate(&id, attempt)).await
        };
        let workspace = match workspace {
            Ok(ws) => ws,
            Err(e) => {
                tlog_warn!("Workspace allocation failed for {}: {}", unit.id, e);
                handle.transition(WorkerState::Failed)?;
                let outcome = ExecutorOutcome::failed(format!("workspace allocation failed: {}", e));
                return self.finish(handle, outcome, None).await;
            }
        };
        handle.start(&workspace.path)?;
        tlog!(
            "Worker {} started {} attempt {} in {}",
            handle.id.short(),
            unit.id,
            handle.attempt,
            workspace.path.display()
        );

        let control = InvokeControl {
            cancel,
            grace_period: ctx.grace_period,
            log_path: Some(log_path),
            ..Default::default()
        };
        let invocation = ctx
            .executor
            .invoke(&prompt, &workspace.path, ctx.worker_timeout, &control);
        let invoked = bounded(invocation, &control, ctx.worker_timeout).await;
        handle.pid = control.spawned_pid();

        let mut outcome = match invoked {
            Ok(outcome) => outcome,
            Err(e) => ExecutorOutcome::failed(e.to_string()),
        };

        let mut integrated = None;
        if outcome.success {
            match self.integrate(&workspace, &unit).await {
                Ok(MergeOutcome::Merged(commit)) => integrated = Some(commit),
                Ok(MergeOutcome::UpToDate) => {}
                Ok(MergeOutcome::Conflicts(files)) => {
                    outcome.success = false;
                    outcome.error = Some(format!("merge conflict in {}", files.join(", ")));
                }
                Err(e) => {
                    outcome.success = false;
                    outcome.error = Some(format!("integration failed: {}", e));
                }
            }
        }

        let target = if outcome.success {
            WorkerState::Completed
        } else if outcome.timed_out() {
            WorkerState::TimedOut
        } else {
            WorkerState::Failed
        };
        handle.transition(target)?;

        self.release(&workspace).await;
        self.finish(handle, outcome, integrated).await
    }

    async fn integrate(&self, workspace: &Workspace, unit: &WorkUnit) -> Result<MergeOutcome> {
        let workspaces = self.ctx.workspaces.clone();
        let workspace = workspace.clone();
        let message = format!("{}: {}", unit.id, unit.title);
        blocking(move || workspaces.integrate(&workspace, &message)).await
    }

    async fn release(&self, workspace: &Workspace) {
        let workspaces = self.ctx.workspaces.clone();
        let ws = workspace.clone();
        if let Err(e) = blocking(move || workspaces.release(&ws)).await {
            tlog_warn!("Failed to release workspace {}: {}", workspace.path.display(), e);
        }
    }

    async fn finish(
        &self,
        handle: WorkerHandle,
        outcome: ExecutorOutcome,
        integrated_commit: Option<String>,
    ) -> Result<WorkerResult> {
        let result = WorkerResult {
            worker_id: handle.id,
            unit: handle.unit.clone(),
            attempt: handle.attempt,
            state: handle.state(),
            pid: handle.pid,
            workspace: handle.workspace.clone(),
            started_at: handle.started_at,
            finished_at: handle.finished_at,
            outcome,
            integrated_commit,
        };
        let path = self.ctx.result_path(&handle.unit, handle.attempt);
        let record = result.clone();
        blocking(move || record.write_once(&path)).await?;
        tlog_debug!(
            "Worker {} finished {} attempt {}: {}",
            handle.id.short(),
            handle.unit,
            handle.attempt,
            result.state
        );
        Ok(result)
    }
}
