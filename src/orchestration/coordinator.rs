//! Drives one run end to end.
//!
//! The coordinator owns the [`WorkGraph`] and every [`WorkerHandle`] of its
//! run. It validates the graph before anything is spawned, admits ready
//! units unit by unit (no batch barrier) up to the concurrency ceiling and
//! the global rate limit, and folds every worker result into the run's
//! [`StateStore`] before acting on it. A unit is only released to its
//! dependents after its completion is durable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::executor::Executor;
use super::pool::{WorkerEvent, WorkerPool};
use super::rate_limit::RateLimiter;
use super::worker::{
    render_prompt, RunContext, WorkerHandle, WorkerId, WorkerResult, WorkerRunner, KILL_SLACK,
};
use super::workspace::WorkspaceManager;
use crate::config::RunSettings;
use crate::core::{ExecutionPlan, PendingUnit, ReadyQueue, UnitId, WorkGraph, WorkUnit};
use crate::lock::LockManager;
use crate::state::{RunCounters, RunState, RunStatus, StateStore};
use crate::{tlog, tlog_debug, tlog_error, tlog_warn, Error, Result};

/// Attempts at persisting a fold before the run is aborted.
const PERSIST_ATTEMPTS: u32 = 3;

/// Consecutive admission passes that may start nothing while ready work
/// waits and no worker runs.
const ADMIT_ATTEMPTS: u32 = 10;

/// Lifecycle notifications for observers of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    UnitStarted {
        unit: UnitId,
        attempt: u32,
        worker_id: WorkerId,
    },
    UnitCompleted {
        unit: UnitId,
        tokens_used: u64,
    },
    UnitFailed {
        unit: UnitId,
        attempt: u32,
        reason: String,
        /// Another attempt has been queued.
        will_retry: bool,
    },
    UnitBlocked {
        unit: UnitId,
        reason: String,
    },
    UnitCancelled {
        unit: UnitId,
    },
    /// Counters after a result was folded into the run state.
    Progress(RunCounters),
    RunFinished {
        status: RunStatus,
        counters: RunCounters,
    },
}

/// What a finished run did, unit by unit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub status: RunStatus,
    pub completed: Vec<UnitId>,
    pub failed: Vec<(UnitId, String)>,
    pub blocked: Vec<(UnitId, String)>,
    pub cancelled: Vec<UnitId>,
    /// Units that could make no progress, with what they wait on.
    pub stuck: Vec<PendingUnit>,
    pub counters: RunCounters,
    pub warnings: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    pub fn duration(&self) -> Duration {
        (self.finished_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }
}

impl std::fmt::Display for RunReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(
            f,
            "Run {}: {} in {:.1}s ({})",
            self.run_id,
            self.status,
            self.duration().as_secs_f64(),
            self.counters
        )?;
        if !self.completed.is_empty() {
            let ids: Vec<&str> = self.completed.iter().map(|id| id.as_str()).collect();
            writeln!(f, "  completed: {}", ids.join(", "))?;
        }
        for (id, reason) in &self.failed {
            writeln!(f, "  failed:    {} ({})", id, reason)?;
        }
        for (id, reason) in &self.blocked {
            writeln!(f, "  blocked:   {} ({})", id, reason)?;
        }
        if !self.cancelled.is_empty() {
            let ids: Vec<&str> = self.cancelled.iter().map(|id| id.as_str()).collect();
            writeln!(f, "  cancelled: {}", ids.join(", "))?;
        }
        for pending in &self.stuck {
            let waits: Vec<&str> = pending.waiting_on.iter().map(|id| id.as_str()).collect();
            writeln!(f, "  stuck:     {} (waiting on {})", pending.id, waits.join(", "))?;
        }
        for warning in &self.warnings {
            writeln!(f, "  warning:   {}", warning)?;
        }
        Ok(())
    }
}

/// Scheduling state for one pass of [`Coordinator::run`].
struct Progress {
    queue: ReadyQueue,
    /// Attempts recorded before this process picked the run up.
    prior_attempts: HashMap<UnitId, u32>,
    /// Attempts started by this process.
    tries: HashMap<UnitId, u32>,
    completed: Vec<UnitId>,
    failed: Vec<(UnitId, String)>,
    blocked: Vec<(UnitId, String)>,
    cancelled: Vec<UnitId>,
    stuck: Vec<PendingUnit>,
    cancelling: bool,
    /// Workers still running at this instant are aborted.
    kill_at: Option<tokio::time::Instant>,
    /// Why the last admission pass stopped early.
    admit_error: Option<Error>,
}

impl Progress {
    fn next_attempt(&mut self, id: &UnitId) -> u32 {
        let tries = self.tries.entry(id.clone()).or_insert(0);
        *tries += 1;
        self.prior_attempts.get(id).copied().unwrap_or(0) + *tries
    }

    fn tries(&self, id: &UnitId) -> u32 {
        self.tries.get(id).copied().unwrap_or(0)
    }
}

pub struct Coordinator {
    run_id: String,
    graph: WorkGraph,
    settings: RunSettings,
    executor: Arc<dyn Executor>,
    workspaces: WorkspaceManager,
    locks: Arc<dyn LockManager>,
    rate_limiter: Option<Arc<RateLimiter>>,
    events: Option<mpsc::UnboundedSender<RunEvent>>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        run_id: &str,
        graph: WorkGraph,
        settings: RunSettings,
        executor: Arc<dyn Executor>,
        workspaces: WorkspaceManager,
        locks: Arc<dyn LockManager>,
    ) -> Self {
        Self {
            run_id: run_id.to_string(),
            graph,
            settings,
            executor,
            workspaces,
            locks,
            rate_limiter: None,
            events: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Gate every spawn on a token from `limiter`.
    pub fn with_rate_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_events(mut self, events: mpsc::UnboundedSender<RunEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Use an externally owned cancel token (for example the registry's).
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancelling this token stops the run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn graph(&self) -> &WorkGraph {
        &self.graph
    }

    pub fn run_dir(&self) -> PathBuf {
        self.settings.run_dir(&self.run_id)
    }

    pub fn state_path(&self) -> PathBuf {
        self.run_dir().join("state.json")
    }

    /// Batches the run would execute, without executing anything.
    pub fn plan(&self) -> Result<ExecutionPlan> {
        self.graph.get_execution_plan()
    }

    fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    /// Execute the run until every unit is completed, failed, blocked or
    /// cancelled.
    ///
    /// Fails before spawning anything if the graph is invalid. A stuck
    /// graph is persisted as `stuck` and returned as [`Error::Stuck`].
    pub async fn run(self) -> Result<RunReport> {
        let started_at = Utc::now();
        self.graph.validate()?;
        tlog!(
            "Run {} starting: {} units, {} workers max",
            self.run_id,
            self.graph.len(),
            self.settings.max_parallel_workers
        );

        let store = Arc::new(StateStore::<RunState>::new(
            &self.state_path(),
            Arc::clone(&self.locks),
            self.settings.lock_timeout,
        )?);
        let mut progress = self.resume(&store).await?;

        let workspaces = self.workspaces.clone();
        match crate::util::blocking(move || workspaces.cleanup_orphans(&Default::default())).await {
            Ok(report) if !report.removed.is_empty() => {
                tlog_warn!("Removed {} orphan workspaces", report.removed.len())
            }
            Ok(_) => {}
            Err(e) => tlog_warn!("Orphan cleanup failed: {}", e),
        }

        let runner = Arc::new(WorkerRunner::new(RunContext {
            run_id: self.run_id.clone(),
            run_dir: self.run_dir(),
            workspaces: self.workspaces.clone(),
            executor: Arc::clone(&self.executor),
            worker_timeout: self.settings.worker_timeout,
            grace_period: self.settings.grace_period,
        }));
        let mut pool = WorkerPool::new(
            runner,
            self.settings.max_parallel_workers,
            self.cancel.child_token(),
        );

        if let Err(e) = self.drive(&store, &mut pool, &mut progress).await {
            tlog_error!("Run {} aborted: {}", self.run_id, e);
            let aborted = pool.shutdown(self.hard_stop_after()).await;
            if !aborted.is_empty() {
                tlog_warn!("Abandoned {} unresponsive workers", aborted.len());
            }
            if let Err(persist) = store.update(|s| s.set_status(RunStatus::Failed)).await {
                tlog_error!("Could not record aborted run {}: {}", self.run_id, persist);
            }
            return Err(e);
        }

        self.finish(&store, progress, started_at).await
    }

    /// Load or initialise the run record and build the ready queue from it.
    async fn resume(&self, store: &Arc<StateStore<RunState>>) -> Result<Progress> {
        let run_id = self.run_id.clone();
        let ids: Vec<UnitId> = self.graph.ids().cloned().collect();
        let (interrupted, completed, attempts) = store
            .update(move |state| {
                state.ensure_units(&run_id, ids.iter());
                let interrupted = state.recover_interrupted();
                state.set_status(RunStatus::Running);
                let attempts: HashMap<UnitId, u32> = state
                    .units
                    .iter()
                    .map(|(id, record)| (id.clone(), record.attempts))
                    .collect();
                (interrupted, state.completed_ids(), attempts)
            })
            .await?;

        for id in &interrupted {
            tlog_warn!("Unit {} was left running by an earlier coordinator; retrying", id);
        }
        let completed: std::collections::HashSet<UnitId> = completed
            .into_iter()
            .filter(|id| self.graph.contains(id))
            .collect();
        if !completed.is_empty() {
            tlog!("Resuming run {}: {} units already completed", self.run_id, completed.len());
        }

        Ok(Progress {
            queue: self.graph.ready_queue(&completed)?,
            prior_attempts: attempts,
            tries: HashMap::new(),
            completed: Vec::new(),
            failed: Vec::new(),
            blocked: Vec::new(),
            cancelled: Vec::new(),
            stuck: Vec::new(),
            cancelling: false,
            kill_at: None,
            admit_error: None,
        })
    }

    /// How long workers get to exit after a cancel before they are aborted.
    fn hard_stop_after(&self) -> Duration {
        self.settings.grace_period + KILL_SLACK * 2
    }

    /// Admission and completion loop.
    async fn drive(
        &self,
        store: &Arc<StateStore<RunState>>,
        pool: &mut WorkerPool,
        progress: &mut Progress,
    ) -> Result<()> {
        let mut idle_passes = 0u32;
        loop {
            if !progress.cancelling && self.cancel.is_cancelled() {
                self.begin_cancel(pool, progress);
            }
            if !progress.cancelling && self.admit(store, pool, progress).await? > 0 {
                idle_passes = 0;
            }

            if pool.active_count() == 0 {
                if progress.cancelling || progress.queue.is_settled() {
                    return Ok(());
                }
                if !progress.queue.has_ready() {
                    progress.stuck = progress.queue.unresolved();
                    return Ok(());
                }
                // Ready work that could not be admitted this pass.
                idle_passes += 1;
                if idle_passes >= ADMIT_ATTEMPTS {
                    return Err(progress.admit_error.take().unwrap_or_else(|| {
                        Error::ResourceExhausted("no ready unit could be admitted".to_string())
                    }));
                }
                let backoff = Duration::from_millis(50 * u64::from(idle_passes));
                tokio::select! {
                    _ = tokio::time::sleep(backoff) => {}
                    _ = self.cancel.cancelled() => {}
                }
                continue;
            }

            let kill_at = progress.kill_at;
            tokio::select! {
                event = pool.next_event() => {
                    if let Some(event) = event {
                        self.on_worker_event(store, progress, event).await?;
                    }
                }
                _ = self.cancel.cancelled(), if !progress.cancelling => {
                    self.begin_cancel(pool, progress);
                }
                _ = tokio::time::sleep_until(kill_at.unwrap_or_else(tokio::time::Instant::now)), if kill_at.is_some() => {
                    self.hard_stop(store, pool, progress).await?;
                }
            }
        }
    }

    fn begin_cancel(&self, pool: &WorkerPool, progress: &mut Progress) {
        tlog!(
            "Run {} cancelling; stopping {} running workers",
            self.run_id,
            pool.active_count()
        );
        progress.cancelling = true;
        progress.kill_at = Some(tokio::time::Instant::now() + self.hard_stop_after());
        pool.cancel_all();
    }

    /// Abort workers that outlived the cancel grace period and record their
    /// units as cancelled.
    async fn hard_stop(
        &self,
        store: &Arc<StateStore<RunState>>,
        pool: &mut WorkerPool,
        progress: &mut Progress,
    ) -> Result<()> {
        progress.kill_at = None;
        let stranded = pool.abort_all();
        if stranded.is_empty() {
            return Ok(());
        }
        tlog_warn!(
            "Run {}: {} workers ignored cancellation; aborted",
            self.run_id,
            stranded.len()
        );
        let ids = stranded.clone();
        let counters = persist(store, move |s| {
            for id in &ids {
                s.mark_cancelled(id);
            }
            s.counters
        })
        .await?;
        for id in stranded {
            self.emit(RunEvent::UnitCancelled { unit: id.clone() });
            progress.cancelled.push(id);
        }
        self.emit(RunEvent::Progress(counters));
        Ok(())
    }

    /// Start ready units until the pool is full or nothing admissible is left.
    async fn admit(
        &self,
        store: &Arc<StateStore<RunState>>,
        pool: &mut WorkerPool,
        progress: &mut Progress,
    ) -> Result<usize> {
        let mut admitted = 0;
        while pool.has_capacity() {
            let running: Vec<&WorkUnit> = pool
                .active_units()
                .filter_map(|id| self.graph.get(id))
                .collect();
            let graph = &self.graph;
            let next = progress.queue.pop_where(|candidate| match graph.get(candidate) {
                Some(unit) => !running.iter().any(|r| r.scope_overlaps(unit)),
                None => false,
            });
            let Some(id) = next else {
                break;
            };
            let Some(unit) = self.graph.get(&id) else {
                continue;
            };

            if let Some(limiter) = &self.rate_limiter {
                match limiter.acquire(&self.cancel).await {
                    Ok(()) => {}
                    Err(Error::Cancelled) => {
                        progress.queue.requeue(&id);
                        break;
                    }
                    Err(e) => {
                        tlog_warn!("Rate limiter unavailable for {}: {}", id, e);
                        progress.queue.requeue(&id);
                        progress.admit_error = Some(e);
                        break;
                    }
                }
            }

            let attempt = progress.next_attempt(&id);
            let record_id = id.clone();
            if let Err(e) = store
                .update(move |state| state.mark_running(&record_id, attempt))
                .await
            {
                if !e.is_retryable() {
                    return Err(e);
                }
                tlog_warn!("Could not record start of {}: {}", id, e);
                if let Some(tries) = progress.tries.get_mut(&id) {
                    *tries -= 1;
                }
                progress.queue.requeue(&id);
                progress.admit_error = Some(e);
                break;
            }

            let dependencies: Vec<&WorkUnit> = unit
                .dependencies
                .iter()
                .filter_map(|dep| self.graph.get(dep))
                .collect();
            let prompt = render_prompt(unit, &dependencies);
            let handle = WorkerHandle::new(id.clone(), attempt);
            let worker_id = pool.spawn(handle, unit.clone(), prompt)?;
            progress.admit_error = None;
            tlog!("Admitted {} attempt {} ({} running)", id, attempt, pool.active_count());
            self.emit(RunEvent::UnitStarted {
                unit: id,
                attempt,
                worker_id,
            });
            admitted += 1;
        }
        Ok(admitted)
    }

    async fn on_worker_event(
        &self,
        store: &Arc<StateStore<RunState>>,
        progress: &mut Progress,
        event: WorkerEvent,
    ) -> Result<()> {
        let (reason, tokens, cancelled) = match &event.result {
            Ok(result) if result.succeeded() => {
                return self.on_completed(store, progress, result).await;
            }
            Ok(result) => (result.reason(), result.outcome.tokens_used, result.was_cancelled()),
            Err(message) => (message.clone(), 0, false),
        };

        let unit = event.unit;
        // The worker tokens fire before the loop observes the run token.
        let cancelling = progress.cancelling || self.cancel.is_cancelled();
        if cancelling && cancelled {
            let id = unit.clone();
            let counters = persist(store, move |s| {
                s.mark_cancelled(&id);
                s.counters
            })
            .await?;
            tlog!("Unit {} cancelled", unit);
            progress.cancelled.push(unit.clone());
            self.emit(RunEvent::UnitCancelled { unit });
            self.emit(RunEvent::Progress(counters));
            return Ok(());
        }

        let will_retry = !cancelling && progress.tries(&unit) <= self.settings.max_retries;
        tlog_warn!(
            "Unit {} attempt {} failed: {}{}",
            unit,
            event.attempt,
            reason,
            if will_retry { " (retrying)" } else { "" }
        );
        self.emit(RunEvent::UnitFailed {
            unit: unit.clone(),
            attempt: event.attempt,
            reason: reason.clone(),
            will_retry,
        });

        if will_retry {
            let id = unit.clone();
            let counters = persist(store, move |s| {
                s.mark_retrying(&id, tokens);
                s.counters
            })
            .await?;
            progress.queue.requeue(&unit);
            self.emit(RunEvent::Progress(counters));
            return Ok(());
        }

        let blocked = progress.queue.fail(&unit);
        let blocked_reasons: Vec<(UnitId, String)> =
            blocked.iter().map(|b| (b.id.clone(), b.reason())).collect();
        let id = unit.clone();
        let fold_reason = reason.clone();
        let fold_blocked = blocked_reasons.clone();
        let counters = persist(store, move |s| {
            s.mark_failed(&id, &fold_reason, tokens);
            for (blocked, why) in &fold_blocked {
                s.mark_blocked(blocked, why);
            }
            s.counters
        })
        .await?;

        progress.failed.push((unit, reason));
        for (id, why) in blocked_reasons {
            tlog_warn!("Unit {} blocked: {}", id, why);
            self.emit(RunEvent::UnitBlocked {
                unit: id.clone(),
                reason: why.clone(),
            });
            progress.blocked.push((id, why));
        }
        self.emit(RunEvent::Progress(counters));
        Ok(())
    }

    async fn on_completed(
        &self,
        store: &Arc<StateStore<RunState>>,
        progress: &mut Progress,
        result: &WorkerResult,
    ) -> Result<()> {
        let tokens = result.outcome.tokens_used;
        let id = result.unit.clone();
        // Durable first; dependents are released only afterwards.
        let counters = persist(store, move |s| {
            s.mark_completed(&id, tokens);
            s.counters
        })
        .await?;
        let ready = progress.queue.complete(&result.unit);
        tlog!(
            "Unit {} completed{}",
            result.unit,
            match &result.integrated_commit {
                Some(commit) => format!(" at {}", &commit[..commit.len().min(8)]),
                None => String::new(),
            }
        );
        if !ready.is_empty() {
            tlog_debug!("Now ready: {:?}", ready);
        }
        progress.completed.push(result.unit.clone());
        self.emit(RunEvent::UnitCompleted {
            unit: result.unit.clone(),
            tokens_used: tokens,
        });
        self.emit(RunEvent::Progress(counters));
        Ok(())
    }

    async fn finish(
        &self,
        store: &Arc<StateStore<RunState>>,
        mut progress: Progress,
        started_at: DateTime<Utc>,
    ) -> Result<RunReport> {
        if progress.cancelling {
            let drained = progress.queue.drain_unstarted();
            let ids = drained.clone();
            persist(store, move |s| {
                for id in &ids {
                    s.mark_cancelled(id);
                }
            })
            .await?;
            for id in drained {
                self.emit(RunEvent::UnitCancelled { unit: id.clone() });
                progress.cancelled.push(id);
            }
        }

        let status = if progress.cancelling {
            RunStatus::Cancelled
        } else if !progress.stuck.is_empty() {
            RunStatus::Stuck
        } else if progress.failed.is_empty() && progress.blocked.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Failed
        };
        let counters = persist(store, move |s| {
            s.set_status(status);
            s.counters
        })
        .await?;
        self.emit(RunEvent::RunFinished { status, counters });

        let warnings = store.take_warnings().iter().map(|w| w.to_string()).collect();
        let report = RunReport {
            run_id: self.run_id.clone(),
            status,
            completed: progress.completed,
            failed: progress.failed,
            blocked: progress.blocked,
            cancelled: progress.cancelled,
            stuck: progress.stuck,
            counters,
            warnings,
            started_at,
            finished_at: Utc::now(),
        };
        tlog!("Run {} finished: {} ({})", self.run_id, status, counters);

        if status == RunStatus::Stuck {
            let blocked = report
                .stuck
                .iter()
                .map(|p| {
                    let waits: Vec<&str> = p.waiting_on.iter().map(|id| id.as_str()).collect();
                    format!("{} (waiting on {})", p.id, waits.join(", "))
                })
                .collect();
            tlog_error!("Run {} is stuck:\n{}", self.run_id, report);
            return Err(Error::Stuck { blocked });
        }
        Ok(report)
    }
}

/// Fold into the run state, retrying lock timeouts a few times.
async fn persist<R, F>(store: &Arc<StateStore<RunState>>, fold: F) -> Result<R>
where
    R: Send + 'static,
    F: FnOnce(&mut RunState) -> R + Clone + Send + 'static,
{
    let mut attempt = 1;
    loop {
        match store.update(fold.clone()).await {
            Err(e) if e.is_retryable() && attempt < PERSIST_ATTEMPTS => {
                tlog_warn!("State update failed (attempt {}): {}", attempt, e);
                tokio::time::sleep(Duration::from_millis(50 * u64::from(attempt))).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}
