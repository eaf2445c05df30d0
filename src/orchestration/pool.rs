//! Per-run worker pool.
//!
//! The pool enforces the run's concurrency ceiling and turns each worker's
//! exit into a [`WorkerEvent`] on a channel, so the coordinator sleeps
//! until something actually finishes instead of polling every worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinHandle};
use tokio_util::sync::CancellationToken;

use super::worker::{WorkerHandle, WorkerId, WorkerResult, WorkerRunner};
use crate::core::{UnitId, WorkUnit};
use crate::error::{Error, Result};
use crate::{tlog_debug, tlog_warn};

/// Emitted once per spawned worker when it finishes.
#[derive(Debug)]
pub struct WorkerEvent {
    pub unit: UnitId,
    pub attempt: u32,
    pub worker_id: WorkerId,
    /// `Err` when the worker could not record a result or panicked.
    pub result: std::result::Result<WorkerResult, String>,
}

struct ActiveWorker {
    worker_id: WorkerId,
    attempt: u32,
    started: Instant,
    cancel: CancellationToken,
    /// Supervisor that reports the worker's exit.
    task: JoinHandle<()>,
    /// The worker itself; a detached join handle would let it run on.
    runner: AbortHandle,
}

pub struct WorkerPool {
    runner: Arc<WorkerRunner>,
    max_concurrent: usize,
    active: HashMap<UnitId, ActiveWorker>,
    event_tx: mpsc::Sender<WorkerEvent>,
    event_rx: mpsc::Receiver<WorkerEvent>,
    /// Parent of every worker's cancel token.
    cancel: CancellationToken,
}

impl WorkerPool {
    pub fn new(runner: Arc<WorkerRunner>, max_concurrent: usize, cancel: CancellationToken) -> Self {
        let max_concurrent = max_concurrent.max(1);
        // Every worker sends exactly one event, so this never blocks a sender.
        let (event_tx, event_rx) = mpsc::channel(max_concurrent);
        Self {
            runner,
            max_concurrent,
            active: HashMap::new(),
            event_tx,
            event_rx,
            cancel,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    pub fn is_active(&self, unit: &UnitId) -> bool {
        self.active.contains_key(unit)
    }

    pub fn active_units(&self) -> impl Iterator<Item = &UnitId> {
        self.active.keys()
    }

    /// Start a worker for `handle`. Fails with `ResourceExhausted` at capacity.
    pub fn spawn(&mut self, handle: WorkerHandle, unit: WorkUnit, prompt: String) -> Result<WorkerId> {
        if !self.has_capacity() {
            return Err(Error::ResourceExhausted(format!(
                "worker pool full ({} of {})",
                self.active_count(),
                self.max_concurrent
            )));
        }
        let worker_id = handle.id;
        let attempt = handle.attempt;
        let unit_id = handle.unit.clone();
        let cancel = self.cancel.child_token();
        let runner = Arc::clone(&self.runner);
        let tx = self.event_tx.clone();
        let worker_cancel = cancel.clone();
        let event_unit = unit_id.clone();

        let inner = tokio::spawn(async move { runner.run(handle, unit, prompt, worker_cancel).await });
        let runner_abort = inner.abort_handle();
        let task = tokio::spawn(async move {
            let result = match inner.await {
                Ok(Ok(result)) => Ok(result),
                Ok(Err(e)) => Err(e.to_string()),
                Err(join) => Err(format!("worker task panicked: {}", join)),
            };
            let event = WorkerEvent {
                unit: event_unit,
                attempt,
                worker_id,
                result,
            };
            if tx.send(event).await.is_err() {
                tlog_warn!("Worker {} finished after the pool was dropped", worker_id);
            }
        });

        tlog_debug!(
            "Pool spawned worker {} for {} ({}/{})",
            worker_id.short(),
            unit_id,
            self.active.len() + 1,
            self.max_concurrent
        );
        self.active.insert(
            unit_id,
            ActiveWorker {
                worker_id,
                attempt,
                started: Instant::now(),
                cancel,
                task,
                runner: runner_abort,
            },
        );
        Ok(worker_id)
    }

    /// Wait for the next worker to finish. `None` when nothing is running.
    pub async fn next_event(&mut self) -> Option<WorkerEvent> {
        if self.active.is_empty() {
            return None;
        }
        let event = self.event_rx.recv().await?;
        if let Some(worker) = self.active.remove(&event.unit) {
            tlog_debug!(
                "Worker {} for {} attempt {} exited after {:?}",
                worker.worker_id.short(),
                event.unit,
                worker.attempt,
                worker.started.elapsed()
            );
        }
        Some(event)
    }

    /// Ask every worker to stop; each gets its grace period before a kill.
    pub fn cancel_all(&self) {
        for worker in self.active.values() {
            worker.cancel.cancel();
        }
    }

    /// Abort every worker outright and forget it. No event is sent for an
    /// aborted worker; the units it was running are returned.
    pub fn abort_all(&mut self) -> Vec<UnitId> {
        let mut aborted = Vec::with_capacity(self.active.len());
        for (unit, worker) in self.active.drain() {
            tlog_warn!("Aborting worker {} for {}", worker.worker_id.short(), unit);
            worker.task.abort();
            worker.runner.abort();
            aborted.push(unit);
        }
        aborted.sort();
        aborted
    }

    /// Cancel every worker, wait up to `grace` for them to exit, then abort
    /// the rest. Returns the units that had to be aborted.
    pub async fn shutdown(&mut self, grace: Duration) -> Vec<UnitId> {
        self.cancel_all();
        let drained = tokio::time::timeout(grace, async {
            while self.next_event().await.is_some() {}
        })
        .await;
        match drained {
            Ok(()) => Vec::new(),
            Err(_) => self.abort_all(),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.active.is_empty() {
            self.cancel_all();
        }
    }
}
