//! The persisted record of one run.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::{UnitId, UnitStatus};

pub const RUN_STATE_VERSION: u32 = 1;

/// Run-level status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Pending,
    Running,
    /// Every unit completed.
    Completed,
    /// Settled with at least one failed or blocked unit.
    Failed,
    Cancelled,
    /// No unit could make progress.
    Stuck,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Stuck => "stuck",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnitRecord {
    pub status: UnitStatus,
    /// Attempts started so far.
    #[serde(default)]
    pub attempts: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tokens_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RunCounters {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub cancelled: usize,
    pub tokens_used: u64,
}

impl RunCounters {
    pub fn finished(&self) -> usize {
        self.completed + self.failed + self.blocked + self.cancelled
    }
}

impl std::fmt::Display for RunCounters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} done ({} completed, {} failed, {} blocked, {} running)",
            self.finished(),
            self.total,
            self.completed,
            self.failed,
            self.blocked,
            self.running
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub version: u32,
    pub run_id: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub units: BTreeMap<UnitId, UnitRecord>,
    #[serde(default)]
    pub counters: RunCounters,
}

impl Default for RunState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: RUN_STATE_VERSION,
            run_id: String::new(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            finished_at: None,
            units: BTreeMap::new(),
            counters: RunCounters::default(),
        }
    }
}

impl RunState {
    /// Register units not yet in the record as pending; returns how many
    /// were added.
    pub fn ensure_units<'a>(&mut self, run_id: &str, ids: impl IntoIterator<Item = &'a UnitId>) -> usize {
        if self.run_id.is_empty() {
            self.run_id = run_id.to_string();
        }
        let mut added = 0;
        for id in ids {
            if !self.units.contains_key(id) {
                self.units.insert(id.clone(), UnitRecord::default());
                added += 1;
            }
        }
        self.touch();
        added
    }

    pub fn status_of(&self, id: &UnitId) -> Option<&UnitStatus> {
        self.units.get(id).map(|r| &r.status)
    }

    pub fn completed_ids(&self) -> HashSet<UnitId> {
        self.units
            .iter()
            .filter(|(_, r)| r.status == UnitStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Units left `running` by a coordinator that went away; reset to pending.
    pub fn recover_interrupted(&mut self) -> Vec<UnitId> {
        let mut reset = Vec::new();
        for (id, record) in self.units.iter_mut() {
            if matches!(record.status, UnitStatus::Running { .. }) {
                record.status = UnitStatus::Pending;
                record.started_at = None;
                reset.push(id.clone());
            }
        }
        // Earlier cancellations and failures are retried on resume.
        for record in self.units.values_mut() {
            if matches!(
                record.status,
                UnitStatus::Cancelled | UnitStatus::Failed { .. } | UnitStatus::Blocked { .. }
            ) {
                record.status = UnitStatus::Pending;
                record.finished_at = None;
            }
        }
        self.touch();
        reset
    }

    pub fn mark_running(&mut self, id: &UnitId, attempt: u32) {
        let record = self.units.entry(id.clone()).or_default();
        record.status = UnitStatus::Running { attempt };
        record.attempts = record.attempts.max(attempt);
        record.started_at = Some(Utc::now());
        record.finished_at = None;
        self.touch();
    }

    pub fn mark_completed(&mut self, id: &UnitId, tokens_used: u64) {
        let record = self.units.entry(id.clone()).or_default();
        record.status = UnitStatus::Completed;
        record.tokens_used += tokens_used;
        record.finished_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_failed(&mut self, id: &UnitId, reason: &str, tokens_used: u64) {
        let record = self.units.entry(id.clone()).or_default();
        record.status = UnitStatus::Failed {
            reason: reason.to_string(),
        };
        record.tokens_used += tokens_used;
        record.finished_at = Some(Utc::now());
        self.touch();
    }

    /// Back to pending between retry attempts.
    pub fn mark_retrying(&mut self, id: &UnitId, tokens_used: u64) {
        let record = self.units.entry(id.clone()).or_default();
        record.status = UnitStatus::Pending;
        record.tokens_used += tokens_used;
        self.touch();
    }

    pub fn mark_blocked(&mut self, id: &UnitId, reason: &str) {
        let record = self.units.entry(id.clone()).or_default();
        record.status = UnitStatus::Blocked {
            reason: reason.to_string(),
        };
        record.finished_at = Some(Utc::now());
        self.touch();
    }

    pub fn mark_cancelled(&mut self, id: &UnitId) {
        let record = self.units.entry(id.clone()).or_default();
        if !record.status.is_terminal() {
            record.status = UnitStatus::Cancelled;
            record.finished_at = Some(Utc::now());
        }
        self.touch();
    }

    pub fn set_status(&mut self, status: RunStatus) {
        self.status = status;
        if status.is_terminal() {
            self.finished_at = Some(Utc::now());
        } else {
            self.finished_at = None;
        }
        self.touch();
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        self.recount();
    }

    fn recount(&mut self) {
        let mut counters = RunCounters {
            total: self.units.len(),
            ..RunCounters::default()
        };
        for record in self.units.values() {
            counters.tokens_used += record.tokens_used;
            match record.status {
                UnitStatus::Pending => counters.pending += 1,
                UnitStatus::Running { .. } => counters.running += 1,
                UnitStatus::Completed => counters.completed += 1,
                UnitStatus::Failed { .. } => counters.failed += 1,
                UnitStatus::Blocked { .. } => counters.blocked += 1,
                UnitStatus::Cancelled => counters.cancelled += 1,
            }
        }
        self.counters = counters;
    }
}
