//! Work unit data model.
//!
//! A work unit ("story") is the smallest independently schedulable piece of
//! work. Units are supplied by the work specification and are read-only to
//! the engine; their runtime status lives in the run's state store.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::util::sanitize_name;

/// Identifier of a work unit, unique within one graph.
///
/// Ids come from the work specification (e.g. `US-001`), so unlike the
/// engine's own handles they are free-form strings.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Filesystem-safe stem for this unit's workspace, result and log.
    ///
    /// Distinct ids always give distinct stems. An id that is already a
    /// clean name (`[a-z0-9-]`) is used as is; any other id is sanitized and
    /// suffixed with `_` and a digest of the raw id. Sanitized names never
    /// contain `_`, so the two forms cannot meet.
    pub fn file_stem(&self) -> String {
        let clean = sanitize_name(&self.0);
        if clean == self.0 {
            return clean;
        }
        let digest = Sha256::digest(self.0.as_bytes());
        format!("{}_{}", clean, hex::encode(&digest[..5]))
    }
}

impl From<&str> for UnitId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for UnitId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for UnitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for UnitId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// A single schedulable unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkUnit {
    /// Unique identifier.
    pub id: UnitId,
    /// Short human-readable title.
    pub title: String,
    /// Longer instructions passed to the executor.
    #[serde(default)]
    pub description: String,
    /// Ids of units that must complete before this one starts.
    #[serde(default)]
    pub dependencies: BTreeSet<UnitId>,
    /// Scheduling priority; lower runs sooner.
    #[serde(default)]
    pub priority: i64,
    /// Paths this unit may touch.
    #[serde(default)]
    pub file_scope: BTreeSet<PathBuf>,
}

impl WorkUnit {
    pub fn new(id: impl Into<UnitId>, title: &str) -> Self {
        Self {
            id: id.into(),
            title: title.to_string(),
            description: String::new(),
            dependencies: BTreeSet::new(),
            priority: 0,
            file_scope: BTreeSet::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn depends_on(mut self, dep: impl Into<UnitId>) -> Self {
        self.dependencies.insert(dep.into());
        self
    }

    pub fn touching(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_scope.insert(path.into());
        self
    }

    /// Whether two units declare at least one common path.
    ///
    /// An empty scope means "unknown" and never conflicts.
    pub fn scope_overlaps(&self, other: &WorkUnit) -> bool {
        !self.file_scope.is_disjoint(&other.file_scope)
    }
}

/// Persisted status of a unit within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum UnitStatus {
    /// Not yet admitted.
    #[default]
    Pending,
    /// A worker is executing the unit.
    Running { attempt: u32 },
    /// Finished successfully.
    Completed,
    /// Executor failure or timeout after the last attempt.
    Failed { reason: String },
    /// A direct or transitive dependency failed.
    Blocked { reason: String },
    /// The run was cancelled before the unit finished.
    Cancelled,
}

impl UnitStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UnitStatus::Completed
                | UnitStatus::Failed { .. }
                | UnitStatus::Blocked { .. }
                | UnitStatus::Cancelled
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            UnitStatus::Pending => "pending",
            UnitStatus::Running { .. } => "running",
            UnitStatus::Completed => "completed",
            UnitStatus::Failed { .. } => "failed",
            UnitStatus::Blocked { .. } => "blocked",
            UnitStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UnitStatus::Running { attempt } => write!(f, "running (attempt {})", attempt),
            UnitStatus::Failed { reason } => write!(f, "failed: {}", reason),
            UnitStatus::Blocked { reason } => write!(f, "blocked: {}", reason),
            other => f.write_str(other.label()),
        }
    }
}
