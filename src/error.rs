use std::time::Duration;

use thiserror::Error;

use crate::core::UnitId;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Dependency cycle detected: {}", format_cycle(.cycle))]
    Cycle { cycle: Vec<UnitId> },

    #[error("Unit {unit} depends on unknown unit {missing}")]
    DanglingDependency { unit: UnitId, missing: UnitId },

    #[error("Duplicate unit id: {0}")]
    DuplicateUnit(UnitId),

    #[error("Timed out after {waited:?} waiting for lock '{name}'")]
    LockTimeout { name: String, waited: Duration },

    #[error("Lock '{name}' is not held by this holder")]
    LockNotHeld { name: String },

    #[error("State file {path} is corrupt: {reason}")]
    StateCorruption { path: String, reason: String },

    #[error("Executor failure: {0}")]
    Executor(String),

    #[error("Executor not available: {0}")]
    ExecutorNotAvailable(String),

    #[error("Worker timed out after {0:?}")]
    WorkerTimeout(Duration),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Invalid worker transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run is stuck; blocked units: {}", .blocked.join(", "))]
    Stuck { blocked: Vec<String> },

    #[error("Run was cancelled")]
    Cancelled,
}

impl Error {
    /// Whether a caller may retry the failed operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::LockTimeout { .. } | Error::ResourceExhausted(_) | Error::Timeout(_)
        )
    }

    /// Pre-flight validation failures that must stop a run before any worker starts.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::Cycle { .. }
                | Error::DanglingDependency { .. }
                | Error::DuplicateUnit(_)
        )
    }
}

fn format_cycle(cycle: &[UnitId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
