//! Orchestration layer: executing a work graph with isolated workers.
//!
//! Bottom-up: an [`Executor`] runs one prompt as a child process, a
//! [`WorkerRunner`] wraps that in an isolated workspace, the
//! [`WorkerPool`] bounds how many run at once, the [`Coordinator`] drives a
//! whole run, and the [`Registry`] juggles several runs.

mod coordinator;
mod executor;
mod pool;
mod rate_limit;
mod registry;
mod worker;
mod workspace;

pub use coordinator::{Coordinator, RunEvent, RunReport};
pub use executor::{CommandExecutor, EndReason, Executor, ExecutorOutcome, InvokeControl};
pub use pool::{WorkerEvent, WorkerPool};
pub use rate_limit::{BucketState, RateLimiter};
pub use registry::{Registry, RegistryRecord, RegistryStatus, RunHandle, RunRegistryEntry};
pub use worker::{
    render_prompt, RunContext, WorkerHandle, WorkerId, WorkerResult, WorkerRunner, WorkerState,
};
pub use workspace::{CleanupReport, Workspace, WorkspaceManager};
