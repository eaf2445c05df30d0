//! Core domain models: work units and the dependency graph.

pub mod graph;
pub mod unit;

pub use graph::{Batch, BlockedUnit, ExecutionPlan, PendingUnit, ReadyQueue, WorkGraph};
pub use unit::{UnitId, UnitStatus, WorkUnit};
