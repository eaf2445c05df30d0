mod run_state;
mod store;

pub use run_state::{RunCounters, RunState, RunStatus, UnitRecord, RUN_STATE_VERSION};
pub use store::{StateStore, StateWarning};
