//! Cancellation and resume tests.
//!
//! Cancelling a run must stop its workers, keep every result that was
//! already recorded, and leave state a later run can pick up from.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tandem::core::{UnitId, UnitStatus, WorkGraph, WorkUnit};
use tandem::orchestration::{CommandExecutor, RunEvent};
use tandem::state::RunStatus;

use crate::fixtures::{chain_graph, eventually, Behaviour, Harness, ScriptedExecutor};

/// Cancel the coordinator's token once `unit` has started.
async fn cancel_when_started(
    mut rx: mpsc::UnboundedReceiver<RunEvent>,
    unit: &str,
    cancel: tokio_util::sync::CancellationToken,
) {
    while let Some(event) = rx.recv().await {
        if let RunEvent::UnitStarted { unit: started, .. } = &event {
            if started.as_str() == unit {
                cancel.cancel();
            }
        }
    }
}

/// Test: Cancel keeps finished work
/// Given a chain u1 <- u2 <- u3 where u2 hangs
/// When the run is cancelled while u2 is running
/// Then u1 stays completed and u2, u3 are cancelled
#[tokio::test]
async fn test_cancel_mid_run_keeps_completed_results() {
    let harness = Harness::new(2);
    let exec = Arc::new(ScriptedExecutor::new().with("u2", Behaviour::Hang));
    let (tx, rx) = mpsc::unbounded_channel();
    let coordinator = harness.coordinator("cancel", chain_graph(3), exec.clone()).with_events(tx);
    let watcher = tokio::spawn(cancel_when_started(rx, "u2", coordinator.cancel_token()));

    let report = tokio::time::timeout(Duration::from_secs(10), coordinator.run())
        .await
        .expect("cancelled run should finish promptly")
        .unwrap();
    watcher.await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.completed, vec![UnitId::from("u1")]);
    let mut cancelled = report.cancelled.clone();
    cancelled.sort();
    assert_eq!(cancelled, vec![UnitId::from("u2"), UnitId::from("u3")]);
    assert_eq!(exec.call_count("u3"), 0);

    let state = harness.state("cancel");
    assert_eq!(state.status, RunStatus::Cancelled);
    assert_eq!(state.status_of(&UnitId::from("u1")), Some(&UnitStatus::Completed));
    assert_eq!(state.counters.cancelled, 2);
}

/// Test: Resume after cancel
/// Given a cancelled run with u1 completed
/// When the same run id is executed again
/// Then u1 is not re-executed and u2 runs under a new attempt number
#[tokio::test]
async fn test_resume_after_cancel_finishes_remaining() {
    let harness = Harness::new(2);
    let hanging = Arc::new(ScriptedExecutor::new().with("u2", Behaviour::Hang));
    let (tx, rx) = mpsc::unbounded_channel();
    let first = harness.coordinator("resume", chain_graph(3), hanging).with_events(tx);
    let watcher = tokio::spawn(cancel_when_started(rx, "u2", first.cancel_token()));
    let report = first.run().await.unwrap();
    watcher.await.unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);

    let exec = Arc::new(ScriptedExecutor::new());
    let second = harness.coordinator("resume", chain_graph(3), exec.clone());
    let run_dir = second.run_dir();
    let report = second.run().await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(exec.calls(), vec!["u2", "u3"]);
    let state = harness.state("resume");
    assert_eq!(state.units[&UnitId::from("u1")].attempts, 1);
    assert_eq!(state.units[&UnitId::from("u2")].attempts, 2);
    assert!(run_dir.join("results").join("u2-1.json").exists());
    assert!(run_dir.join("results").join("u2-2.json").exists());
}

/// Test: Cancel kills the whole process tree
/// Given an `sh` worker that starts a background grandchild
/// When the run is cancelled
/// Then the grandchild is gone too
#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_cancel_kills_process_tree() {
    use crate::fixtures::process_running;

    let mut harness = Harness::new(1);
    harness.settings.grace_period = Duration::from_millis(200);
    let pid_file = harness.path().join("grandchild.pid");
    let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
    let exec = Arc::new(CommandExecutor::new("sh", ["-c".to_string(), script]));
    let graph = WorkGraph::from_units([WorkUnit::new("tree", "spawns a child")]).unwrap();
    let coordinator = harness.coordinator("tree", graph, exec);
    let cancel = coordinator.cancel_token();
    let run = tokio::spawn(coordinator.run());

    assert!(eventually(Duration::from_secs(5), || pid_file.exists()).await);
    let mut pid = None;
    assert!(
        eventually(Duration::from_secs(2), || {
            pid = std::fs::read_to_string(&pid_file)
                .ok()
                .and_then(|s| s.trim().parse::<u32>().ok());
            pid.is_some()
        })
        .await
    );
    let pid = pid.unwrap();
    assert!(process_running(pid));

    cancel.cancel();
    let report = tokio::time::timeout(Duration::from_secs(10), run)
        .await
        .expect("cancelled run should finish promptly")
        .unwrap()
        .unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(
        eventually(Duration::from_secs(3), || !process_running(pid)).await,
        "grandchild {} survived cancellation",
        pid
    );
}

/// Test: Cancel before start
/// Given a coordinator whose token is already cancelled
/// When the run executes
/// Then nothing is executed and every unit is cancelled
#[tokio::test]
async fn test_cancel_before_start_runs_nothing() {
    let harness = Harness::new(2);
    let exec = Arc::new(ScriptedExecutor::new());
    let coordinator = harness.coordinator("early", chain_graph(2), exec.clone());
    coordinator.cancel_token().cancel();

    let report = coordinator.run().await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert!(exec.calls().is_empty());
    assert_eq!(report.cancelled.len(), 2);
}
