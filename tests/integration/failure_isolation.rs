//! Failure isolation tests.
//!
//! A failed unit must block exactly its transitive dependents; everything
//! else keeps running and finishes.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use tandem::core::{UnitId, UnitStatus, WorkGraph, WorkUnit};
use tandem::orchestration::{CommandExecutor, RunEvent, WorkerResult, WorkerState, WorkspaceManager};
use tandem::state::RunStatus;

use crate::fixtures::{abc_graph, diamond_graph, Behaviour, Harness, ScriptedExecutor, TestRepo};

/// Test: Failure blocks only dependents
/// Given A fails, B depends on A, C is independent
/// When the run executes
/// Then C completes, A is failed, B is blocked and never executed
#[tokio::test]
async fn test_failure_blocks_only_dependents() {
    let harness = Harness::new(2);
    let exec = Arc::new(ScriptedExecutor::new().with("A", Behaviour::Fail("exit status 1")));

    let report = harness
        .coordinator("isolate", abc_graph(), exec.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.completed, vec![UnitId::from("C")]);
    assert_eq!(report.failed, vec![(UnitId::from("A"), "exit status 1".to_string())]);
    assert_eq!(
        report.blocked,
        vec![(UnitId::from("B"), "dependency A failed".to_string())]
    );
    assert_eq!(exec.call_count("B"), 0);

    let state = harness.state("isolate");
    assert_eq!(state.status, RunStatus::Failed);
    assert_eq!(state.status_of(&UnitId::from("C")), Some(&UnitStatus::Completed));
    assert!(matches!(
        state.status_of(&UnitId::from("B")),
        Some(UnitStatus::Blocked { .. })
    ));
    assert_eq!(state.counters.failed, 1);
    assert_eq!(state.counters.blocked, 1);
}

/// Test: Transitive blocking names the chain
/// Given a diamond whose top fails
/// When the run executes
/// Then every other unit is blocked and bottom's reason shows the path
#[tokio::test]
async fn test_transitive_block_reports_cause_chain() {
    let harness = Harness::new(2);
    let exec = Arc::new(ScriptedExecutor::new().with("top", Behaviour::Fail("boom")));

    let report = harness
        .coordinator("chain", diamond_graph(), exec.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.blocked.len(), 3);
    let bottom = report
        .blocked
        .iter()
        .find(|(id, _)| id.as_str() == "bottom")
        .map(|(_, why)| why.clone())
        .unwrap();
    assert!(bottom.starts_with("dependency top failed (via "), "{}", bottom);
    assert_eq!(exec.calls(), vec!["top"]);
}

/// Test: Timeouts are failures with a timeout reason
/// Given an `sh` executor that sleeps past the worker timeout
/// When the run executes
/// Then the unit fails as timed out and the process is gone
#[tokio::test]
async fn test_worker_timeout_fails_unit() {
    let mut harness = Harness::new(1);
    harness.settings.worker_timeout = Duration::from_millis(300);
    let exec = Arc::new(CommandExecutor::new("sh", ["-c", "sleep 5"]));
    let graph = WorkGraph::from_units([WorkUnit::new("slow", "sleeps")]).unwrap();
    let coordinator = harness.coordinator("timeout", graph, exec);
    let run_dir = coordinator.run_dir();

    let started = std::time::Instant::now();
    let report = coordinator.run().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(4));
    assert_eq!(report.status, RunStatus::Failed);
    assert!(report.failed[0].1.contains("timed out"), "{}", report.failed[0].1);
    let result = WorkerResult::load(&run_dir.join("results").join("slow-1.json")).unwrap();
    assert_eq!(result.state, WorkerState::TimedOut);
}

/// Test: Retries are bounded
/// Given a unit that always fails and max_retries = 2
/// When the run executes
/// Then it runs 3 times, only the last failure is final
#[tokio::test]
async fn test_retries_exhausted_then_failed() {
    let mut harness = Harness::new(1);
    harness.settings.max_retries = 2;
    let exec = Arc::new(ScriptedExecutor::new().with("A", Behaviour::Fail("nope")));
    let (tx, mut rx) = mpsc::unbounded_channel();

    let report = harness
        .coordinator("retries", abc_graph(), exec.clone())
        .with_events(tx)
        .run()
        .await
        .unwrap();

    assert_eq!(exec.call_count("A"), 3);
    assert_eq!(report.failed.len(), 1);

    let mut failures = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let RunEvent::UnitFailed {
            attempt, will_retry, ..
        } = event
        {
            failures.push((attempt, will_retry));
        }
    }
    assert_eq!(failures, vec![(1, true), (2, true), (3, false)]);
    let state = harness.state("retries");
    assert_eq!(state.units[&UnitId::from("A")].attempts, 3);
}

/// Test: A transient failure recovers on retry
/// Given a unit that fails once and max_retries = 1
/// When the run executes
/// Then the run completes and its dependent runs
#[tokio::test]
async fn test_transient_failure_recovers() {
    let mut harness = Harness::new(2);
    harness.settings.max_retries = 1;
    let exec = Arc::new(ScriptedExecutor::new().with("A", Behaviour::FailTimes(1)));

    let report = harness
        .coordinator("transient", abc_graph(), exec.clone())
        .run()
        .await
        .unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(exec.call_count("A"), 2);
    assert_eq!(exec.call_count("B"), 1);
}

/// Test: Merge conflicts fail the later unit
/// Given A and C write the same file concurrently in worktree mode
/// When both finish, A first
/// Then A is integrated and C fails with a merge conflict
#[tokio::test]
async fn test_merge_conflict_fails_unit() {
    let repo = TestRepo::new();
    let git = repo.git();
    git.create_branch("tandem/conflict", None).unwrap();
    let harness = Harness::new(2);
    let workspaces =
        WorkspaceManager::worktrees(&harness.path().join("conflict"), git, "tandem/conflict").unwrap();

    let graph = WorkGraph::from_units([WorkUnit::new("A", "alpha"), WorkUnit::new("C", "gamma")]).unwrap();
    let exec = Arc::new(
        ScriptedExecutor::new()
            .with_rendezvous(&["A", "C"])
            .with(
                "A",
                Behaviour::Write {
                    file: "shared.txt",
                    contents: "alpha\n",
                },
            )
            .with(
                "C",
                Behaviour::Write {
                    file: "shared.txt",
                    contents: "gamma\n",
                },
            )
            .with_unit_delay("A", Duration::from_millis(10))
            .with_unit_delay("C", Duration::from_millis(300)),
    );

    let report = harness
        .coordinator_in("conflict", graph, exec, workspaces)
        .run()
        .await
        .unwrap();

    assert_eq!(report.completed, vec![UnitId::from("A")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, UnitId::from("C"));
    assert!(report.failed[0].1.contains("merge conflict"), "{}", report.failed[0].1);
    assert_eq!(
        repo.read_on_branch("tandem/conflict", "shared.txt").as_deref(),
        Some("alpha\n")
    );
}
