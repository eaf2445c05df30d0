//! Scheduling correctness tests.
//!
//! These tests verify that units start only after their dependencies,
//! that capacity and priority are honoured, and that independent work is
//! never held back by an unrelated slow unit.

use std::sync::Arc;
use std::time::Duration;

use tandem::core::{UnitId, UnitStatus, WorkGraph, WorkUnit};
use tandem::orchestration::{CommandExecutor, WorkerResult, WorkspaceManager};
use tandem::state::RunStatus;

use crate::fixtures::{
    abc_graph, chain_graph, diamond_graph, independent_graph, Behaviour, Harness, ScriptedExecutor,
    TestRepo,
};

/// Test: Dependencies gate start times
/// Given A, B (depends on A) and C with two workers
/// When the run executes
/// Then A and C overlap, and B starts only after A has finished
#[tokio::test]
async fn test_dependent_waits_while_independent_runs_alongside() {
    let harness = Harness::new(2);
    let exec = Arc::new(
        ScriptedExecutor::new()
            .with_unit_delay("A", Duration::from_millis(150))
            .with_unit_delay("C", Duration::from_millis(150))
            .with_unit_delay("B", Duration::from_millis(20)),
    );

    let report = harness
        .coordinator("sched", abc_graph(), exec.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let a = exec.span("A").unwrap();
    let b = exec.span("B").unwrap();
    let c = exec.span("C").unwrap();
    assert!(a.start < c.end && c.start < a.end, "A and C should overlap");
    assert!(b.start >= a.end, "B must not start before A finishes");

    let prompt = exec.prompt("B").unwrap();
    assert!(prompt.starts_with("Implement work unit B: second"));
    assert!(prompt.contains("- A: first"), "B's prompt should list A: {}", prompt);
}

/// Test: Capacity is a hard ceiling
/// Given 6 independent units and 3 workers
/// When the run executes
/// Then exactly 3 run at the peak
#[tokio::test]
async fn test_respects_worker_capacity() {
    let harness = Harness::new(3);
    let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(80)));

    let report = harness
        .coordinator("capacity", independent_graph(6), exec.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 6);
    assert_eq!(exec.peak(), 3);
}

/// Test: No batch barrier
/// Given slow A, fast B and C depending only on B
/// When the run executes
/// Then C starts while A is still running
#[tokio::test]
async fn test_ready_unit_does_not_wait_for_unrelated_slow_unit() {
    let harness = Harness::new(2);
    let graph = WorkGraph::from_units([
        WorkUnit::new("A", "slow"),
        WorkUnit::new("B", "fast"),
        WorkUnit::new("C", "after fast").depends_on("B"),
    ])
    .unwrap();
    let plan = graph.get_execution_plan().unwrap();
    assert_eq!(plan.batch_of(&UnitId::from("C")), Some(1));

    let exec = Arc::new(
        ScriptedExecutor::new()
            .with_unit_delay("A", Duration::from_millis(400))
            .with_unit_delay("B", Duration::from_millis(20))
            .with_unit_delay("C", Duration::from_millis(20)),
    );
    let report = harness.coordinator("barrier", graph, exec.clone()).run().await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let a = exec.span("A").unwrap();
    let c = exec.span("C").unwrap();
    assert!(c.start < a.end, "C should start before A finishes");
}

/// Test: Priority order
/// Given independent units with different priorities and one worker
/// When the run executes
/// Then lower priority values run first, ties in declaration order
#[tokio::test]
async fn test_single_worker_follows_priority() {
    let harness = Harness::new(1);
    let graph = WorkGraph::from_units([
        WorkUnit::new("late", "late").with_priority(5),
        WorkUnit::new("early", "early").with_priority(1),
        WorkUnit::new("middle-a", "middle a").with_priority(3),
        WorkUnit::new("middle-b", "middle b").with_priority(3),
    ])
    .unwrap();
    let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(5)));

    harness.coordinator("priority", graph, exec.clone()).run().await.unwrap();

    assert_eq!(exec.calls(), vec!["early", "middle-a", "middle-b", "late"]);
    assert_eq!(exec.peak(), 1);
}

/// Test: Diamond fan-out and fan-in
/// Given top -> (left, right) -> bottom
/// When the run executes with two workers
/// Then left and right overlap and bottom sees both in its prompt
#[tokio::test]
async fn test_diamond_fans_out_and_joins() {
    let harness = Harness::new(2);
    let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(60)));

    let report = harness
        .coordinator("diamond", diamond_graph(), exec.clone())
        .run()
        .await
        .unwrap();

    assert_eq!(report.completed.len(), 4);
    let left = exec.span("left").unwrap();
    let right = exec.span("right").unwrap();
    let bottom = exec.span("bottom").unwrap();
    assert!(left.start < right.end && right.start < left.end);
    assert!(bottom.start >= left.end && bottom.start >= right.end);
    let prompt = exec.prompt("bottom").unwrap();
    assert!(prompt.contains("- left: left") && prompt.contains("- right: right"));
}

/// Test: Worktree isolation carries completed work forward
/// Given A writes a file and B depends on A, in worktree mode
/// When the run executes
/// Then B's workspace holds A's file and the run branch holds it too
#[tokio::test]
async fn test_worktree_dependent_sees_dependency_changes() {
    let repo = TestRepo::new();
    let git = repo.git();
    git.create_branch("tandem/wt", None).unwrap();
    let harness = Harness::new(2);
    let workspaces = WorkspaceManager::worktrees(&harness.path().join("wt"), git, "tandem/wt").unwrap();

    let graph = WorkGraph::from_units([
        WorkUnit::new("A", "write"),
        WorkUnit::new("B", "read").depends_on("A"),
    ])
    .unwrap();
    let exec = Arc::new(
        ScriptedExecutor::new()
            .with(
                "A",
                Behaviour::Write {
                    file: "a.txt",
                    contents: "from A\n",
                },
            )
            .with("B", Behaviour::ExpectFile("a.txt")),
    );

    let report = harness
        .coordinator_in("wt", graph, exec.clone(), workspaces)
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed, "{}", report);
    assert_eq!(repo.read_on_branch("tandem/wt", "a.txt").as_deref(), Some("from A\n"));
    // The main checkout is never touched.
    assert!(!repo.path.join("a.txt").exists());
}

/// Test: End-to-end with a real child process
/// Given a chain of 3 units and an `sh` executor
/// When the run executes
/// Then every unit completes and leaves a result record and a log
#[tokio::test]
async fn test_shell_executor_end_to_end() {
    let harness = Harness::new(2);
    let exec = Arc::new(CommandExecutor::new("sh", ["-c", "echo working in $(pwd)"]));
    let coordinator = harness.coordinator("shell", chain_graph(3), exec);
    let run_dir = coordinator.run_dir();

    let report = coordinator.run().await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.counters.completed, 3);
    for unit in ["u1", "u2", "u3"] {
        let result = WorkerResult::load(&run_dir.join("results").join(format!("{}-1.json", unit))).unwrap();
        assert!(result.succeeded());
        assert!(result.outcome.output.starts_with("working in"));
        assert!(run_dir.join("logs").join(format!("{}-1.log", unit)).exists());
    }
    let state = harness.state("shell");
    assert_eq!(state.status, RunStatus::Completed);
    assert!(state.units.values().all(|r| r.status == UnitStatus::Completed));
}

/// Test: Look-alike ids stay isolated
/// Given `auth.api` and `auth-api` running at the same time
/// When both write into their workspace and succeed
/// Then both complete with their own workspace, result and log
#[tokio::test]
async fn test_lookalike_ids_never_share_a_workspace() {
    let harness = Harness::new(2);
    let exec = Arc::new(
        ScriptedExecutor::new()
            .with_rendezvous(&["auth.api", "auth-api"])
            .with(
                "auth.api",
                Behaviour::Write {
                    file: "out.txt",
                    contents: "dotted\n",
                },
            )
            .with(
                "auth-api",
                Behaviour::Write {
                    file: "out.txt",
                    contents: "dashed\n",
                },
            ),
    );
    let graph = WorkGraph::from_units([
        WorkUnit::new("auth.api", "dotted"),
        WorkUnit::new("auth-api", "dashed"),
    ])
    .unwrap();
    let coordinator = harness.coordinator("lookalike", graph, exec.clone());
    let run_dir = coordinator.run_dir();

    let report = coordinator.run().await.unwrap();

    assert!(report.is_success(), "{}", report);
    assert_eq!(report.counters.completed, 2);
    let dotted = UnitId::from("auth.api");
    let dashed = UnitId::from("auth-api");
    let a = WorkerResult::load(&run_dir.join("results").join(format!("{}-1.json", dotted.file_stem()))).unwrap();
    let b = WorkerResult::load(&run_dir.join("results").join(format!("{}-1.json", dashed.file_stem()))).unwrap();
    assert_eq!(a.unit, dotted);
    assert_eq!(b.unit, dashed);
    assert_ne!(a.workspace, b.workspace);
}
