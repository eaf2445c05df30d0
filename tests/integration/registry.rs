//! Registry tests: several runs over one state directory.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc;

use tandem::core::{WorkGraph, WorkUnit};
use tandem::orchestration::{Registry, RegistryStatus, RunEvent};
use tandem::state::RunStatus;
use tandem::Error;

use crate::fixtures::{Behaviour, Harness, ScriptedExecutor};

fn single(unit: &str) -> WorkGraph {
    WorkGraph::from_units([WorkUnit::new(unit, unit)]).unwrap()
}

async fn wait_for_status(registry: &Registry, run_id: &str, status: RegistryStatus) -> bool {
    for _ in 0..250 {
        if let Ok(entry) = registry.status(run_id).await {
            if entry.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}

/// Test: Unique names under contention
/// Given 5 concurrent creates asking for the same name
/// When they all finish
/// Then each got a distinct id: the name itself, then -2 through -5
#[tokio::test]
async fn test_concurrent_creates_get_unique_names() {
    let harness = Harness::new(1);
    let registry = harness.registry(Arc::new(ScriptedExecutor::new()));

    let entries = join_all((0..5).map(|_| registry.create("nightly"))).await;
    let ids: HashSet<String> = entries.into_iter().map(|e| e.unwrap().run_id).collect();

    let expected: HashSet<String> = ["nightly", "nightly-2", "nightly-3", "nightly-4", "nightly-5"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    assert_eq!(ids, expected);
    let active = registry.list().await.unwrap();
    assert_eq!(active.len(), 5);
    assert!(active.iter().all(|e| e.status == RegistryStatus::Queued));
    assert!(active.iter().all(|e| e.requested_id == "nightly"));
}

/// Test: The active-run ceiling holds
/// Given max_active_runs = 1 and three launched runs
/// When they execute
/// Then their work never overlaps and all three complete
#[tokio::test]
async fn test_active_run_ceiling_holds_across_runs() {
    let mut harness = Harness::new(2);
    harness.settings.max_active_runs = 1;
    let exec = Arc::new(ScriptedExecutor::new().with_delay(Duration::from_millis(100)));
    let registry = harness.registry(exec.clone());

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut handles = Vec::new();
    for name in ["one", "two", "three"] {
        let events = if name == "one" { Some(tx.clone()) } else { None };
        handles.push(registry.launch(name, single(name), events).await.unwrap());
    }
    drop(tx);

    for handle in handles {
        let report = handle.wait().await.unwrap();
        assert_eq!(report.status, RunStatus::Completed);
    }
    assert_eq!(exec.peak(), 1);

    let archived = registry.archived().await.unwrap();
    assert_eq!(archived.len(), 3);
    assert!(archived.iter().all(|e| e.status == RegistryStatus::Completed));
    assert!(archived.iter().all(|e| e.counters.completed == 1));
    assert!(registry.list().await.unwrap().is_empty());

    let mut finished = false;
    while let Some(event) = rx.recv().await {
        if let RunEvent::RunFinished { status, .. } = event {
            assert_eq!(status, RunStatus::Completed);
            finished = true;
        }
    }
    assert!(finished, "events should be forwarded to the caller");
}

/// Test: Stopping a queued run
/// Given one active slot held by a hanging run and a second run queued
/// When the queued run is stopped
/// Then it ends cancelled without ever executing, and the first run is untouched
#[tokio::test]
async fn test_stop_queued_run_never_executes() {
    let mut harness = Harness::new(1);
    harness.settings.max_active_runs = 1;
    let exec = Arc::new(ScriptedExecutor::new().with("first-work", Behaviour::Hang));
    let registry = harness.registry(exec.clone());

    let first = registry.launch("first", single("first-work"), None).await.unwrap();
    assert!(wait_for_status(&registry, "first", RegistryStatus::Running).await);
    let second = registry.launch("second", single("second-work"), None).await.unwrap();
    assert_eq!(
        registry.status("second").await.unwrap().status,
        RegistryStatus::Queued
    );

    registry.stop("second").await.unwrap();
    let err = second.wait().await.unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert_eq!(
        registry.status("second").await.unwrap().status,
        RegistryStatus::Cancelled
    );
    assert_eq!(exec.call_count("second-work"), 0);
    assert_eq!(
        registry.status("first").await.unwrap().status,
        RegistryStatus::Running
    );

    registry.stop("first").await.unwrap();
    let report = tokio::time::timeout(Duration::from_secs(10), first.wait())
        .await
        .expect("stopped run should finish promptly")
        .unwrap();
    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(
        registry.status("first").await.unwrap().status,
        RegistryStatus::Cancelled
    );
}

/// Test: Workspace roots are removed
/// Given a completed run
/// When it is archived
/// Then its workspace root no longer exists
#[tokio::test]
async fn test_finished_run_removes_workspace_root() {
    let harness = Harness::new(1);
    let registry = harness.registry(Arc::new(ScriptedExecutor::new()));

    let handle = registry.launch("tidy", single("work"), None).await.unwrap();
    let workspace = registry.status("tidy").await.unwrap().workspace;
    handle.wait().await.unwrap();

    assert!(!workspace.exists());
    let entry = registry.status("tidy").await.unwrap();
    assert_eq!(entry.status, RegistryStatus::Completed);
    assert!(entry.finished_at.is_some());
}
