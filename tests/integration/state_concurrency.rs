//! State store and lock manager tests under contention.
//!
//! These tests use separate lock manager instances over one directory,
//! which is how separate processes see each other.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tandem::lock::{FileLockManager, LockHolder, LockManager};
use tandem::state::{RunStatus, StateStore};

use crate::fixtures::{independent_graph, Harness, ScriptedExecutor};

/// Test: No lost updates
/// Given 8 threads, each with its own lock manager over one directory
/// When each increments a shared counter 25 times
/// Then the counter ends at 200
#[test]
fn test_concurrent_mutations_lose_no_updates() {
    let dir = tempfile::TempDir::new().unwrap();
    let lock_dir = dir.path().join("locks");
    let path = dir.path().join("counter.json");

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let lock_dir = lock_dir.clone();
            let path = path.clone();
            std::thread::spawn(move || {
                let locks: Arc<dyn LockManager> =
                    Arc::new(FileLockManager::new(&lock_dir, Duration::from_secs(60)).unwrap());
                let store: StateStore<BTreeMap<String, u64>> =
                    StateStore::new(&path, locks, Duration::from_secs(30)).unwrap();
                for _ in 0..25 {
                    store
                        .mutate(|counts| *counts.entry("n".to_string()).or_insert(0) += 1)
                        .unwrap();
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    let locks: Arc<dyn LockManager> =
        Arc::new(FileLockManager::new(&lock_dir, Duration::from_secs(60)).unwrap());
    let store: StateStore<BTreeMap<String, u64>> =
        StateStore::new(&path, locks, Duration::from_secs(5)).unwrap();
    assert_eq!(store.read().unwrap().get("n"), Some(&200));
    assert!(store.take_warnings().is_empty());
}

/// Test: Stale lock reclamation
/// Given a lock held by a process that has exited
/// When another holder tries to take it
/// Then it is refused until the threshold passes, then granted
#[test]
fn test_dead_holder_reclaimed_only_after_threshold() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = FileLockManager::new(dir.path(), Duration::from_millis(400)).unwrap();

    let mut child = std::process::Command::new("true").spawn().unwrap();
    let dead_pid = child.id();
    child.wait().unwrap();

    let dead = LockHolder::for_pid(dead_pid);
    assert!(manager.try_acquire("registry", &dead).unwrap());

    let me = LockHolder::current();
    assert!(!manager.try_acquire("registry", &me).unwrap());
    assert!(!manager.is_stale("registry").unwrap());

    std::thread::sleep(Duration::from_millis(500));
    assert!(manager.is_stale("registry").unwrap());
    assert!(manager.try_acquire("registry", &me).unwrap());
    let record = manager.holder("registry").unwrap().unwrap();
    assert!(record.is_held_by(&me));
    manager.release("registry", &me).unwrap();
    assert!(manager.holder("registry").unwrap().is_none());
}

/// Test: Live holders are never reclaimed
/// Given a lock held by a live process past the threshold
/// When another holder tries to take it
/// Then it is refused and acquire times out
#[test]
fn test_live_holder_is_never_reclaimed() {
    let dir = tempfile::TempDir::new().unwrap();
    let manager = FileLockManager::new(dir.path(), Duration::from_millis(50)).unwrap();
    let first = LockHolder::current();
    let second = LockHolder::current();
    assert!(manager.try_acquire("state", &first).unwrap());

    std::thread::sleep(Duration::from_millis(100));
    assert!(!manager.is_stale("state").unwrap());
    let err = manager
        .acquire("state", &second, Duration::from_millis(150))
        .unwrap_err();
    assert!(matches!(err, tandem::Error::LockTimeout { .. }));
    assert!(err.is_retryable());
}

/// Test: Corrupt state is recovered and reported
/// Given a run whose state file holds garbage
/// When the run executes
/// Then it completes, the bytes are backed up, and the report warns
#[tokio::test]
async fn test_corrupt_state_surfaces_as_warning() {
    let harness = Harness::new(2);
    let run_dir = harness.settings.run_dir("corrupt");
    std::fs::create_dir_all(&run_dir).unwrap();
    std::fs::write(run_dir.join("state.json"), "{ not json").unwrap();

    let exec = Arc::new(ScriptedExecutor::new());
    let report = harness
        .coordinator("corrupt", independent_graph(2), exec)
        .run()
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.warnings.len(), 1);
    assert!(report.warnings[0].contains("corrupt"), "{}", report.warnings[0]);
    let backups: Vec<_> = std::fs::read_dir(&run_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".corrupt-"))
        .collect();
    assert_eq!(backups.len(), 1);
    assert_eq!(harness.state("corrupt").counters.completed, 2);
}

/// Test: State agrees with results and no lock outlives the run
/// Given a finished run
/// When its state, results and lock directory are inspected
/// Then every completed unit has a result and no lock record remains
#[tokio::test]
async fn test_finished_run_leaves_consistent_state() {
    let harness = Harness::new(3);
    let exec = Arc::new(ScriptedExecutor::new());
    let coordinator = harness.coordinator("consistent", independent_graph(5), exec);
    let run_dir = coordinator.run_dir();
    coordinator.run().await.unwrap();

    let state = harness.state("consistent");
    assert_eq!(state.counters.total, 5);
    assert_eq!(state.counters.completed, 5);
    assert_eq!(state.counters.running, 0);
    assert_eq!(state.counters.tokens_used, 50);
    for (id, record) in &state.units {
        assert_eq!(record.attempts, 1);
        assert!(run_dir.join("results").join(format!("{}-1.json", id)).exists());
    }

    let locks = FileLockManager::new(&harness.settings.lock_dir(), Duration::from_secs(60)).unwrap();
    assert!(locks.list().unwrap().is_empty());
}
