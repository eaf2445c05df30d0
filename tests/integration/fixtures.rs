//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - A scripted executor with per-unit behaviour and a timeline
//! - A harness owning a state directory, settings and lock manager
//! - Temporary git repositories
//! - Predefined work graphs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use git2::{Repository, Signature};
use tempfile::TempDir;
use tokio::sync::Barrier;

use tandem::config::RunSettings;
use tandem::core::{WorkGraph, WorkUnit};
use tandem::git::GitOps;
use tandem::lock::{FileLockManager, LockManager};
use tandem::orchestration::{
    Coordinator, EndReason, Executor, ExecutorOutcome, InvokeControl, Registry, WorkspaceManager,
};
use tandem::state::{RunState, StateStore};
use tandem::{Error, Result};

/// What the scripted executor does for one unit.
#[derive(Debug, Clone)]
pub enum Behaviour {
    Succeed,
    /// Fail every attempt with this message.
    Fail(&'static str),
    /// Fail the first `n` attempts, then succeed.
    FailTimes(usize),
    /// Run until cancelled or timed out.
    Hang,
    /// Write a file into the workspace, then succeed.
    Write {
        file: &'static str,
        contents: &'static str,
    },
    /// Succeed only if the workspace already holds this file.
    ExpectFile(&'static str),
}

/// One invocation as seen by the executor.
#[derive(Debug, Clone)]
pub struct Span {
    pub unit: String,
    pub start: Instant,
    pub end: Instant,
}

/// In-process executor driven by a per-unit script.
pub struct ScriptedExecutor {
    behaviours: HashMap<String, Behaviour>,
    delay: Duration,
    delays: HashMap<String, Duration>,
    rendezvous: Option<(Vec<String>, Arc<Barrier>)>,
    calls: Mutex<Vec<String>>,
    prompts: Mutex<HashMap<String, String>>,
    spans: Mutex<Vec<Span>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    /// Every unit succeeds after a short delay.
    pub fn new() -> Self {
        Self {
            behaviours: HashMap::new(),
            delay: Duration::from_millis(30),
            delays: HashMap::new(),
            rendezvous: None,
            calls: Mutex::new(Vec::new()),
            prompts: Mutex::new(HashMap::new()),
            spans: Mutex::new(Vec::new()),
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn with(mut self, unit: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(unit.to_string(), behaviour);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_unit_delay(mut self, unit: &str, delay: Duration) -> Self {
        self.delays.insert(unit.to_string(), delay);
        self
    }

    /// The listed units wait for each other before doing any work.
    pub fn with_rendezvous(mut self, units: &[&str]) -> Self {
        let units: Vec<String> = units.iter().map(|u| u.to_string()).collect();
        let barrier = Arc::new(Barrier::new(units.len()));
        self.rendezvous = Some((units, barrier));
        self
    }

    /// Units in the order they were invoked, retries included.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, unit: &str) -> usize {
        self.calls().iter().filter(|c| *c == unit).count()
    }

    /// Most recent prompt for a unit.
    pub fn prompt(&self, unit: &str) -> Option<String> {
        self.prompts.lock().unwrap().get(unit).cloned()
    }

    /// Most recent span for a unit.
    pub fn span(&self, unit: &str) -> Option<Span> {
        self.spans
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|s| s.unit == unit)
            .cloned()
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Recover the unit id from a rendered prompt.
pub fn unit_from_prompt(prompt: &str) -> String {
    prompt
        .trim_start_matches("Implement work unit ")
        .split(':')
        .next()
        .unwrap_or_default()
        .to_string()
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn invoke(
        &self,
        prompt: &str,
        cwd: &Path,
        timeout: Duration,
        control: &InvokeControl,
    ) -> Result<ExecutorOutcome> {
        let unit = unit_from_prompt(prompt);
        let previous = {
            let mut calls = self.calls.lock().unwrap();
            let previous = calls.iter().filter(|c| **c == unit).count();
            calls.push(unit.clone());
            previous
        };
        self.prompts
            .lock()
            .unwrap()
            .insert(unit.clone(), prompt.to_string());

        if let Some((units, barrier)) = &self.rendezvous {
            if units.contains(&unit) {
                tokio::select! {
                    _ = barrier.wait() => {}
                    _ = control.cancel.cancelled() => {}
                }
            }
        }

        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let start = Instant::now();

        let behaviour = self
            .behaviours
            .get(&unit)
            .cloned()
            .unwrap_or(Behaviour::Succeed);
        let wait = match behaviour {
            Behaviour::Hang => timeout,
            _ => self.delays.get(&unit).copied().unwrap_or(self.delay),
        };
        let ended = tokio::select! {
            _ = tokio::time::sleep(wait) => None,
            _ = control.cancel.cancelled() => Some(EndReason::Cancelled),
        };
        let ended = match (ended, &behaviour) {
            (None, Behaviour::Hang) => Some(EndReason::TimedOut),
            (ended, _) => ended,
        };

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.spans.lock().unwrap().push(Span {
            unit: unit.clone(),
            start,
            end: Instant::now(),
        });

        if let Some(ended) = ended {
            let error = match ended {
                EndReason::TimedOut => Error::WorkerTimeout(timeout).to_string(),
                _ => Error::Cancelled.to_string(),
            };
            let mut outcome = ExecutorOutcome::failed(error);
            outcome.ended = ended;
            return Ok(outcome);
        }

        let outcome = match behaviour {
            Behaviour::Succeed | Behaviour::Hang => {
                ExecutorOutcome::succeeded(format!("{} done", unit), 10)
            }
            Behaviour::Fail(message) => ExecutorOutcome::failed(message),
            Behaviour::FailTimes(n) if previous < n => ExecutorOutcome::failed("transient failure"),
            Behaviour::FailTimes(_) => ExecutorOutcome::succeeded(format!("{} done", unit), 10),
            Behaviour::Write { file, contents } => match std::fs::write(cwd.join(file), contents) {
                Ok(()) => ExecutorOutcome::succeeded(format!("wrote {}", file), 10),
                Err(e) => ExecutorOutcome::failed(e.to_string()),
            },
            Behaviour::ExpectFile(file) if cwd.join(file).exists() => {
                ExecutorOutcome::succeeded(format!("found {}", file), 10)
            }
            Behaviour::ExpectFile(file) => ExecutorOutcome::failed(format!("{} not found", file)),
        };
        Ok(outcome)
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

/// A state directory with settings and a shared lock manager.
pub struct Harness {
    pub dir: TempDir,
    pub settings: RunSettings,
    pub locks: Arc<dyn LockManager>,
}

impl Harness {
    pub fn new(workers: usize) -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let mut settings = RunSettings::rooted_at(dir.path());
        settings.max_parallel_workers = workers;
        settings.max_retries = 0;
        settings.grace_period = Duration::from_millis(200);
        settings.lock_timeout = Duration::from_secs(10);
        settings.rate_limit.capacity = 1000;
        settings.rate_limit.refill_per_sec = 1000.0;
        let locks: Arc<dyn LockManager> = Arc::new(
            FileLockManager::new(&settings.lock_dir(), settings.lock_stale_after)
                .expect("Failed to create lock manager"),
        );
        Self {
            dir,
            settings,
            locks,
        }
    }

    /// A coordinator using plain directories.
    pub fn coordinator(&self, run_id: &str, graph: WorkGraph, executor: Arc<dyn Executor>) -> Coordinator {
        let workspaces = WorkspaceManager::directories(&self.settings.workspace_dir.join(run_id))
            .expect("Failed to create workspace root");
        self.coordinator_in(run_id, graph, executor, workspaces)
    }

    pub fn coordinator_in(
        &self,
        run_id: &str,
        graph: WorkGraph,
        executor: Arc<dyn Executor>,
        workspaces: WorkspaceManager,
    ) -> Coordinator {
        Coordinator::new(
            run_id,
            graph,
            self.settings.clone(),
            executor,
            workspaces,
            Arc::clone(&self.locks),
        )
    }

    /// Persisted state of a run.
    pub fn state(&self, run_id: &str) -> RunState {
        let path = self.settings.run_dir(run_id).join("state.json");
        StateStore::<RunState>::new(&path, Arc::clone(&self.locks), self.settings.lock_timeout)
            .and_then(|store| store.read())
            .expect("Failed to read run state")
    }

    pub fn registry(&self, executor: Arc<dyn Executor>) -> Arc<Registry> {
        Arc::new(
            Registry::open(self.settings.clone(), Arc::clone(&self.locks), executor, None)
                .expect("Failed to open registry"),
        )
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

/// A test repository with a temporary directory and an initial commit.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().to_path_buf();
        let repo = Repository::init(&path).expect("Failed to init git");
        {
            let mut config = repo.config().expect("Failed to open git config");
            config.set_str("user.name", "Test User").unwrap();
            config.set_str("user.email", "test@test.com").unwrap();
        }
        std::fs::write(path.join("README.md"), "# Test Repository\n").expect("Failed to write README");
        let mut index = repo.index().unwrap();
        index.add_path(Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
        let sig = Signature::now("Test User", "test@test.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "Initial commit", &tree, &[])
            .expect("Failed to commit");
        Self { temp_dir, path }
    }

    pub fn git(&self) -> GitOps {
        GitOps::new(&self.path).expect("Failed to open repository")
    }

    /// Contents of `file` at the tip of `branch`, if present.
    pub fn read_on_branch(&self, branch: &str, file: &str) -> Option<String> {
        let repo = Repository::open(&self.path).ok()?;
        let commit = repo
            .find_branch(branch, git2::BranchType::Local)
            .ok()?
            .into_reference()
            .peel_to_commit()
            .ok()?;
        let entry = commit.tree().ok()?.get_path(Path::new(file)).ok()?;
        let blob = repo.find_blob(entry.id()).ok()?;
        Some(String::from_utf8_lossy(blob.content()).to_string())
    }
}

/// A, B (depends on A), C; A and B share priority 1, C has priority 2.
pub fn abc_graph() -> WorkGraph {
    WorkGraph::from_units([
        WorkUnit::new("A", "first").with_priority(1),
        WorkUnit::new("B", "second").with_priority(1).depends_on("A"),
        WorkUnit::new("C", "third").with_priority(2),
    ])
    .unwrap()
}

/// u1 <- u2 <- ... <- un
pub fn chain_graph(n: usize) -> WorkGraph {
    let units = (1..=n).map(|i| {
        let unit = WorkUnit::new(format!("u{}", i), &format!("step {}", i));
        if i > 1 {
            unit.depends_on(format!("u{}", i - 1))
        } else {
            unit
        }
    });
    WorkGraph::from_units(units).unwrap()
}

/// top -> (left, right) -> bottom
pub fn diamond_graph() -> WorkGraph {
    WorkGraph::from_units([
        WorkUnit::new("top", "top"),
        WorkUnit::new("left", "left").depends_on("top"),
        WorkUnit::new("right", "right").depends_on("top"),
        WorkUnit::new("bottom", "bottom").depends_on("left").depends_on("right"),
    ])
    .unwrap()
}

pub fn independent_graph(n: usize) -> WorkGraph {
    WorkGraph::from_units((1..=n).map(|i| WorkUnit::new(format!("t{}", i), &format!("task {}", i))))
        .unwrap()
}

/// Whether a pid names a live, non-zombie process.
#[cfg(target_os = "linux")]
pub fn process_running(pid: u32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => {
            // The state field follows the parenthesised command name.
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next());
            !matches!(state, Some("Z") | Some("X") | None)
        }
        Err(_) => false,
    }
}

/// Poll `check` until it holds or `limit` passes.
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}
