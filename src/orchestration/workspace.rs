//! Isolated workspaces for running units.
//!
//! Every WorkerHandle gets a directory nobody else writes to. In worktree
//! mode that directory is a linked git worktree on its own branch, cut from
//! the run branch, so the object store is shared while working files are
//! not. Completed work is folded back into the run branch; the next
//! dependent's worktree then starts from it.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::IsolationMode;
use crate::core::UnitId;
use crate::git::{GitOps, MergeOutcome};
use crate::{tlog_debug, tlog_warn, Error, Result};

/// A workspace allocated to one attempt of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workspace {
    pub path: PathBuf,
    /// Worker branch, in worktree mode.
    pub branch: Option<String>,
}

/// What an orphan sweep removed.
#[derive(Debug, Clone, Default)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<(PathBuf, String)>,
    pub pruned_worktrees: usize,
}

impl CleanupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn merge(&mut self, other: CleanupReport) {
        self.removed.extend(other.removed);
        self.failed.extend(other.failed);
        self.pruned_worktrees += other.pruned_worktrees;
    }
}

#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
    mode: IsolationMode,
    git: Option<GitOps>,
    run_branch: Option<String>,
}

impl WorkspaceManager {
    /// Plain directories below `root`.
    pub fn directories(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            mode: IsolationMode::Directory,
            git: None,
            run_branch: None,
        })
    }

    /// Git worktrees below `root`, branched from `run_branch` in `git`.
    pub fn worktrees(root: &Path, git: GitOps, run_branch: &str) -> Result<Self> {
        fs::create_dir_all(root)?;
        if !git.branch_exists(run_branch)? {
            return Err(Error::Validation(format!(
                "run branch '{}' does not exist",
                run_branch
            )));
        }
        Ok(Self {
            root: root.to_path_buf(),
            mode: IsolationMode::Worktree,
            git: Some(git),
            run_branch: Some(run_branch.to_string()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn mode(&self) -> IsolationMode {
        self.mode
    }

    pub fn run_branch(&self) -> Option<&str> {
        self.run_branch.as_deref()
    }

    fn workspace_name(unit: &UnitId, attempt: u32) -> String {
        format!("{}-{}", unit.file_stem(), attempt)
    }

    fn worker_branch(&self, name: &str) -> Option<String> {
        self.run_branch
            .as_deref()
            .map(|run| format!("tandem-work/{}/{}", run.trim_start_matches("tandem/"), name))
    }

    /// Create the workspace for `attempt` of `unit`.
    ///
    /// Leftovers from an earlier crash at the same path are removed first.
    pub fn allocate(&self, unit: &UnitId, attempt: u32) -> Result<Workspace> {
        let name = Self::workspace_name(unit, attempt);
        let path = self.root.join(&name);
        let branch = self.worker_branch(&name);

        if path.exists() {
            tlog_warn!("Removing stale workspace {}", path.display());
            self.remove_path(&path)?;
        }

        match (&self.git, &branch) {
            (Some(git), Some(branch)) => {
                git.delete_branch(branch)?;
                git.create_worktree(branch, self.run_branch.as_deref(), &path)?;
            }
            _ => fs::create_dir_all(&path)?,
        }
        tlog_debug!("Allocated workspace {} for {}", path.display(), unit);
        Ok(Workspace { path, branch })
    }

    /// Commit the worker's changes and fold them into the run branch.
    pub fn integrate(&self, workspace: &Workspace, message: &str) -> Result<MergeOutcome> {
        let (Some(git), Some(branch), Some(run_branch)) =
            (&self.git, &workspace.branch, &self.run_branch)
        else {
            return Ok(MergeOutcome::UpToDate);
        };
        GitOps::commit_all(&workspace.path, message)?;
        git.merge_branch(run_branch, branch, message)
    }

    /// Remove the workspace and its worker branch.
    pub fn release(&self, workspace: &Workspace) -> Result<()> {
        self.remove_path(&workspace.path)?;
        if let (Some(git), Some(branch)) = (&self.git, &workspace.branch) {
            git.delete_branch(branch)?;
        }
        Ok(())
    }

    fn remove_path(&self, path: &Path) -> Result<()> {
        match &self.git {
            Some(git) => git.remove_worktree(path),
            None => {
                if path.exists() {
                    fs::remove_dir_all(path)?;
                }
                Ok(())
            }
        }
    }

    /// Remove every workspace under the root not listed in `known`.
    pub fn cleanup_orphans(&self, known: &HashSet<PathBuf>) -> Result<CleanupReport> {
        let mut report = CleanupReport::default();
        if !self.root.exists() {
            return Ok(report);
        }
        for entry in fs::read_dir(&self.root)? {
            let path = entry?.path();
            if !path.is_dir() || known.contains(&path) {
                continue;
            }
            match self.remove_path(&path) {
                Ok(()) => {
                    tlog_debug!("Removed orphan workspace {}", path.display());
                    report.removed.push(path);
                }
                Err(e) => {
                    tlog_warn!("Failed to remove orphan {}: {}", path.display(), e);
                    report.failed.push((path, e.to_string()));
                }
            }
        }
        if let Some(git) = &self.git {
            report.pruned_worktrees = git.prune_worktrees()?;
        }
        Ok(report)
    }
}
