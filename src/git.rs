use std::path::{Path, PathBuf};

use git2::{BranchType, ErrorCode, IndexAddOption, Repository, Signature};

use crate::{tlog_debug, tlog_warn, Result};

/// Outcome of folding one branch into another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Target already contained the source.
    UpToDate,
    /// Target moved to the returned commit (fast-forward or merge commit).
    Merged(String),
    /// The merge would conflict; target is unchanged.
    Conflicts(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct GitOps {
    repo_path: PathBuf,
}

impl GitOps {
    pub fn new(repo_path: &Path) -> Result<Self> {
        tlog_debug!("GitOps::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    /// Whether `path` lives inside a git repository.
    pub fn is_repo(path: &Path) -> bool {
        Repository::discover(path).is_ok()
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create `branch` at the tip of `base` (or HEAD when `None`).
    pub fn create_branch(&self, branch: &str, base: Option<&str>) -> Result<String> {
        let repo = self.repo()?;
        let commit = match base {
            Some(base) => repo
                .find_branch(base, BranchType::Local)?
                .into_reference()
                .peel_to_commit()?,
            None => repo.head()?.peel_to_commit()?,
        };
        tlog_debug!("Creating branch {} from commit {}", branch, commit.id());
        repo.branch(branch, &commit, false)?;
        Ok(commit.id().to_string())
    }

    /// Check out a new `branch` (created from `base`) into a linked worktree.
    pub fn create_worktree(&self, branch: &str, base: Option<&str>, worktree_path: &Path) -> Result<()> {
        tlog_debug!(
            "GitOps::create_worktree branch={} base={:?} path={}",
            branch,
            base,
            worktree_path.display()
        );
        self.create_branch(branch, base)?;
        let repo = self.repo()?;
        let branch_ref = repo.find_branch(branch, BranchType::Local)?.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Branch names contain slashes; the folder name is a safe worktree name.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        tlog_debug!("Worktree created: {}", worktree_name);
        Ok(())
    }

    /// Remove a worktree directory and its admin entry.
    ///
    /// Cleanup continues past individual failures so that the branch is
    /// never left looking checked out.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        tlog_debug!("GitOps::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string);

        let worktree_name = repo
            .worktrees()?
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(*name)
            })
            .map(str::to_string);

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                if let Err(e) = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                )) {
                    tlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        // A leftover .git/worktrees/<name> keeps the branch "checked out".
        for name in worktree_name.iter().chain(folder_name.iter()) {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                tlog_debug!("Removing worktree admin dir: {}", admin_dir.display());
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }
        Ok(())
    }

    /// Names of linked worktrees with their checkout paths.
    pub fn list_worktrees(&self) -> Result<Vec<(String, PathBuf)>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                out.push((name.to_string(), wt.path().to_path_buf()));
            }
        }
        Ok(out)
    }

    /// Prune admin entries whose working directory no longer exists.
    pub fn prune_worktrees(&self) -> Result<usize> {
        let repo = self.repo()?;
        let mut pruned = 0;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists()
                    && wt
                        .prune(Some(
                            git2::WorktreePruneOptions::new()
                                .valid(true)
                                .working_tree(true)
                                .locked(true),
                        ))
                        .is_ok()
                {
                    pruned += 1;
                }
            }
        }
        tlog_debug!("prune_worktrees: pruned {} worktrees", pruned);
        Ok(pruned)
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        let exists = match repo.find_branch(branch, BranchType::Local) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        };
        exists
    }

    /// Delete a local branch. A missing branch is not an error.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        tlog_debug!("GitOps::delete_branch branch={}", branch);
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    tlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => tlog_warn!("Error looking up branch '{}': {}", branch, e),
        }
        Ok(())
    }

    pub fn branch_commit(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Stage and commit everything in a worktree.
    ///
    /// Returns `None` when the tree is unchanged.
    pub fn commit_all(worktree_path: &Path, message: &str) -> Result<Option<String>> {
        tlog_debug!(
            "GitOps::commit_all path={} message={}",
            worktree_path.display(),
            message
        );
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };
        if parent.as_ref().map(|p| p.tree_id()) == Some(tree_id) {
            return Ok(None);
        }

        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        tlog_debug!("Commit created: {}", commit_id);
        Ok(Some(commit_id.to_string()))
    }

    /// Fold `source` into `target` without touching any working tree.
    ///
    /// Fast-forwards when possible, otherwise writes a merge commit from an
    /// in-memory index. On conflict the target ref is left untouched.
    pub fn merge_branch(&self, target: &str, source: &str, message: &str) -> Result<MergeOutcome> {
        let repo = self.repo()?;
        let target_ref = repo.find_branch(target, BranchType::Local)?.into_reference();
        let target_name = target_ref
            .name()
            .map(str::to_string)
            .unwrap_or_else(|| format!("refs/heads/{}", target));
        let ours = target_ref.peel_to_commit()?;
        let theirs = repo
            .find_branch(source, BranchType::Local)?
            .into_reference()
            .peel_to_commit()?;

        if ours.id() == theirs.id() || repo.graph_descendant_of(ours.id(), theirs.id())? {
            return Ok(MergeOutcome::UpToDate);
        }
        if repo.graph_descendant_of(theirs.id(), ours.id())? {
            repo.reference(&target_name, theirs.id(), true, message)?;
            tlog_debug!("Fast-forwarded {} to {}", target, theirs.id());
            return Ok(MergeOutcome::Merged(theirs.id().to_string()));
        }

        let mut index = repo.merge_commits(&ours, &theirs, None)?;
        if index.has_conflicts() {
            let mut files = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                let path = conflict
                    .our
                    .as_ref()
                    .or(conflict.their.as_ref())
                    .or(conflict.ancestor.as_ref())
                    .map(|e| String::from_utf8_lossy(&e.path).to_string())
                    .unwrap_or_default();
                files.push(path);
            }
            tlog_warn!("Merge of {} into {} conflicts: {:?}", source, target, files);
            return Ok(MergeOutcome::Conflicts(files));
        }

        let tree_id = index.write_tree_to(&repo)?;
        let tree = repo.find_tree(tree_id)?;
        let sig = signature(&repo)?;
        let commit_id = repo.commit(Some(&target_name), &sig, &sig, message, &tree, &[&ours, &theirs])?;
        tlog_debug!("Merged {} into {} as {}", source, target, commit_id);
        Ok(MergeOutcome::Merged(commit_id.to_string()))
    }
}

fn signature(repo: &Repository) -> Result<Signature<'static>> {
    Ok(repo
        .signature()
        .or_else(|_| Signature::now("Tandem", "tandem@localhost"))?)
}
