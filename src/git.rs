//! Low-level git operations shared by the worktree manager and the
//! merge coordinator.

use std::path::{Path, PathBuf};

use git2::{
    BranchType, ErrorCode, IndexAddOption, Repository, ResetType, Signature, StashFlags,
};

use crate::{rlog_debug, rlog_warn, Result};

pub struct RepoGit {
    repo_path: PathBuf,
}

impl RepoGit {
    pub fn new(repo_path: &Path) -> Result<Self> {
        rlog_debug!("RepoGit::new path={}", repo_path.display());
        let _ = Repository::discover(repo_path)?;
        Ok(Self {
            repo_path: repo_path.to_path_buf(),
        })
    }

    fn repo(&self) -> Result<Repository> {
        Ok(Repository::discover(&self.repo_path)?)
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    /// Create a branch at the tip of `base_branch` and check it out as a
    /// new worktree at `worktree_path`.
    pub fn create_worktree(
        &self,
        branch: &str,
        base_branch: &str,
        worktree_path: &Path,
    ) -> Result<()> {
        rlog_debug!(
            "RepoGit::create_worktree branch={} base={} path={}",
            branch,
            base_branch,
            worktree_path.display()
        );
        let repo = self.repo()?;
        let base_commit = match repo.find_branch(base_branch, BranchType::Local) {
            Ok(b) => b.into_reference().peel_to_commit()?,
            Err(e) if e.code() == ErrorCode::NotFound => repo.head()?.peel_to_commit()?,
            Err(e) => return Err(e.into()),
        };
        let branch_obj = repo.branch(branch, &base_commit, false)?;
        let branch_ref = branch_obj.into_reference();
        let mut opts = git2::WorktreeAddOptions::new();
        opts.reference(Some(&branch_ref));
        // Worktree name comes from the folder, since branch names carry slashes.
        let worktree_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(branch);
        repo.worktree(worktree_name, worktree_path, Some(&opts))?;
        Ok(())
    }

    /// Remove a worktree and its administrative files.
    ///
    /// Attempts every cleanup step even when earlier ones fail: a stale
    /// `.git/worktrees/<name>` entry makes git believe the branch is
    /// still checked out, which blocks later branch deletion.
    pub fn remove_worktree(&self, worktree_path: &Path) -> Result<()> {
        rlog_debug!("RepoGit::remove_worktree path={}", worktree_path.display());
        let repo = self.repo()?;
        let worktrees = repo.worktrees()?;

        let folder_name = worktree_path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|s| s.to_string());

        let worktree_name: Option<String> = worktrees
            .iter()
            .flatten()
            .find(|name| {
                repo.find_worktree(name)
                    .map(|wt| wt.path() == worktree_path)
                    .unwrap_or(false)
                    || folder_name.as_deref() == Some(name)
            })
            .map(|s| s.to_string());

        if let Some(ref name) = worktree_name {
            if let Ok(worktree) = repo.find_worktree(name) {
                let _ = worktree.unlock();
                let prune = worktree.prune(Some(
                    git2::WorktreePruneOptions::new()
                        .valid(true)
                        .working_tree(true)
                        .locked(true),
                ));
                if let Err(e) = prune {
                    rlog_warn!("Worktree prune failed for '{}': {}", name, e);
                }
            }
        }

        if worktree_path.exists() {
            std::fs::remove_dir_all(worktree_path)?;
        }

        for name in [worktree_name.as_deref(), folder_name.as_deref()]
            .into_iter()
            .flatten()
        {
            let admin_dir = repo.path().join("worktrees").join(name);
            if admin_dir.exists() {
                let _ = std::fs::remove_dir_all(&admin_dir);
            }
        }

        Ok(())
    }

    /// Prune worktree entries whose directories are gone.
    pub fn prune_worktrees(&self) -> Result<()> {
        let repo = self.repo()?;
        for name in repo.worktrees()?.iter().flatten() {
            if let Ok(wt) = repo.find_worktree(name) {
                if !wt.path().exists() {
                    rlog_debug!("Pruning stale worktree reference: {}", name);
                    let _ = wt.prune(Some(
                        git2::WorktreePruneOptions::new()
                            .valid(true)
                            .working_tree(true)
                            .locked(true),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn list_worktrees(&self) -> Result<Vec<String>> {
        let repo = self.repo()?;
        Ok(repo
            .worktrees()?
            .iter()
            .flatten()
            .map(String::from)
            .collect())
    }

    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let repo = self.repo()?;
        // Bind before matching so the borrowed Branch drops before repo.
        let result = repo.find_branch(branch, BranchType::Local);
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a local branch. Missing branches are fine; other failures
    /// are logged but not fatal, since the worktree itself is gone.
    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        match repo.find_branch(branch, BranchType::Local) {
            Ok(mut branch_ref) => {
                if let Err(e) = branch_ref.delete() {
                    rlog_warn!("Failed to delete branch '{}': {}", branch, e);
                }
            }
            Err(e) if e.code() == ErrorCode::NotFound => {}
            Err(e) => {
                rlog_warn!("Error looking up branch '{}': {}", branch, e);
            }
        }
        Ok(())
    }

    /// List local branches under the given prefix (e.g. "riptide/task/").
    pub fn branches_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let repo = self.repo()?;
        let mut out = Vec::new();
        for branch in repo.branches(Some(BranchType::Local))? {
            let (branch, _) = branch?;
            if let Some(name) = branch.name()?.map(String::from) {
                if name.starts_with(prefix) {
                    out.push(name);
                }
            }
        }
        Ok(out)
    }

    pub fn branch_tip(&self, branch: &str) -> Result<String> {
        let repo = self.repo()?;
        let branch = repo.find_branch(branch, BranchType::Local)?;
        let commit = branch.into_reference().peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    pub fn head_commit(&self) -> Result<String> {
        let repo = self.repo()?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// HEAD commit of a specific worktree.
    pub fn head_commit_at(&self, worktree_path: &Path) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let commit = repo.head()?.peel_to_commit()?;
        Ok(commit.id().to_string())
    }

    /// Check out a local branch in the primary working tree.
    pub fn checkout_branch(&self, branch: &str) -> Result<()> {
        let repo = self.repo()?;
        let reference = repo
            .find_branch(branch, BranchType::Local)?
            .into_reference();
        let commit = reference.peel_to_commit()?;
        repo.checkout_tree(commit.as_object(), None)?;
        let refname = reference
            .name()
            .map(String::from)
            .unwrap_or_else(|| format!("refs/heads/{}", branch));
        repo.set_head(&refname)?;
        Ok(())
    }

    /// Stage everything in a worktree and commit it.
    pub fn commit_all(&self, worktree_path: &Path, message: &str) -> Result<String> {
        let repo = Repository::open(worktree_path)?;
        let mut index = repo.index()?;
        index.add_all(["."].iter(), IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Riptide", "riptide@localhost"))?;

        let parent = match repo.head() {
            Ok(head) => Some(head.peel_to_commit()?),
            Err(e) if e.code() == ErrorCode::UnbornBranch => None,
            Err(e) => return Err(e.into()),
        };

        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let commit_id = repo.commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)?;
        Ok(commit_id.to_string())
    }

    /// Whether the primary working tree has uncommitted changes.
    pub fn is_dirty(&self) -> Result<bool> {
        let repo = self.repo()?;
        let statuses = repo.statuses(None)?;
        Ok(!statuses.is_empty())
    }

    /// Stash any local modifications in the primary working tree.
    /// Returns false when there was nothing to stash.
    pub fn stash_push(&self, message: &str) -> Result<bool> {
        let mut repo = self.repo()?;
        let sig = repo
            .signature()
            .or_else(|_| Signature::now("Riptide", "riptide@localhost"))?;
        match repo.stash_save(&sig, message, Some(StashFlags::INCLUDE_UNTRACKED)) {
            Ok(_) => Ok(true),
            Err(e) if e.code() == ErrorCode::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Pop the most recent stash entry.
    pub fn stash_pop(&self) -> Result<()> {
        let mut repo = self.repo()?;
        repo.stash_pop(0, None)?;
        Ok(())
    }

    /// Hard-reset the primary working tree to a specific commit.
    pub fn reset_hard(&self, commit: &str) -> Result<()> {
        let repo = self.repo()?;
        let oid = git2::Oid::from_str(commit)?;
        let target = repo.find_commit(oid)?;
        repo.reset(target.as_object(), ResetType::Hard, None)?;
        Ok(())
    }

    /// Paths changed between `base_commit` and the worktree's HEAD.
    pub fn changed_paths_since(
        &self,
        worktree_path: &Path,
        base_commit: &str,
    ) -> Result<Vec<String>> {
        let repo = Repository::open(worktree_path)?;
        let base_oid = git2::Oid::from_str(base_commit)?;
        let base_tree = repo.find_commit(base_oid)?.tree()?;
        let head_tree = repo.head()?.peel_to_commit()?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;

        let mut paths = Vec::new();
        for delta in diff.deltas() {
            if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                paths.push(path.to_string_lossy().to_string());
            }
        }
        paths.sort();
        paths.dedup();
        Ok(paths)
    }
}
