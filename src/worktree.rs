//! Workspace lifecycle: one isolated worktree and branch per in-flight
//! task, with startup reconciliation for leftovers from crashed runs.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::git::RepoGit;
use crate::task::{Task, TaskId};
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

/// Prefix for all branches riptide owns. Anything under it is fair game
/// for reconciliation; nothing outside it is ever touched.
pub const BRANCH_PREFIX: &str = "riptide/task/";

/// An isolated, disposable directory bound to one branch, owned by
/// exactly one in-flight task.
#[derive(Debug, Clone)]
pub struct Workspace {
    pub task_id: TaskId,
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeManager {
    git: RepoGit,
    workspaces_dir: PathBuf,
    base_branch: String,
}

impl WorktreeManager {
    pub fn new(git: RepoGit, workspaces_dir: PathBuf, base_branch: impl Into<String>) -> Self {
        Self {
            git,
            workspaces_dir,
            base_branch: base_branch.into(),
        }
    }

    pub fn git(&self) -> &RepoGit {
        &self.git
    }

    /// Deterministic branch name for a task, suffixed on collision with
    /// a branch left over from an earlier run of the same task.
    pub fn branch_name(&self, task_id: &TaskId) -> Result<String> {
        let base = format!("{}{}", BRANCH_PREFIX, sanitize(task_id.as_str()));
        if !self.git.branch_exists(&base)? {
            return Ok(base);
        }
        for attempt in 2..=16 {
            let candidate = format!("{}-{}", base, attempt);
            if !self.git.branch_exists(&candidate)? {
                rlog_debug!("Branch '{}' exists, using '{}'", base, candidate);
                return Ok(candidate);
            }
        }
        Err(Error::BranchExists(base))
    }

    /// Create the workspace for a task: a fresh branch off the target
    /// branch, checked out as a worktree under the workspaces dir.
    pub fn acquire(&self, task: &Task) -> Result<Workspace> {
        let branch = self.branch_name(&task.id)?;
        let dir_name = format!("task-{}", sanitize(task.id.as_str()));
        let path = self.workspaces_dir.join(&dir_name);

        if path.exists() {
            // Stale dir from a crashed run that reconcile missed.
            rlog_warn!("Workspace dir already exists, removing: {}", path.display());
            self.git.remove_worktree(&path)?;
        }
        fs::create_dir_all(&self.workspaces_dir)?;

        self.git
            .create_worktree(&branch, &self.base_branch, &path)
            .map_err(|e| Error::Workspace {
                task: task.id.to_string(),
                detail: e.to_string(),
            })?;

        rlog!(
            "Workspace acquired for {}: branch={} path={}",
            task.id,
            branch,
            path.display()
        );
        Ok(Workspace {
            task_id: task.id.clone(),
            path,
            branch,
        })
    }

    /// Tear down a merged task's workspace and branch. The changes live
    /// on the target branch now; nothing here is worth keeping.
    pub fn release_merged(&self, workspace: &Workspace) -> Result<()> {
        rlog_debug!("Releasing merged workspace for {}", workspace.task_id);
        self.discard(workspace)
    }

    /// Tear down a workspace whose execution never produced anything
    /// worth keeping (timeout, spawn failure before any commit).
    pub fn release_aborted(&self, workspace: &Workspace) -> Result<()> {
        rlog_debug!("Releasing aborted workspace for {}", workspace.task_id);
        self.discard(workspace)
    }

    fn discard(&self, workspace: &Workspace) -> Result<()> {
        self.git.remove_worktree(&workspace.path)?;
        self.git.delete_branch(&workspace.branch)?;
        Ok(())
    }

    /// Release a failed task's workspace. The branch and directory are
    /// retained for diagnostics; the next startup reconciliation sweeps
    /// them once they are no longer referenced by saved state.
    pub fn release_failed(&self, workspace: &Workspace) {
        rlog!(
            "Retaining workspace of failed task {} for inspection: {}",
            workspace.task_id,
            workspace.path.display()
        );
    }

    /// Startup sweep: remove workspaces and branches for tasks outside
    /// the keep set (in-flight and failed tasks referenced by saved
    /// state). Handles directories left behind by a crashed run, which
    /// would otherwise collide with a fresh attempt at the same task.
    pub fn reconcile(&self, tracked: &HashSet<TaskId>) -> Result<usize> {
        let keep: HashSet<String> = tracked
            .iter()
            .map(|id| format!("task-{}", sanitize(id.as_str())))
            .collect();

        let mut removed = 0;
        if self.workspaces_dir.exists() {
            for entry in fs::read_dir(&self.workspaces_dir)? {
                let entry = entry?;
                let path = entry.path();
                let name = entry.file_name().to_string_lossy().to_string();
                if !path.is_dir() || keep.contains(&name) {
                    continue;
                }
                rlog!("Reconcile: removing orphaned workspace {}", path.display());
                if let Err(e) = self.git.remove_worktree(&path) {
                    rlog_warn!("Reconcile failed for {}: {}", path.display(), e);
                    continue;
                }
                removed += 1;
            }
        }

        self.git.prune_worktrees()?;

        let keep_branches: HashSet<String> = tracked
            .iter()
            .map(|id| format!("{}{}", BRANCH_PREFIX, sanitize(id.as_str())))
            .collect();
        for branch in self.git.branches_with_prefix(BRANCH_PREFIX)? {
            let root = branch
                .rsplit_once('-')
                .filter(|(_, n)| n.parse::<u32>().is_ok())
                .map(|(head, _)| head.to_string())
                .unwrap_or_else(|| branch.clone());
            if !keep_branches.contains(&branch) && !keep_branches.contains(&root) {
                rlog_debug!("Reconcile: deleting orphaned branch {}", branch);
                self.git.delete_branch(&branch)?;
            }
        }

        Ok(removed)
    }

    /// Move a file into its completed location. If the destination
    /// already exists with identical content the move is already done:
    /// drop the source and return. A differing destination is a
    /// non-fatal lifecycle error the caller reports.
    pub fn move_to_completed(&self, source: &Path, destination: &Path) -> Result<()> {
        if destination.exists() {
            let same = fs::read(source)? == fs::read(destination)?;
            if same {
                rlog_debug!(
                    "Destination {} already holds identical content, skipping move",
                    destination.display()
                );
                fs::remove_file(source)?;
                return Ok(());
            }
            return Err(Error::LifecycleMove(format!(
                "destination {} exists with different content",
                destination.display()
            )));
        }
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(source, destination)?;
        Ok(())
    }
}

/// Branch and directory names tolerate only a conservative charset.
fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect()
}
