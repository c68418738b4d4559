//! The execution seam: how a task's actual work gets done.
//!
//! The orchestration core treats execution as an opaque, potentially
//! slow, potentially failing black box. The production implementation
//! shells out to a configured command inside the task's workspace; tests
//! substitute their own implementations.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::process::Command;

use crate::git::RepoGit;
use crate::task::Task;
use crate::worktree::Workspace;
use crate::{rlog, rlog_debug, Error, Result};

/// Marker file an executor may drop in its workspace to signal the task
/// needs no further work (e.g. the change already landed upstream).
pub const CLOSE_MARKER: &str = ".riptide-close";

/// What one execution produced, before merge integration.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Files the execution actually modified, from the committed diff.
    /// Informational; feeds future conflict scoring.
    pub modified_files: Vec<String>,
    /// The task was found to require no further work.
    pub should_close: bool,
}

pub trait TaskExecutor: Send + Sync {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        workspace: &'a Workspace,
    ) -> BoxFuture<'a, Result<ExecutionReport>>;
}

pub type SharedExecutor = Arc<dyn TaskExecutor>;

/// Runs the configured shell command in the workspace, then commits
/// whatever it changed onto the task branch.
pub struct CommandExecutor {
    git: RepoGit,
    command: String,
}

impl CommandExecutor {
    pub fn new(git: RepoGit, command: impl Into<String>) -> Self {
        Self {
            git,
            command: command.into(),
        }
    }

    async fn run_command(&self, task: &Task, workspace_path: &Path) -> Result<()> {
        rlog_debug!("Executing '{}' for task {}", self.command, task.id);
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(workspace_path)
            .env("RIPTIDE_TASK_ID", task.id.as_str())
            .env("RIPTIDE_TASK_TITLE", &task.title)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Execution {
                task: task.id.to_string(),
                detail: format!("failed to spawn executor: {}", e),
            })?;

        let output = child.wait_with_output().await.map_err(|e| Error::Execution {
            task: task.id.to_string(),
            detail: format!("executor did not finish: {}", e),
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Execution {
                task: task.id.to_string(),
                detail: format!(
                    "executor exited with {}: {}",
                    output.status,
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }
}

impl TaskExecutor for CommandExecutor {
    fn execute<'a>(
        &'a self,
        task: &'a Task,
        workspace: &'a Workspace,
    ) -> BoxFuture<'a, Result<ExecutionReport>> {
        Box::pin(async move {
            let base = self.git.head_commit_at(&workspace.path)?;
            self.run_command(task, &workspace.path).await?;

            let marker = workspace.path.join(CLOSE_MARKER);
            if marker.exists() {
                rlog!("Task {} reported no work needed", task.id);
                std::fs::remove_file(&marker)?;
                return Ok(ExecutionReport {
                    modified_files: Vec::new(),
                    should_close: true,
                });
            }

            self.git
                .commit_all(&workspace.path, &format!("{}: {}", task.id, task.title))?;
            let modified_files = self.git.changed_paths_since(&workspace.path, &base)?;
            rlog_debug!(
                "Task {} modified {} file(s)",
                task.id,
                modified_files.len()
            );
            Ok(ExecutionReport {
                modified_files,
                should_close: false,
            })
        })
    }
}
