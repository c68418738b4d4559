//! Bounded pool of concurrent task workers.
//!
//! Each worker runs one task's executor inside that task's workspace,
//! under a per-task timeout. A timeout is a failure, never a silent
//! success, and the executor future is dropped so its subprocess is
//! killed rather than left dangling. Cancellation gives in-flight work
//! a grace period before the same forced teardown.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use crate::executor::SharedExecutor;
use crate::task::{Task, TaskId};
use crate::worktree::Workspace;
use crate::{rlog, rlog_debug, rlog_warn, Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum concurrently executing tasks.
    pub max_workers: usize,
    /// Per-task execution timeout.
    pub task_timeout_secs: u64,
    /// How long a cancelled task may keep running before its executor
    /// is torn down.
    pub grace_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            task_timeout_secs: 900,
            grace_secs: 10,
        }
    }
}

/// Outcome of one task's execution, before merge integration.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub task_id: TaskId,
    pub workspace: Workspace,
    pub modified_files: Vec<String>,
    pub should_close: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

/// Terminal worker events, delivered in completion order.
#[derive(Debug)]
pub enum WorkerEvent {
    Finished(WorkerResult),
    Failed {
        task_id: TaskId,
        workspace: Workspace,
        error: String,
    },
    TimedOut {
        task_id: TaskId,
        workspace: Workspace,
        timeout_secs: u64,
    },
    Cancelled {
        task_id: TaskId,
        workspace: Workspace,
    },
}

impl WorkerEvent {
    pub fn task_id(&self) -> &TaskId {
        match self {
            WorkerEvent::Finished(r) => &r.task_id,
            WorkerEvent::Failed { task_id, .. } => task_id,
            WorkerEvent::TimedOut { task_id, .. } => task_id,
            WorkerEvent::Cancelled { task_id, .. } => task_id,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        match self {
            WorkerEvent::Finished(r) => &r.workspace,
            WorkerEvent::Failed { workspace, .. } => workspace,
            WorkerEvent::TimedOut { workspace, .. } => workspace,
            WorkerEvent::Cancelled { workspace, .. } => workspace,
        }
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    executor: SharedExecutor,
    events_tx: mpsc::UnboundedSender<WorkerEvent>,
    cancel: CancellationToken,
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        executor: SharedExecutor,
        cancel: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                executor,
                events_tx,
                cancel,
                active: Arc::new(AtomicUsize::new(0)),
            },
            events_rx,
        )
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.config.max_workers
    }

    /// Dispatch a task. The worker owns the workspace until it reports a
    /// terminal event on the channel.
    pub fn submit(&self, task: Task, workspace: Workspace) -> Result<()> {
        if !self.has_capacity() {
            return Err(Error::PoolFull {
                max: self.config.max_workers,
            });
        }
        self.active.fetch_add(1, Ordering::SeqCst);
        rlog!(
            "Dispatching task {} ({} active)",
            task.id,
            self.active_count()
        );

        let executor = Arc::clone(&self.executor);
        let events_tx = self.events_tx.clone();
        let cancel = self.cancel.clone();
        let active = Arc::clone(&self.active);
        let task_timeout = Duration::from_secs(self.config.task_timeout_secs);
        let grace = Duration::from_secs(self.config.grace_secs);
        let timeout_secs = self.config.task_timeout_secs;

        tokio::spawn(async move {
            let started_at = Utc::now();
            let task_id = task.id.clone();

            let exec_fut = executor.execute(&task, &workspace);
            tokio::pin!(exec_fut);

            let event = tokio::select! {
                result = &mut exec_fut => {
                    finish_event(result, &task_id, &workspace, started_at)
                }
                _ = tokio::time::sleep(task_timeout) => {
                    // Dropping the executor future kills its subprocess.
                    rlog_warn!("Task {} timed out after {}s", task_id, timeout_secs);
                    WorkerEvent::TimedOut {
                        task_id: task_id.clone(),
                        workspace: workspace.clone(),
                        timeout_secs,
                    }
                }
                _ = cancel.cancelled() => {
                    rlog_debug!("Task {} cancelled, granting {}s to finish", task_id, grace.as_secs());
                    match timeout(grace, &mut exec_fut).await {
                        Ok(result) => finish_event(result, &task_id, &workspace, started_at),
                        Err(_) => WorkerEvent::Cancelled {
                            task_id: task_id.clone(),
                            workspace: workspace.clone(),
                        },
                    }
                }
            };

            active.fetch_sub(1, Ordering::SeqCst);
            // The receiver may be gone during shutdown; nothing to do then.
            let _ = events_tx.send(event);
        });
        Ok(())
    }
}

fn finish_event(
    result: Result<crate::executor::ExecutionReport>,
    task_id: &TaskId,
    workspace: &Workspace,
    started_at: DateTime<Utc>,
) -> WorkerEvent {
    match result {
        Ok(report) => WorkerEvent::Finished(WorkerResult {
            task_id: task_id.clone(),
            workspace: workspace.clone(),
            modified_files: report.modified_files,
            should_close: report.should_close,
            started_at,
            finished_at: Utc::now(),
        }),
        Err(e) => WorkerEvent::Failed {
            task_id: task_id.clone(),
            workspace: workspace.clone(),
            error: e.to_string(),
        },
    }
}
