//! The orchestration loop: plan a wave, dispatch it, integrate each
//! completion serially, persist after every merge decision, advance.
//!
//! All cross-component traffic flows through the worker event channel;
//! the orchestrator owns the state object and the merge coordinator
//! outright, so the target branch has exactly one writer and the state
//! file exactly one owner.

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::executor::SharedExecutor;
use crate::git::RepoGit;
use crate::merge::{MergeCoordinator, MergeOutcome};
use crate::pool::{WorkerEvent, WorkerPool, WorkerResult};
use crate::scheduler::{BlockedTask, WaveScheduler, WavePlan};
use crate::scoring::ConflictScorer;
use crate::state::{OrchestratorState, StateStore};
use crate::task::{Backlog, Task, TaskId};
use crate::worktree::WorktreeManager;
use crate::{rlog, rlog_error, rlog_warn, Error, Result};

/// A terminally failed task, with enough detail to intervene manually.
#[derive(Debug, Clone)]
pub struct TaskFailure {
    pub task_id: TaskId,
    pub branch: Option<String>,
    pub error: String,
}

/// A dispatched task with no recorded outcome; a resume retries it.
#[derive(Debug, Clone)]
pub struct AmbiguousTask {
    pub task_id: TaskId,
    pub branch: Option<String>,
}

/// What the run produced, for the final report.
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: Uuid,
    pub waves_run: usize,
    pub completed: Vec<TaskId>,
    pub failed: Vec<TaskFailure>,
    pub blocked: Vec<BlockedTask>,
    pub ambiguous: Vec<AmbiguousTask>,
    pub interrupted: bool,
}

impl RunReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
            && self.blocked.is_empty()
            && self.ambiguous.is_empty()
            && !self.interrupted
    }
}

pub struct Orchestrator {
    backlog: Backlog,
    scheduler: WaveScheduler,
    worktrees: WorktreeManager,
    pool: WorkerPool,
    events_rx: mpsc::UnboundedReceiver<WorkerEvent>,
    merge: MergeCoordinator,
    store: StateStore,
    state: OrchestratorState,
    cancel: CancellationToken,
    blocked: Vec<BlockedTask>,
}

impl Orchestrator {
    /// Load or initialize the run, then reconcile leftover workspaces.
    ///
    /// Graph validation happens here, before anything is dispatched:
    /// cycles and unknown dependencies halt the run immediately.
    pub fn new(
        config: &Config,
        backlog: Backlog,
        git: RepoGit,
        executor: SharedExecutor,
        store: StateStore,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let scorer = ConflictScorer::new(config.scoring.clone());
        let scheduler = WaveScheduler::new(scorer, config.pool.max_workers);
        scheduler.validate(&backlog.tasks)?;

        let target = config.effective_target_branch().to_string();
        let worktrees = WorktreeManager::new(
            RepoGit::new(git.repo_path())?,
            config.workspaces_dir()?,
            target.clone(),
        );
        let merge = MergeCoordinator::new(
            RepoGit::new(git.repo_path())?,
            config.merge.clone(),
            target,
        );
        let (pool, events_rx) = WorkerPool::new(config.pool.clone(), executor, cancel.clone());

        let state = match store.load()? {
            Some(mut prior) => {
                rlog!(
                    "Resuming run {}: {} completed, {} failed, {} ambiguous in-flight",
                    prior.run_id,
                    prior.completed_ids.len(),
                    prior.failed_ids.len(),
                    prior.in_flight.len()
                );
                prior.requeue_in_flight();
                prior
            }
            None => {
                let ids: Vec<TaskId> = backlog.tasks.iter().map(|t| t.id.clone()).collect();
                let state = OrchestratorState::new(ids);
                rlog!("Starting run {} with {} task(s)", state.run_id, backlog.len());
                state
            }
        };
        store.save(&state)?;

        // Keep workspaces for tasks the snapshot still references:
        // re-queued in-flight tasks and failed tasks whose branches are
        // preserved for manual recovery. Everything else is a leftover.
        let keep: HashSet<TaskId> = state
            .in_flight
            .iter()
            .chain(state.failed_ids.iter())
            .cloned()
            .collect();
        worktrees.reconcile(&keep)?;

        Ok(Self {
            backlog,
            scheduler,
            worktrees,
            pool,
            events_rx,
            merge,
            store,
            state,
            cancel,
            blocked: Vec::new(),
        })
    }

    pub fn state(&self) -> &OrchestratorState {
        &self.state
    }

    /// Drive the run to its terminal state (or interruption).
    pub async fn run(&mut self) -> Result<RunReport> {
        loop {
            if self.cancel.is_cancelled() {
                rlog!("Cancellation requested, stopping wave dispatch");
                return Ok(self.report(true));
            }

            let remaining = self.remaining_tasks();
            if remaining.is_empty() {
                break;
            }

            let completed: HashSet<TaskId> = self.state.completed_ids.iter().cloned().collect();
            let failed: HashSet<TaskId> = self.state.failed_ids.iter().cloned().collect();
            let plan =
                self.scheduler
                    .plan_wave(&remaining, &completed, &failed, self.state.wave_index)?;
            self.note_blocked(&plan);

            if plan.wave.is_empty() {
                // Everything left is blocked behind failed dependencies.
                rlog_warn!(
                    "No runnable tasks; {} blocked, {} remaining",
                    self.blocked.len(),
                    remaining.len()
                );
                break;
            }

            let dispatched = self.dispatch_wave(&plan.wave.task_ids)?;
            if let Err(e) = self.drain_wave(dispatched).await {
                // A merge halt leaves undispatched and unrecorded tasks
                // resumable; surface it after persisting.
                self.store.save(&self.state)?;
                return Err(e);
            }

            self.state.advance_wave();
            self.store.save(&self.state)?;

            if self.cancel.is_cancelled() {
                return Ok(self.report(true));
            }
        }

        let report = self.report(false);
        // Failed tasks keep the snapshot live so their preserved branches
        // stay referenced across a resume; only a clean terminal run is
        // archived out of the way.
        if self.state.is_terminal() && self.state.failed_ids.is_empty() {
            self.archive_state()?;
        }
        Ok(report)
    }

    /// Task definitions still in the backlog, in backlog order.
    fn remaining_tasks(&self) -> Vec<Task> {
        self.state
            .backlog
            .iter()
            .filter_map(|id| {
                let task = self.backlog.get(id);
                if task.is_none() {
                    rlog_warn!("State references unknown task {}, skipping", id);
                }
                task.cloned()
            })
            .collect()
    }

    fn note_blocked(&mut self, plan: &WavePlan) {
        for blocked in &plan.blocked {
            if !self.blocked.iter().any(|b| b.task_id == blocked.task_id) {
                rlog_warn!("Task {} blocked: {}", blocked.task_id, blocked.reason);
                self.blocked.push(blocked.clone());
            }
        }
    }

    /// Acquire workspaces and submit the wave. A workspace failure marks
    /// that task failed and the wave goes on without it.
    fn dispatch_wave(&mut self, task_ids: &[TaskId]) -> Result<usize> {
        let mut dispatched = 0;
        for id in task_ids {
            let task = match self.backlog.get(id) {
                Some(t) => t.clone(),
                None => continue,
            };
            let workspace = match self.worktrees.acquire(&task) {
                Ok(ws) => ws,
                Err(e) => {
                    rlog_error!("Workspace acquisition failed for {}: {}", id, e);
                    self.state.record_failed(id, e.to_string());
                    self.store.save(&self.state)?;
                    continue;
                }
            };
            self.state.mark_dispatched(id, &workspace.branch);
            self.store.save(&self.state)?;
            self.pool.submit(task, workspace)?;
            dispatched += 1;
        }
        Ok(dispatched)
    }

    /// Receive every terminal event for the dispatched wave, integrating
    /// each completion serially in arrival (completion) order.
    async fn drain_wave(&mut self, mut outstanding: usize) -> Result<()> {
        while outstanding > 0 {
            let event = match self.events_rx.recv().await {
                Some(event) => event,
                None => break,
            };
            outstanding -= 1;
            self.handle_event(event).await?;
        }
        Ok(())
    }

    async fn handle_event(&mut self, event: WorkerEvent) -> Result<()> {
        match event {
            WorkerEvent::Finished(result) => self.integrate(result).await,
            WorkerEvent::Failed {
                task_id,
                workspace,
                error,
            } => {
                self.state.record_failed(&task_id, &error);
                self.store.save(&self.state)?;
                self.worktrees.release_failed(&workspace);
                Ok(())
            }
            WorkerEvent::TimedOut {
                task_id,
                workspace,
                timeout_secs,
            } => {
                let error = Error::ExecutionTimeout {
                    task: task_id.to_string(),
                    timeout: std::time::Duration::from_secs(timeout_secs),
                };
                self.state.record_failed(&task_id, error.to_string());
                self.store.save(&self.state)?;
                if let Err(e) = self.worktrees.release_aborted(&workspace) {
                    rlog_warn!("Cleanup after timeout of {} failed: {}", task_id, e);
                }
                Ok(())
            }
            WorkerEvent::Cancelled { task_id, .. } => {
                // No outcome: the task stays in-flight in the snapshot so
                // a resume retries it instead of guessing.
                rlog!("Task {} cancelled before completion, left ambiguous", task_id);
                self.store.save(&self.state)?;
                Ok(())
            }
        }
    }

    async fn integrate(&mut self, result: WorkerResult) -> Result<()> {
        if result.should_close {
            rlog!("Task {} needs no work, integrating empty branch", result.task_id);
        }
        let outcome = match self.merge.integrate(&result).await {
            Ok(outcome) => outcome,
            Err(e @ Error::MergeHalted { .. }) => {
                // The task keeps its in-flight slot; nothing is recorded.
                rlog_error!("Merge pipeline halted; {} left ambiguous", result.task_id);
                return Err(e);
            }
            Err(e) => return Err(e),
        };

        match outcome {
            MergeOutcome::Merged { .. } => {
                self.state.record_merged(&result.task_id);
                self.store.save(&self.state)?;
                if let Err(e) = self.worktrees.release_merged(&result.workspace) {
                    rlog_warn!(
                        "Workspace cleanup for merged {} failed: {}",
                        result.task_id,
                        e
                    );
                }
            }
            MergeOutcome::ConflictUnresolved { files } => {
                let error = Error::MergeConflict {
                    branch: result.workspace.branch.clone(),
                    files,
                };
                self.state.record_failed(&result.task_id, error.to_string());
                self.store.save(&self.state)?;
                self.worktrees.release_failed(&result.workspace);
            }
            MergeOutcome::FailedRetryable { error, retries } => {
                self.state.record_failed(
                    &result.task_id,
                    format!("merge failed after {} retries: {}", retries, error),
                );
                self.store.save(&self.state)?;
                self.worktrees.release_failed(&result.workspace);
            }
            MergeOutcome::FailedFatal { error } => {
                self.state
                    .record_failed(&result.task_id, format!("merge failed: {}", error));
                self.store.save(&self.state)?;
                self.worktrees.release_failed(&result.workspace);
            }
        }
        Ok(())
    }

    fn report(&self, interrupted: bool) -> RunReport {
        let failed = self
            .state
            .failed_ids
            .iter()
            .map(|id| TaskFailure {
                task_id: id.clone(),
                branch: self.state.branches.get(id.as_str()).cloned(),
                error: self
                    .state
                    .last_errors
                    .get(id.as_str())
                    .cloned()
                    .unwrap_or_else(|| "unknown".to_string()),
            })
            .collect();
        let ambiguous = self
            .state
            .in_flight
            .iter()
            .map(|id| AmbiguousTask {
                task_id: id.clone(),
                branch: self.state.branches.get(id.as_str()).cloned(),
            })
            .collect();

        RunReport {
            run_id: self.state.run_id,
            waves_run: self.state.wave_index,
            completed: self.state.completed_ids.clone(),
            failed,
            blocked: self.blocked.clone(),
            ambiguous,
            interrupted,
        }
    }

    /// Archive the terminal snapshot under completed/. If an identical
    /// archive already exists (a re-run of a finished backlog), the move
    /// is a no-op.
    fn archive_state(&self) -> Result<()> {
        let archive_dir = match self.store.path().parent() {
            Some(parent) => parent.join("completed"),
            None => return Ok(()),
        };
        let archive = archive_dir.join(format!("run-{}.json", self.state.run_id));
        match self.worktrees.move_to_completed(self.store.path(), &archive) {
            Ok(()) => {
                rlog!("Run {} archived to {}", self.state.run_id, archive.display());
                Ok(())
            }
            Err(Error::LifecycleMove(detail)) => {
                rlog_warn!("State archive skipped: {}", detail);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
