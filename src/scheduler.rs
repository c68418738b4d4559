//! Wave scheduler for conflict-aware parallel execution.
//!
//! The scheduler partitions the pending backlog into waves: batches of
//! tasks that are pairwise parallel-safe and whose explicit dependencies
//! have all merged. It validates the dependency graph up front (cycles
//! and unknown references are fatal) and surfaces tasks blocked by a
//! failed dependency instead of dropping them.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scoring::ConflictScorer;
use crate::task::{Task, TaskId};
use crate::rlog_debug;

/// An ordered batch of tasks chosen to run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wave {
    /// Zero-based position of this wave within the run.
    pub index: usize,
    /// Tasks in the wave, in dispatch order.
    pub task_ids: Vec<TaskId>,
}

impl Wave {
    pub fn len(&self) -> usize {
        self.task_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.task_ids.is_empty()
    }
}

/// A task that cannot run because a dependency terminally failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub task_id: TaskId,
    pub reason: String,
}

/// Result of planning one wave against the current run state.
#[derive(Debug, Clone)]
pub struct WavePlan {
    /// The wave to dispatch. Empty when nothing is runnable.
    pub wave: Wave,
    /// Runnable or waiting tasks pushed to a later wave.
    pub deferred: Vec<TaskId>,
    /// Tasks permanently blocked by failed dependencies. Reported, not
    /// merged, and never marked completed.
    pub blocked: Vec<BlockedTask>,
}

/// Conflict-aware wave scheduler.
pub struct WaveScheduler {
    scorer: ConflictScorer,
    max_wave_size: usize,
}

impl WaveScheduler {
    pub fn new(scorer: ConflictScorer, max_wave_size: usize) -> Self {
        Self {
            scorer,
            max_wave_size: max_wave_size.max(1),
        }
    }

    pub fn max_wave_size(&self) -> usize {
        self.max_wave_size
    }

    /// Validate the dependency graph before any scheduling happens.
    ///
    /// Unknown dependency references and cycles are unsatisfiable and
    /// therefore fatal: guessing an order would silently violate the
    /// source's intent.
    pub fn validate(&self, tasks: &[Task]) -> Result<()> {
        let known: HashSet<&TaskId> = tasks.iter().map(|t| &t.id).collect();
        for task in tasks {
            for dep in &task.depends_on {
                if !known.contains(dep) {
                    return Err(Error::UnknownDependency {
                        task: task.id.to_string(),
                        dep: dep.to_string(),
                    });
                }
            }
        }

        let mut graph: DiGraph<&TaskId, ()> = DiGraph::new();
        let mut index: HashMap<&TaskId, NodeIndex> = HashMap::new();
        for task in tasks {
            index.insert(&task.id, graph.add_node(&task.id));
        }
        for task in tasks {
            for dep in &task.depends_on {
                graph.add_edge(index[dep], index[&task.id], ());
            }
        }

        toposort(&graph, None).map_err(|cycle| {
            let culprit = graph
                .node_weight(cycle.node_id())
                .map(|id| id.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            Error::CyclicDependency(culprit)
        })?;

        Ok(())
    }

    /// Plan the next wave from the remaining backlog.
    ///
    /// `tasks` is the full remaining backlog (pending only); `completed`
    /// and `failed` come from the orchestrator state. The caller must
    /// have run `validate` on the full backlog first: remaining tasks
    /// may legitimately reference dependencies that already merged.
    /// Selection order is priority first, then backlog insertion order.
    pub fn plan_wave(
        &self,
        tasks: &[Task],
        completed: &HashSet<TaskId>,
        failed: &HashSet<TaskId>,
        wave_index: usize,
    ) -> Result<WavePlan> {
        // Treat tasks downstream of a failure as failed themselves so a
        // whole chain behind one failed task surfaces as blocked.
        let mut unrunnable: HashSet<TaskId> = failed.clone();
        let mut blocked: Vec<BlockedTask> = Vec::new();
        loop {
            let mut grew = false;
            for task in tasks {
                if unrunnable.contains(&task.id) {
                    continue;
                }
                if let Some(dep) = task.depends_on.iter().find(|d| unrunnable.contains(d)) {
                    blocked.push(BlockedTask {
                        task_id: task.id.clone(),
                        reason: format!("dependency {} failed", dep),
                    });
                    unrunnable.insert(task.id.clone());
                    grew = true;
                }
            }
            if !grew {
                break;
            }
        }

        // Eligible: all dependencies merged, not blocked.
        let mut eligible: Vec<(usize, &Task)> = tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| !unrunnable.contains(&t.id))
            .filter(|(_, t)| t.depends_on.iter().all(|d| completed.contains(d)))
            .collect();
        eligible.sort_by(|(ia, a), (ib, b)| {
            b.priority.cmp(&a.priority).then(ia.cmp(ib))
        });

        let mut wave_tasks: Vec<&Task> = Vec::new();
        let mut deferred: Vec<TaskId> = Vec::new();
        for (_, candidate) in &eligible {
            if wave_tasks.len() >= self.max_wave_size {
                deferred.push(candidate.id.clone());
                continue;
            }
            let safe = wave_tasks
                .iter()
                .all(|member| self.scorer.score_pair(member, candidate).is_parallel_safe());
            if safe {
                wave_tasks.push(candidate);
            } else {
                deferred.push(candidate.id.clone());
            }
        }

        // Waiting-on-incomplete-dependency tasks are deferred too.
        for task in tasks {
            if unrunnable.contains(&task.id) {
                continue;
            }
            let waiting = task
                .depends_on
                .iter()
                .any(|d| !completed.contains(d));
            if waiting {
                deferred.push(task.id.clone());
            }
        }

        let wave = Wave {
            index: wave_index,
            task_ids: wave_tasks.iter().map(|t| t.id.clone()).collect(),
        };
        rlog_debug!(
            "plan_wave index={} wave={:?} deferred={} blocked={}",
            wave_index,
            wave.task_ids,
            deferred.len(),
            blocked.len()
        );

        Ok(WavePlan {
            wave,
            deferred,
            blocked,
        })
    }

    /// Simulate the full wave sequence assuming every task merges.
    ///
    /// Used by the status/report paths; the live orchestrator replans
    /// after every wave instead, because failures change the picture.
    pub fn plan_all(&self, tasks: &[Task]) -> Result<Vec<Wave>> {
        self.validate(tasks)?;

        let mut completed: HashSet<TaskId> = HashSet::new();
        let failed: HashSet<TaskId> = HashSet::new();
        let mut remaining: Vec<Task> = tasks.to_vec();
        let mut waves = Vec::new();

        while !remaining.is_empty() {
            let plan = self.plan_wave(&remaining, &completed, &failed, waves.len())?;
            if plan.wave.is_empty() {
                // Nothing runnable and nothing failed: must be blocked
                // tasks only, which cannot happen with an empty failed
                // set after validation.
                return Err(Error::Scheduling(format!(
                    "no runnable tasks among {} remaining",
                    remaining.len()
                )));
            }
            for id in &plan.wave.task_ids {
                completed.insert(id.clone());
            }
            remaining.retain(|t| !completed.contains(&t.id));
            waves.push(plan.wave);
        }

        Ok(waves)
    }
}
