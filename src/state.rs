//! Durable orchestration state and its snapshot store.
//!
//! The state is the single source of truth for where every task stands.
//! A task ID lives in exactly one of backlog, in-flight, completed or
//! failed; the mutators move IDs between sets rather than letting the
//! caller edit them, so the disjointness invariant cannot drift. The
//! snapshot is written after every individual merge decision, never
//! batched per wave.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::task::TaskId;
use crate::{rlog, rlog_debug, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorState {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Waves completed so far.
    #[serde(default)]
    pub wave_index: usize,
    /// Tasks not yet dispatched.
    pub backlog: Vec<TaskId>,
    /// Tasks dispatched without a recorded merge outcome.
    #[serde(default)]
    pub in_flight: Vec<TaskId>,
    /// Tasks with a merged outcome. Nothing else puts an ID here.
    #[serde(default)]
    pub completed_ids: Vec<TaskId>,
    /// Tasks whose execution or integration terminally failed this run.
    #[serde(default)]
    pub failed_ids: Vec<TaskId>,
    /// Last error per failed or ambiguous task, for the final report.
    #[serde(default)]
    pub last_errors: BTreeMap<String, String>,
    /// Branch per dispatched task, kept for diagnostics and resume.
    #[serde(default)]
    pub branches: BTreeMap<String, String>,
}

impl OrchestratorState {
    pub fn new(backlog: Vec<TaskId>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            started_at: now,
            updated_at: now,
            wave_index: 0,
            backlog,
            in_flight: Vec::new(),
            completed_ids: Vec::new(),
            failed_ids: Vec::new(),
            last_errors: BTreeMap::new(),
            branches: BTreeMap::new(),
        }
    }

    fn remove_everywhere(&mut self, id: &TaskId) {
        self.backlog.retain(|t| t != id);
        self.in_flight.retain(|t| t != id);
        self.completed_ids.retain(|t| t != id);
        self.failed_ids.retain(|t| t != id);
    }

    pub fn mark_dispatched(&mut self, id: &TaskId, branch: &str) {
        self.remove_everywhere(id);
        self.in_flight.push(id.clone());
        self.branches.insert(id.to_string(), branch.to_string());
        self.updated_at = Utc::now();
    }

    /// The only path into `completed_ids`: a merged outcome.
    pub fn record_merged(&mut self, id: &TaskId) {
        self.remove_everywhere(id);
        self.completed_ids.push(id.clone());
        self.last_errors.remove(id.as_str());
        self.branches.remove(id.as_str());
        self.updated_at = Utc::now();
    }

    pub fn record_failed(&mut self, id: &TaskId, error: impl Into<String>) {
        self.remove_everywhere(id);
        self.failed_ids.push(id.clone());
        self.last_errors.insert(id.to_string(), error.into());
        self.updated_at = Utc::now();
    }

    /// Resume semantics: tasks dispatched by a previous run but with no
    /// recorded outcome are ambiguous, so they return to the backlog
    /// rather than being promoted to completed or failed.
    pub fn requeue_in_flight(&mut self) {
        let ambiguous = std::mem::take(&mut self.in_flight);
        for id in ambiguous.into_iter().rev() {
            rlog!("Resume: re-queueing ambiguous in-flight task {}", id);
            self.backlog.insert(0, id);
        }
        self.updated_at = Utc::now();
    }

    pub fn advance_wave(&mut self) {
        self.wave_index += 1;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        self.backlog.is_empty() && self.in_flight.is_empty()
    }

    pub fn total(&self) -> usize {
        self.backlog.len() + self.in_flight.len() + self.completed_ids.len() + self.failed_ids.len()
    }
}

/// Atomic-replace snapshot store. Single owner; a reader never observes
/// a half-written file.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn load(&self) -> Result<Option<OrchestratorState>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&self.path)?;
        let state: OrchestratorState = serde_json::from_str(&content)?;
        rlog_debug!(
            "Loaded state run_id={} backlog={} in_flight={} completed={} failed={}",
            state.run_id,
            state.backlog.len(),
            state.in_flight.len(),
            state.completed_ids.len(),
            state.failed_ids.len()
        );
        Ok(Some(state))
    }

    pub fn save(&self, state: &OrchestratorState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(state)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}
