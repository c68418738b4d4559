//! Task data model for the backlog.
//!
//! Tasks are the immutable work-item descriptors supplied by the task
//! source. Once scheduled they are read-only; all lifecycle bookkeeping
//! lives in the orchestrator state, not on the task itself.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::Result;

/// Unique identifier for a task, assigned by the task source.
///
/// IDs are opaque strings (e.g. "auth-101"); riptide never generates
/// them and never assumes a format beyond non-emptiness.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Priority tier for scheduling order within a wave plan.
///
/// Higher priorities are considered first when filling a wave. Ties are
/// broken by backlog insertion order, keeping scheduling deterministic.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

/// One unit of independent work to be applied to the shared tree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier from the task source.
    pub id: TaskId,
    /// Human-readable title.
    pub title: String,
    /// Priority tier.
    #[serde(default)]
    pub priority: Priority,
    /// Files this task is expected to touch. A hint, not a guarantee;
    /// used only for conflict scoring, never for correctness.
    #[serde(default)]
    pub files: Vec<String>,
    /// IDs of tasks that must be merged before this one may run.
    #[serde(default)]
    pub depends_on: Vec<TaskId>,
    /// Optional semantic category (section/subsystem), used as a
    /// secondary conflict signal.
    #[serde(default)]
    pub category: Option<String>,
}

impl Task {
    pub fn new(id: impl Into<TaskId>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            priority: Priority::default(),
            files: Vec::new(),
            depends_on: Vec::new(),
            category: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_dependencies<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<TaskId>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    /// Whether the task source provided any file hints at all.
    pub fn has_hints(&self) -> bool {
        !self.files.is_empty()
    }
}

impl From<&str> for Task {
    fn from(id: &str) -> Self {
        Task::new(id, id)
    }
}

/// The ordered backlog of tasks supplied by the task source.
///
/// riptide consumes the backlog as an immutable iterable; the source file
/// is never rewritten.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Backlog {
    #[serde(default, rename = "task")]
    pub tasks: Vec<Task>,
}

impl Backlog {
    /// Load a backlog from a TOML file of `[[task]]` tables.
    pub fn load(path: &Path) -> Result<Self> {
        let backlog: Backlog = toml::from_str(&fs::read_to_string(path)?)?;
        Ok(backlog)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn get(&self, id: &TaskId) -> Option<&Task> {
        self.tasks.iter().find(|t| &t.id == id)
    }
}
