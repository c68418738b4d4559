//! riptide: conflict-aware parallel task execution with serialized
//! merge integration.
//!
//! A backlog of tasks is partitioned into waves of pairwise
//! parallel-safe work, each task runs in its own git worktree on its
//! own branch, and a single-writer merge coordinator folds completed
//! branches back into the target branch one at a time. Orchestration
//! state is persisted after every merge decision so an interrupted run
//! resumes without repeating finished work.

pub mod config;
pub mod error;
pub mod executor;
pub mod git;
pub mod log;
pub mod merge;
pub mod orchestrator;
pub mod pool;
pub mod scheduler;
pub mod scoring;
pub mod state;
pub mod task;
pub mod worktree;

pub use config::Config;
pub use error::{Error, Result};
pub use task::{Backlog, Priority, Task, TaskId};
