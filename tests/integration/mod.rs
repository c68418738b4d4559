//! Integration test suite for riptide.
//!
//! These tests drive the real orchestrator against real temporary git
//! repositories, with the production command executor running shell
//! snippets in place of a heavyweight task runner.
//!
//! # Test Categories
//!
//! - `scheduling`: wave partitioning and dependency ordering end to end
//! - `merge_pipeline`: serialized integration, conflicts, archiving
//! - `recovery`: timeouts, resume, cancellation and reconciliation

mod fixtures;

mod merge_pipeline;
mod recovery;
mod scheduling;
