//! Heuristic conflict scoring for task pairs.
//!
//! The scorer estimates how likely two tasks are to produce merge
//! conflicts if run concurrently, from their file-touch hints and
//! semantic tags. Its output is advisory: the merge coordinator's
//! single-writer discipline is the actual safety mechanism, scoring
//! only reduces wasted concurrent work.

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::task::Task;

/// Coarse classification of a task pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Safe to run in the same wave.
    ParallelSafe,
    /// Should run in sequence within the same run (different waves).
    Ordered,
    /// Must not run concurrently, and ideally not adjacently without an
    /// explicit ordering between them.
    HighConflict,
}

impl std::fmt::Display for Verdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Verdict::ParallelSafe => write!(f, "parallel-safe"),
            Verdict::Ordered => write!(f, "ordered"),
            Verdict::HighConflict => write!(f, "high-conflict"),
        }
    }
}

/// Weights and thresholds for the scoring formula.
///
/// The weighting of overlap ratio against the semantic signals is a
/// tunable policy discovered through prior art in this domain, not a
/// provably optimal formula; keep it in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringConfig {
    /// Overlaps smaller than this many shared files are treated as
    /// incidental noise, unless the smaller hint set is fully contained
    /// in the larger one.
    pub min_shared_files: usize,
    /// Scores below this are parallel-safe.
    pub conflict_threshold: f64,
    /// Scores at or above this are high-conflict.
    pub high_conflict_threshold: f64,
    /// Weight of the file-overlap ratio.
    pub overlap_weight: f64,
    /// Weight of the shared-directory signal.
    pub directory_weight: f64,
    /// Weight of the category-match signal.
    pub category_weight: f64,
    /// Assumed score when either task has no file hints. Conservative:
    /// a hintless task is never parallel-safe by default.
    pub missing_hint_score: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            min_shared_files: 2,
            conflict_threshold: 0.3,
            high_conflict_threshold: 0.7,
            overlap_weight: 0.6,
            directory_weight: 0.25,
            category_weight: 0.15,
            missing_hint_score: 0.5,
        }
    }
}

/// A scored task pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictScore {
    /// Weighted score in [0, 1].
    pub score: f64,
    /// Share of the smaller hint set that both tasks touch.
    pub overlap_ratio: f64,
    /// Classification against the configured thresholds.
    pub verdict: Verdict,
}

impl ConflictScore {
    pub fn is_parallel_safe(&self) -> bool {
        self.verdict == Verdict::ParallelSafe
    }
}

/// Pure pairwise scorer. Holds only configuration; safe to share.
#[derive(Debug, Clone, Default)]
pub struct ConflictScorer {
    config: ScoringConfig,
}

impl ConflictScorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    /// Score a pair of tasks.
    ///
    /// The overlap ratio is computed against the smaller hint set, so a
    /// small task entirely swallowed by a large one still scores high.
    /// Overlaps below `min_shared_files` are dropped as noise unless
    /// they cover the whole smaller set.
    pub fn score_pair(&self, a: &Task, b: &Task) -> ConflictScore {
        if !a.has_hints() || !b.has_hints() {
            // No data to reason about: assume moderate conflict rather
            // than risking an accidental concurrent collision.
            let score = self.config.missing_hint_score;
            return ConflictScore {
                score,
                overlap_ratio: 0.0,
                verdict: self.classify(score),
            };
        }

        let files_a: HashSet<&str> = a.files.iter().map(String::as_str).collect();
        let files_b: HashSet<&str> = b.files.iter().map(String::as_str).collect();
        let shared = files_a.intersection(&files_b).count();
        let smaller = files_a.len().min(files_b.len());

        let full_containment = shared > 0 && shared == smaller;
        let overlap_ratio = if shared == 0 {
            0.0
        } else if shared < self.config.min_shared_files && !full_containment {
            // Incidental single-file overlap between two broad tasks.
            0.0
        } else {
            shared as f64 / smaller as f64
        };

        let directory = if shares_directory(&a.files, &b.files) {
            1.0
        } else {
            0.0
        };
        let category = match (&a.category, &b.category) {
            (Some(x), Some(y)) if x == y => 1.0,
            _ => 0.0,
        };

        let score = (self.config.overlap_weight * overlap_ratio
            + self.config.directory_weight * directory
            + self.config.category_weight * category)
            .clamp(0.0, 1.0);

        ConflictScore {
            score,
            overlap_ratio,
            verdict: self.classify(score),
        }
    }

    fn classify(&self, score: f64) -> Verdict {
        if score >= self.config.high_conflict_threshold {
            Verdict::HighConflict
        } else if score >= self.config.conflict_threshold {
            Verdict::Ordered
        } else {
            Verdict::ParallelSafe
        }
    }
}

/// True if any hint from `a` lives in the same immediate directory as a
/// hint from `b`.
fn shares_directory(a: &[String], b: &[String]) -> bool {
    let dirs_a: HashSet<&Path> = a.iter().filter_map(|f| Path::new(f).parent()).collect();
    b.iter()
        .filter_map(|f| Path::new(f).parent())
        .any(|d| dirs_a.contains(d))
}
