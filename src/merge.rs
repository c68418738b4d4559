//! Single-writer integration of task branches into the target branch.
//!
//! The coordinator is the only actor that mutates the target branch.
//! Callers invoke `integrate` serially, in completion order; there is no
//! internal locking because the discipline is structural. Outcomes are
//! typed state transitions rather than exceptions, so retry and breaker
//! behavior are testable as pure data.

use std::time::Duration;

use git2::{build::CheckoutBuilder, BranchType, ErrorClass, ErrorCode, Repository};
use serde::{Deserialize, Serialize};

use crate::git::RepoGit;
use crate::pool::WorkerResult;
use crate::{rlog, rlog_debug, rlog_error, rlog_warn, Error, Result};

/// Stage bits of an index entry's flags field.
const STAGE_MASK: u16 = 0x3000;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Retries for transient (lock-class) failures within one attempt.
    pub max_retries: u32,
    /// Base backoff between transient retries, doubled each retry.
    pub backoff_ms: u64,
    /// Consecutive failed integrations that trip the circuit breaker.
    pub breaker_threshold: u32,
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 250,
            breaker_threshold: 3,
        }
    }
}

/// Terminal result of integrating one worker result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Changes are on the target branch.
    Merged { commit: String },
    /// Real content conflict; target restored, task branch preserved for
    /// a later manual or automated retry.
    ConflictUnresolved { files: Vec<String> },
    /// Transient failure that exhausted its in-run retries. Eligible for
    /// retry on resume.
    FailedRetryable { error: String, retries: u32 },
    /// Non-transient failure; retrying without intervention is pointless.
    FailedFatal { error: String },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }
}

/// Counts consecutive integration failures; trips at the threshold.
#[derive(Debug)]
pub struct CircuitBreaker {
    threshold: u32,
    consecutive: u32,
}

impl CircuitBreaker {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            consecutive: 0,
        }
    }

    pub fn record_success(&mut self) {
        self.consecutive = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive += 1;
        if self.is_tripped() {
            rlog_error!(
                "Circuit breaker tripped after {} consecutive merge failures",
                self.consecutive
            );
        }
    }

    pub fn is_tripped(&self) -> bool {
        self.consecutive >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }
}

pub struct MergeCoordinator {
    git: RepoGit,
    config: MergeConfig,
    target_branch: String,
    breaker: CircuitBreaker,
    recovery_attempted: bool,
}

impl MergeCoordinator {
    pub fn new(git: RepoGit, config: MergeConfig, target_branch: impl Into<String>) -> Self {
        let breaker = CircuitBreaker::new(config.breaker_threshold);
        Self {
            git,
            config,
            target_branch: target_branch.into(),
            breaker,
            recovery_attempted: false,
        }
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Manual breaker reset, for resumed runs.
    pub fn reset_breaker(&mut self) {
        self.breaker.reset();
        self.recovery_attempted = false;
    }

    /// Integrate one worker result into the target branch.
    ///
    /// Errors only when the circuit breaker halts the run; every
    /// per-task failure is a `MergeOutcome`, and the caller records it.
    pub async fn integrate(&mut self, result: &WorkerResult) -> Result<MergeOutcome> {
        if self.breaker.is_tripped() {
            self.try_recover()?;
        }

        let mut retries = 0;
        let outcome = loop {
            let error = match self.attempt(&result.workspace.branch, &result.task_id.to_string())
            {
                Ok(outcome) => break outcome,
                Err(e) => classify(e),
            };
            if is_transient(&error) {
                if retries < self.config.max_retries {
                    retries += 1;
                    let backoff = self.config.backoff_ms << (retries - 1);
                    rlog_warn!(
                        "Transient merge failure for {} (retry {}/{}): {}",
                        result.task_id,
                        retries,
                        self.config.max_retries,
                        error
                    );
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                    continue;
                }
                break MergeOutcome::FailedRetryable {
                    error: error.to_string(),
                    retries,
                };
            }
            if let Error::RepositoryCorruption(_) = &error {
                rlog_error!("Suspected repository corruption: {}", error);
            }
            break MergeOutcome::FailedFatal {
                error: error.to_string(),
            };
        };

        match &outcome {
            MergeOutcome::Merged { commit } => {
                rlog!("Merged {} into {} at {}", result.task_id, self.target_branch, commit);
                self.breaker.record_success();
                self.recovery_attempted = false;
            }
            other => {
                rlog_warn!("Integration of {} failed: {:?}", result.task_id, other);
                self.breaker.record_failure();
            }
        }
        Ok(outcome)
    }

    /// One automatic recovery attempt per trip: force the primary
    /// working tree back to a clean checkout of the target tip. If that
    /// does not hold, the run halts and must be resumed manually.
    fn try_recover(&mut self) -> Result<()> {
        if self.recovery_attempted {
            return Err(Error::MergeHalted {
                failures: self.breaker.consecutive_failures(),
            });
        }
        self.recovery_attempted = true;
        rlog_warn!("Attempting automatic merge recovery");

        let recovered = self
            .git
            .checkout_branch(&self.target_branch)
            .and_then(|_| self.git.branch_tip(&self.target_branch))
            .and_then(|tip| self.git.reset_hard(&tip));
        match recovered {
            Ok(()) => {
                rlog!("Merge recovery succeeded, resuming integrations");
                self.breaker.reset();
                Ok(())
            }
            Err(e) => {
                rlog_error!("Merge recovery failed: {}", e);
                Err(Error::MergeHalted {
                    failures: self.breaker.consecutive_failures(),
                })
            }
        }
    }

    /// One full merge attempt with stash discipline. Transient errors
    /// propagate for the retry loop; conflicts come back as outcomes.
    fn attempt(&self, branch: &str, task: &str) -> Result<MergeOutcome> {
        self.git.checkout_branch(&self.target_branch)?;
        let pre_commit = self.git.head_commit()?;

        // Local modifications incidental to bookkeeping must not leak
        // into the merge commit.
        let stashed = self.git.stash_push("riptide merge bookkeeping")?;

        let merged = self.merge_branch(branch, task, &pre_commit);

        if stashed {
            if let Err(e) = self.git.stash_pop() {
                // A conflicted pop leaves a half-applied working tree.
                // Clear that, but keep the stash entry: the stashed
                // modifications need explicit manual recovery, never a
                // silent drop.
                rlog_warn!(
                    "Stash pop conflicted ({}); working tree reset, entry kept for `git stash pop`",
                    e
                );
                let tip = self.git.head_commit()?;
                self.git.reset_hard(&tip)?;
            }
        }

        merged
    }

    fn merge_branch(&self, branch: &str, task: &str, pre_commit: &str) -> Result<MergeOutcome> {
        let repo = Repository::discover(self.git.repo_path())?;
        let branch_ref = repo.find_branch(branch, BranchType::Local)?;
        let branch_commit = branch_ref.into_reference().peel_to_commit()?;
        let annotated = repo.find_annotated_commit(branch_commit.id())?;

        let (analysis, _) = repo.merge_analysis(&[&annotated])?;
        if analysis.is_up_to_date() {
            return Ok(MergeOutcome::Merged {
                commit: pre_commit.to_string(),
            });
        }
        if analysis.is_fast_forward() {
            let refname = format!("refs/heads/{}", self.target_branch);
            repo.reference(
                &refname,
                branch_commit.id(),
                true,
                &format!("riptide: fast-forward to {}", task),
            )?;
            repo.set_head(&refname)?;
            repo.checkout_head(Some(CheckoutBuilder::new().force()))?;
            return Ok(MergeOutcome::Merged {
                commit: branch_commit.id().to_string(),
            });
        }

        repo.merge(&[&annotated], None, None)?;
        let mut index = repo.index()?;

        if index.has_conflicts() {
            let mut unresolved: Vec<String> = Vec::new();
            let mut equivalent = Vec::new();
            for conflict in index.conflicts()? {
                let conflict = conflict?;
                match (conflict.our, conflict.their) {
                    // Both sides made the identical change; mechanically
                    // equivalent, safe to take either.
                    (Some(our), Some(their)) if our.id == their.id => equivalent.push(our),
                    (our, their) => {
                        let path = our
                            .or(their)
                            .map(|e| String::from_utf8_lossy(&e.path).to_string())
                            .unwrap_or_default();
                        unresolved.push(path);
                    }
                }
            }

            if !unresolved.is_empty() {
                rlog_warn!(
                    "Merge of {} conflicts on {} file(s), aborting",
                    branch,
                    unresolved.len()
                );
                repo.cleanup_state()?;
                self.git.reset_hard(pre_commit)?;
                unresolved.sort();
                return Ok(MergeOutcome::ConflictUnresolved { files: unresolved });
            }

            for mut entry in equivalent {
                let path = String::from_utf8_lossy(&entry.path).to_string();
                rlog_debug!("Auto-resolving identical-change conflict on {}", path);
                index.remove_path(std::path::Path::new(&path))?;
                entry.flags &= !STAGE_MASK;
                index.add(&entry)?;
            }
            index.write()?;
        }

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = repo
            .signature()
            .or_else(|_| git2::Signature::now("Riptide", "riptide@localhost"))?;
        let head_commit = repo.head()?.peel_to_commit()?;
        let message = format!("Merge task {} ({})", task, branch);
        let commit_id = repo.commit(
            Some("HEAD"),
            &sig,
            &sig,
            &message,
            &tree,
            &[&head_commit, &branch_commit],
        )?;
        repo.cleanup_state()?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))?;

        Ok(MergeOutcome::Merged {
            commit: commit_id.to_string(),
        })
    }
}

/// Re-type git failures that point at a damaged index or object store.
/// These feed the breaker like any failure, but with the taxonomy the
/// report and log surface prominently.
fn classify(e: Error) -> Error {
    match e {
        Error::Git(g) if is_corruption(&g) => {
            Error::RepositoryCorruption(g.message().to_string())
        }
        other => other,
    }
}

fn is_corruption(g: &git2::Error) -> bool {
    // Lock contention also reports under the index class; that is
    // transient, not damage.
    if g.code() == ErrorCode::Locked || g.message().contains("lock") {
        return false;
    }
    g.class() == ErrorClass::Index
        || g.class() == ErrorClass::Odb
        || g.message().contains("corrupt")
}

/// Lock contention is the retryable class; everything else either has a
/// typed outcome or is genuinely fatal.
fn is_transient(e: &Error) -> bool {
    match e {
        Error::Git(g) => {
            g.code() == ErrorCode::Locked
                || (g.class() == ErrorClass::Filesystem && g.message().contains("lock"))
                || g.message().contains("index.lock")
        }
        Error::Io(_) => true,
        _ => false,
    }
}
