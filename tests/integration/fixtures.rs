//! Test fixtures for integration tests.
//!
//! Provides helpers for:
//! - Creating temporary git repositories
//! - Wiring up an orchestrator with test-local configuration
//! - A per-task shell script standing in for the real executor

use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use riptide::config::Config;
use riptide::executor::CommandExecutor;
use riptide::git::RepoGit;
use riptide::orchestrator::Orchestrator;
use riptide::pool::PoolConfig;
use riptide::state::StateStore;
use riptide::task::Backlog;

/// A test repository with a temporary directory and initialized git.
pub struct TestRepo {
    /// The temporary directory containing the repo.
    pub temp_dir: TempDir,
    /// Path to the repository root.
    pub path: PathBuf,
}

impl TestRepo {
    /// Create a new test repository with an initial commit on `main`.
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let path = temp_dir.path().join("repo");
        std::fs::create_dir_all(&path).expect("Failed to create repo dir");

        git(&path, &["init"]);
        git(&path, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&path, &["config", "user.email", "test@test.com"]);
        git(&path, &["config", "user.name", "Test User"]);

        std::fs::write(path.join("README.md"), "# Test Repository\n")
            .expect("Failed to write README");
        git(&path, &["add", "."]);
        git(&path, &["commit", "-m", "Initial commit"]);

        Self { temp_dir, path }
    }

    pub fn has_file(&self, rel: &str) -> bool {
        self.path.join(rel).exists()
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.path.join(rel)).expect("Failed to read file")
    }

    pub fn branch_exists(&self, name: &str) -> bool {
        Command::new("git")
            .args(["rev-parse", "--verify", &format!("refs/heads/{}", name)])
            .current_dir(&self.path)
            .output()
            .expect("Failed to run git")
            .status
            .success()
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.temp_dir.path().join("workspaces")
    }

    pub fn state_path(&self) -> PathBuf {
        self.temp_dir.path().join("state.json")
    }
}

fn git(path: &std::path::Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(path)
        .output()
        .expect("Failed to run git");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

/// Test configuration pointing everything at the repo's temp dir.
pub fn test_config(repo: &TestRepo) -> Config {
    let mut config = Config {
        target_branch: Some("main".to_string()),
        workspace_dir: Some(repo.workspaces_dir().to_string_lossy().to_string()),
        ..Config::default()
    };
    config.pool = PoolConfig {
        max_workers: 4,
        task_timeout_secs: 30,
        grace_secs: 0,
    };
    config
}

pub fn state_store(repo: &TestRepo) -> StateStore {
    StateStore::new(repo.state_path())
}

/// Build an orchestrator whose executor runs `command` via `sh -c` in
/// each task's workspace, with RIPTIDE_TASK_ID set.
pub fn orchestrator(
    repo: &TestRepo,
    config: &Config,
    backlog: Backlog,
    command: &str,
    cancel: CancellationToken,
) -> Orchestrator {
    let git = RepoGit::new(&repo.path).expect("Failed to open repo");
    let executor = Arc::new(CommandExecutor::new(
        RepoGit::new(&repo.path).expect("Failed to open repo"),
        command,
    ));
    Orchestrator::new(config, backlog, git, executor, state_store(repo), cancel)
        .expect("Failed to build orchestrator")
}
