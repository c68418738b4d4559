//! Serialized merge integration: conflicts, the completed-only-via-merge
//! invariant, identical-change auto-resolution, and state archiving.

use tokio_util::sync::CancellationToken;

use riptide::task::{Backlog, Task, TaskId};

use crate::fixtures::{orchestrator, test_config, TestRepo};

fn backlog(tasks: Vec<Task>) -> Backlog {
    Backlog { tasks }
}

/// Two tasks whose hints claim disjoint files but which both write the
/// same file. Scoring is advisory, so they share a wave; the merge
/// coordinator is the safety net that catches the real conflict.
#[tokio::test]
async fn test_real_conflict_fails_one_task_and_preserves_its_branch() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("w1", "w1").with_files(["docs/one.md"]),
        Task::new("w2", "w2").with_files(["src/two.rs"]),
    ]);

    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo \"$RIPTIDE_TASK_ID\" > conflict.txt",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.completed.len(), 1, "report: {:?}", report);
    assert_eq!(report.failed.len(), 1);

    let winner = report.completed[0].as_str();
    let loser = &report.failed[0];
    assert_ne!(winner, loser.task_id.as_str());

    // The target holds exactly the winner's change; the loser's branch
    // survives for a manual or automated retry.
    assert_eq!(repo.read("conflict.txt").trim(), winner);
    assert!(loser.error.contains("conflict"));
    let loser_branch = loser.branch.as_deref().expect("loser branch recorded");
    assert!(repo.branch_exists(loser_branch));
}

/// Regression guard: a worker finishing successfully is not enough to
/// be completed; only a merged outcome is.
#[tokio::test]
async fn test_completed_requires_merged_outcome_not_wave_success() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("w1", "w1").with_files(["docs/one.md"]),
        Task::new("w2", "w2").with_files(["src/two.rs"]),
    ]);

    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo \"$RIPTIDE_TASK_ID\" > conflict.txt",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    // Both workers exited 0, yet only the merged one is completed.
    assert_eq!(report.completed.len() + report.failed.len(), 2);
    let completed: Vec<&str> = report.completed.iter().map(|t| t.as_str()).collect();
    for failure in &report.failed {
        assert!(
            !completed.contains(&failure.task_id.as_str()),
            "task in both completed and failed"
        );
    }
}

#[tokio::test]
async fn test_identical_concurrent_change_merges_both() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("w1", "w1").with_files(["docs/one.md"]),
        Task::new("w2", "w2").with_files(["src/two.rs"]),
    ]);

    // Mechanically equivalent diffs: same file, same content.
    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo same > generated.txt",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.completed.len(), 2);
    assert_eq!(repo.read("generated.txt").trim(), "same");
}

#[tokio::test]
async fn test_no_work_needed_task_completes_via_empty_merge() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![Task::new("noop", "noop").with_files(["x.rs"])]);

    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "touch .riptide-close",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.completed, vec![TaskId::new("noop")]);
}

#[tokio::test]
async fn test_terminal_run_archives_state_snapshot() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![Task::new("only", "only").with_files(["o.txt"])]);

    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo o > o.txt",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();
    assert!(report.is_clean());

    // The live snapshot is archived, not left behind.
    assert!(!repo.state_path().exists());
    let archive = repo
        .temp_dir
        .path()
        .join("completed")
        .join(format!("run-{}.json", report.run_id));
    assert!(archive.exists());
    let content = std::fs::read_to_string(archive).unwrap();
    assert!(content.contains("only"));
}

#[tokio::test]
async fn test_merged_workspace_and_branch_are_released() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![Task::new("tidy", "tidy").with_files(["t.txt"])]);

    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo t > t.txt",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();
    assert!(report.is_clean());

    assert!(!repo.workspaces_dir().join("task-tidy").exists());
    assert!(!repo.branch_exists("riptide/task/tidy"));
}
