//! Failure recovery: timeouts, resume from a snapshot, cancellation,
//! and startup reconciliation of stale workspaces.

use tokio_util::sync::CancellationToken;

use riptide::pool::PoolConfig;
use riptide::state::OrchestratorState;
use riptide::task::{Backlog, Task, TaskId};

use crate::fixtures::{orchestrator, state_store, test_config, TestRepo};

fn backlog(tasks: Vec<Task>) -> Backlog {
    Backlog { tasks }
}

#[tokio::test]
async fn test_timeout_fails_task_and_cleans_workspace() {
    let repo = TestRepo::new();
    let mut config = test_config(&repo);
    config.pool = PoolConfig {
        max_workers: 4,
        task_timeout_secs: 1,
        grace_secs: 0,
    };
    let tasks = backlog(vec![
        Task::new("fast", "fast").with_files(["f.txt"]),
        Task::new("slow", "slow").with_files(["s.txt"]),
    ]);

    let command = r#"
        case "$RIPTIDE_TASK_ID" in
            slow) sleep 30 ;;
            *) echo ok > "$RIPTIDE_TASK_ID.txt" ;;
        esac
    "#;
    let mut orch = orchestrator(&repo, &config, tasks, command, CancellationToken::new());
    let report = orch.run().await.unwrap();

    assert_eq!(report.completed, vec![TaskId::new("fast")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, TaskId::new("slow"));
    assert!(report.failed[0].error.contains("timed out"));

    // The timed-out workspace is cleaned up, not retained indefinitely.
    assert!(!repo.workspaces_dir().join("task-slow").exists());
    assert!(!repo.branch_exists("riptide/task/slow"));
}

#[tokio::test]
async fn test_resume_does_not_rerun_completed_tasks() {
    let repo = TestRepo::new();
    let config = test_config(&repo);

    // Snapshot from an earlier run: a and b already merged, c pending.
    let mut prior = OrchestratorState::new(vec![TaskId::new("c")]);
    prior.completed_ids = vec![TaskId::new("a"), TaskId::new("b")];
    state_store(&repo).save(&prior).unwrap();

    let tasks = backlog(vec![
        Task::new("a", "a").with_files(["a.txt"]),
        Task::new("b", "b").with_files(["b.txt"]),
        Task::new("c", "c").with_files(["c.txt"]),
    ]);
    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo ran > \"ran-$RIPTIDE_TASK_ID.txt\"",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    // Only c executed; a and b kept their completed status.
    assert!(repo.has_file("ran-c.txt"));
    assert!(!repo.has_file("ran-a.txt"));
    assert!(!repo.has_file("ran-b.txt"));
    let completed: Vec<&str> = report.completed.iter().map(|t| t.as_str()).collect();
    assert_eq!(completed.len(), 3);
    assert_eq!(report.run_id, prior.run_id);
}

#[tokio::test]
async fn test_ambiguous_in_flight_task_is_requeued_and_rerun() {
    let repo = TestRepo::new();
    let config = test_config(&repo);

    // A crash left x dispatched with no recorded outcome.
    let mut prior = OrchestratorState::new(Vec::new());
    prior.mark_dispatched(&TaskId::new("x"), "riptide/task/x");
    state_store(&repo).save(&prior).unwrap();

    let tasks = backlog(vec![Task::new("x", "x").with_files(["x.txt"])]);
    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo x > x.txt",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    assert_eq!(report.completed, vec![TaskId::new("x")]);
    assert!(report.ambiguous.is_empty());
    assert!(repo.has_file("x.txt"));
}

#[tokio::test]
async fn test_startup_reconciliation_removes_stale_workspace() {
    let repo = TestRepo::new();
    let config = test_config(&repo);

    let stale = repo.workspaces_dir().join("task-ghost");
    std::fs::create_dir_all(&stale).unwrap();
    std::fs::write(stale.join("leftover.txt"), "stale").unwrap();

    let tasks = backlog(vec![Task::new("real", "real").with_files(["r.txt"])]);
    let orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo r > r.txt",
        CancellationToken::new(),
    );

    // Reconciliation happens during construction, before any dispatch.
    assert!(!stale.exists());
    drop(orch);
}

/// A conflict-losing task keeps its branch across a resume: the failed
/// task is still referenced by saved state, so startup reconciliation
/// must not sweep it.
#[tokio::test]
async fn test_conflict_branch_survives_resume() {
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
    assert_eq!(report.failed.len(), 1);
    let loser_branch = report.failed[0]
        .branch
        .clone()
        .expect("loser branch recorded");
    assert!(repo.branch_exists(&loser_branch));
    // A run with failures keeps its snapshot live instead of archiving.
    assert!(repo.state_path().exists());
    drop(orch);

    // A later invocation resumes from the snapshot; construction runs
    // the startup sweep, which must leave the preserved branch alone.
    let next = orchestrator(
        &repo,
        &config,
        backlog(vec![
            Task::new("w1", "w1").with_files(["docs/one.md"]),
            Task::new("w2", "w2").with_files(["src/two.rs"]),
        ]),
        "echo \"$RIPTIDE_TASK_ID\" > conflict.txt",
        CancellationToken::new(),
    );
    assert!(repo.branch_exists(&loser_branch));
    drop(next);
}

#[tokio::test]
async fn test_cancellation_before_dispatch_leaves_backlog_intact() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("a", "a").with_files(["a.txt"]),
        Task::new("b", "b").with_files(["b.txt"]),
    ]);

    let cancel = CancellationToken::new();
    cancel.cancel();
    let mut orch = orchestrator(&repo, &config, tasks, "echo hi", cancel);
    let report = orch.run().await.unwrap();

    assert!(report.interrupted);
    assert!(report.completed.is_empty());
    assert_eq!(orch.state().backlog.len(), 2);
    // Snapshot survives for the resumed run.
    assert!(repo.state_path().exists());
}
