//! End-to-end wave scheduling: conflict-driven wave splits, dependency
//! ordering, and blocked-chain reporting through the full orchestrator.

use std::collections::HashSet;

use tokio_util::sync::CancellationToken;

use riptide::scheduler::WaveScheduler;
use riptide::scoring::{ConflictScorer, ScoringConfig};
use riptide::task::{Backlog, Task, TaskId};

use crate::fixtures::{orchestrator, test_config, TestRepo};

fn backlog(tasks: Vec<Task>) -> Backlog {
    Backlog { tasks }
}

#[tokio::test]
async fn test_independent_tasks_complete_in_one_wave() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("a", "a").with_files(["src/a.rs"]),
        Task::new("b", "b").with_files(["docs/b.md"]),
    ]);

    let mut orch = orchestrator(
        &repo,
        &config,
        tasks,
        "echo done > \"$RIPTIDE_TASK_ID.txt\"",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();

    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.waves_run, 1);
    assert_eq!(report.completed.len(), 2);
    assert!(repo.has_file("a.txt"));
    assert!(repo.has_file("b.txt"));
}

#[tokio::test]
async fn test_total_hint_overlap_forces_separate_waves() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    // a and b both hint config.py; the rest are disjoint.
    let tasks = vec![
        Task::new("a", "a").with_files(["config.py"]),
        Task::new("b", "b").with_files(["config.py"]),
        Task::new("c", "c").with_files(["src/c.rs"]),
        Task::new("d", "d").with_files(["docs/d.md"]),
        Task::new("e", "e").with_files(["tests/e.rs"]),
    ];

    // The planner itself must split a and b.
    let scheduler = WaveScheduler::new(ConflictScorer::new(ScoringConfig::default()), 8);
    let waves = scheduler.plan_all(&tasks).unwrap();
    for wave in &waves {
        let members: HashSet<&str> = wave.task_ids.iter().map(|t| t.as_str()).collect();
        assert!(
            !(members.contains("a") && members.contains("b")),
            "a and b share wave {}",
            wave.index
        );
    }

    // And the full run still completes everything.
    let mut orch = orchestrator(
        &repo,
        &config,
        backlog(tasks),
        "echo done > \"out-$RIPTIDE_TASK_ID.txt\"",
        CancellationToken::new(),
    );
    let report = orch.run().await.unwrap();
    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.completed.len(), 5);
    assert!(report.waves_run >= 2);
}

#[tokio::test]
async fn test_dependency_runs_after_dependency_merged() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("a", "a").with_files(["a.txt"]),
        Task::new("b", "b")
            .with_files(["b.txt"])
            .with_dependencies(["a"]),
    ]);

    // b only succeeds if a's output is already merged into its base.
    let command = r#"
        case "$RIPTIDE_TASK_ID" in
            a) echo a > a.txt ;;
            b) test -f a.txt && echo b > b.txt ;;
        esac
    "#;
    let mut orch = orchestrator(&repo, &config, tasks, command, CancellationToken::new());
    let report = orch.run().await.unwrap();

    assert!(report.is_clean(), "report: {:?}", report);
    assert_eq!(report.waves_run, 2);
    assert!(repo.has_file("a.txt"));
    assert!(repo.has_file("b.txt"));
}

#[tokio::test]
async fn test_failed_dependency_blocks_chain_without_dropping_it() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = backlog(vec![
        Task::new("a", "a").with_files(["a.txt"]),
        Task::new("b", "b")
            .with_files(["b.txt"])
            .with_dependencies(["a"]),
        Task::new("c", "c")
            .with_files(["c.txt"])
            .with_dependencies(["b"]),
        Task::new("d", "d").with_files(["d.txt"]),
    ]);

    let command = r#"
        case "$RIPTIDE_TASK_ID" in
            a) exit 1 ;;
            *) echo ok > "$RIPTIDE_TASK_ID.txt" ;;
        esac
    "#;
    let mut orch = orchestrator(&repo, &config, tasks, command, CancellationToken::new());
    let report = orch.run().await.unwrap();

    assert_eq!(report.completed, vec![TaskId::new("d")]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].task_id, TaskId::new("a"));

    // The whole chain behind the failure is reported, never completed.
    let blocked: HashSet<&str> = report.blocked.iter().map(|b| b.task_id.as_str()).collect();
    assert_eq!(blocked, HashSet::from(["b", "c"]));
    // Blocked tasks stay in the backlog for a future resume.
    let state_backlog: HashSet<&str> =
        orch.state().backlog.iter().map(|t| t.as_str()).collect();
    assert_eq!(state_backlog, HashSet::from(["b", "c"]));
}

#[tokio::test]
async fn test_cyclic_backlog_refuses_to_start() {
    let repo = TestRepo::new();
    let config = test_config(&repo);
    let tasks = vec![
        Task::new("a", "a").with_dependencies(["b"]),
        Task::new("b", "b").with_dependencies(["a"]),
    ];

    let git = riptide::git::RepoGit::new(&repo.path).unwrap();
    let executor = std::sync::Arc::new(riptide::executor::CommandExecutor::new(
        riptide::git::RepoGit::new(&repo.path).unwrap(),
        "true",
    ));
    let result = riptide::orchestrator::Orchestrator::new(
        &config,
        backlog(tasks),
        git,
        executor,
        crate::fixtures::state_store(&repo),
        CancellationToken::new(),
    );
    assert!(matches!(
        result.err(),
        Some(riptide::Error::CyclicDependency(_))
    ));
}
