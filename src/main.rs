use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use riptide::config::Config;
use riptide::executor::CommandExecutor;
use riptide::git::RepoGit;
use riptide::orchestrator::{Orchestrator, RunReport};
use riptide::scheduler::WaveScheduler;
use riptide::scoring::ConflictScorer;
use riptide::state::StateStore;
use riptide::task::Backlog;
use riptide::worktree::WorktreeManager;
use riptide::{log, Error, Result};

#[derive(Parser)]
#[command(
    name = "riptide",
    version,
    about = "Conflict-aware parallel task execution with serialized merge integration"
)]
struct Cli {
    /// Enable debug logging (also RIPTIDE_DEBUG=1)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a backlog against a repository
    Run {
        /// Backlog TOML file of [[task]] tables
        backlog: PathBuf,
        /// Repository to operate on (default: current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Executor command, overriding the configured one
        #[arg(long)]
        command: Option<String>,
        /// Snapshot file, overriding the default location
        #[arg(long)]
        state: Option<PathBuf>,
        /// Maximum concurrent workers, overriding the configured value
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Show saved run state and the planned wave sequence
    Status {
        /// Backlog TOML file; when given, the wave plan is printed too
        backlog: Option<PathBuf>,
        /// Snapshot file, overriding the default location
        #[arg(long)]
        state: Option<PathBuf>,
    },
    /// Remove leftover workspaces and task branches
    Clean {
        /// Repository to operate on (default: current directory)
        #[arg(long)]
        repo: Option<PathBuf>,
        /// Also remove the saved run state
        #[arg(long)]
        all: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    log::init_with_debug(cli.debug);

    let result = match cli.command {
        Commands::Run {
            backlog,
            repo,
            command,
            state,
            max_workers,
        } => run(backlog, repo, command, state, max_workers).await,
        Commands::Status { backlog, state } => status(backlog, state),
        Commands::Clean { repo, all } => clean(repo, all),
    };

    if let Err(e) = result {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

async fn run(
    backlog_path: PathBuf,
    repo: Option<PathBuf>,
    command: Option<String>,
    state: Option<PathBuf>,
    max_workers: Option<usize>,
) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(command) = command {
        config.command = Some(command);
    }
    if let Some(max_workers) = max_workers {
        config.pool.max_workers = max_workers.max(1);
    }
    config.ensure_dirs()?;

    let backlog = Backlog::load(&backlog_path)?;
    if backlog.is_empty() {
        println!("Backlog is empty, nothing to run.");
        return Ok(());
    }

    let executor_command = config.command.clone().ok_or_else(|| {
        Error::Validation(
            "no executor command configured; set `command` in riptide.toml or pass --command"
                .to_string(),
        )
    })?;

    let repo_path = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let git = RepoGit::new(&repo_path)?;
    let executor = Arc::new(CommandExecutor::new(
        RepoGit::new(&repo_path)?,
        executor_command,
    ));
    let store = StateStore::new(match state {
        Some(path) => path,
        None => Config::default_state_path()?,
    });

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, finishing in-flight work...");
            signal_cancel.cancel();
        }
    });

    let mut orchestrator = Orchestrator::new(&config, backlog, git, executor, store, cancel)?;
    let report = orchestrator.run().await?;
    print_report(&report);

    if !report.is_clean() {
        std::process::exit(1);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("Run {} finished after {} wave(s).", report.run_id, report.waves_run);
    println!("  completed: {}", format_ids(&report.completed));
    if !report.failed.is_empty() {
        println!("  failed:");
        for failure in &report.failed {
            let branch = failure.branch.as_deref().unwrap_or("-");
            println!("    {} [{}]: {}", failure.task_id, branch, failure.error);
        }
    }
    if !report.blocked.is_empty() {
        println!("  blocked:");
        for blocked in &report.blocked {
            println!("    {}: {}", blocked.task_id, blocked.reason);
        }
    }
    if !report.ambiguous.is_empty() {
        println!("  ambiguous (re-run to retry):");
        for task in &report.ambiguous {
            let branch = task.branch.as_deref().unwrap_or("-");
            println!("    {} [{}]", task.task_id, branch);
        }
    }
    if report.interrupted {
        println!("  interrupted: resume with the same backlog to continue");
    }
}

fn format_ids(ids: &[riptide::TaskId]) -> String {
    if ids.is_empty() {
        "(none)".to_string()
    } else {
        ids.iter()
            .map(|id| id.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn status(backlog: Option<PathBuf>, state: Option<PathBuf>) -> Result<()> {
    let config = Config::load()?;
    let store = StateStore::new(match state {
        Some(path) => path,
        None => Config::default_state_path()?,
    });

    match store.load()? {
        Some(state) => {
            println!("Run {} (wave {})", state.run_id, state.wave_index);
            println!("  backlog:   {}", format_ids(&state.backlog));
            println!("  in-flight: {}", format_ids(&state.in_flight));
            println!("  completed: {}", format_ids(&state.completed_ids));
            println!("  failed:    {}", format_ids(&state.failed_ids));
            for (task, error) in &state.last_errors {
                println!("    {}: {}", task, error);
            }
        }
        None => println!("No saved run state."),
    }

    if let Some(backlog_path) = backlog {
        let backlog = Backlog::load(&backlog_path)?;
        let scheduler = WaveScheduler::new(
            ConflictScorer::new(config.scoring.clone()),
            config.pool.max_workers,
        );
        println!("Planned waves for {}:", backlog_path.display());
        for wave in scheduler.plan_all(&backlog.tasks)? {
            println!("  wave {}: {}", wave.index, format_ids(&wave.task_ids));
        }
    }
    Ok(())
}

fn clean(repo: Option<PathBuf>, all: bool) -> Result<()> {
    let config = Config::load()?;
    let repo_path = match repo {
        Some(path) => path,
        None => std::env::current_dir()?,
    };
    let manager = WorktreeManager::new(
        RepoGit::new(&repo_path)?,
        config.workspaces_dir()?,
        config.effective_target_branch(),
    );
    let removed = manager.reconcile(&HashSet::new())?;
    println!("Removed {} leftover workspace(s).", removed);

    if all {
        StateStore::new(Config::default_state_path()?).remove()?;
        println!("Removed saved run state.");
    }
    Ok(())
}
