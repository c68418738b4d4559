use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Git error: {0}")]
    Git(#[from] git2::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Scheduling error: {0}")]
    Scheduling(String),

    #[error("Cyclic dependency involving task: {0}")]
    CyclicDependency(String),

    #[error("Unknown dependency '{dep}' declared by task '{task}'")]
    UnknownDependency { task: String, dep: String },

    #[error("Execution failed for task {task}: {detail}")]
    Execution { task: String, detail: String },

    #[error("Task {task} timed out after {timeout:?}")]
    ExecutionTimeout {
        task: String,
        timeout: std::time::Duration,
    },

    #[error("Workspace error for task {task}: {detail}")]
    Workspace { task: String, detail: String },

    #[error("Merge conflict on branch {branch}: {files:?}")]
    MergeConflict { branch: String, files: Vec<String> },

    #[error("Repository corruption suspected: {0}")]
    RepositoryCorruption(String),

    #[error("Merges halted: circuit breaker open after {failures} consecutive failures")]
    MergeHalted { failures: u32 },

    #[error("Lifecycle move destination exists with different content: {0}")]
    LifecycleMove(String),

    #[error("Worker pool is full (max: {max})")]
    PoolFull { max: usize },

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Fatal errors abort the whole run; everything else is recorded
    /// against a single task and the run continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Scheduling(_)
                | Error::CyclicDependency(_)
                | Error::UnknownDependency { .. }
                | Error::RepositoryCorruption(_)
                | Error::MergeHalted { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
