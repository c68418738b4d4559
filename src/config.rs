use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::merge::MergeConfig;
use crate::pool::PoolConfig;
use crate::scoring::ScoringConfig;
use crate::{rlog_debug, Error, Result};

/// Top-level configuration, loaded from ~/.riptide/riptide.toml.
///
/// Every section has serde defaults so a partial (or absent) config file
/// still yields a usable setup. Thresholds and weights are configuration
/// rather than constants so they can be tuned per project.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Branch that completed task branches are merged into.
    pub target_branch: Option<String>,
    /// Override for the workspace (worktree) parent directory.
    pub workspace_dir: Option<String>,
    /// Shell command the default executor runs inside each workspace.
    pub command: Option<String>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub merge: MergeConfig,
}

impl Config {
    pub fn riptide_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".riptide"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::riptide_dir()?.join("riptide.toml"))
    }

    pub fn default_state_path() -> Result<PathBuf> {
        Ok(Self::riptide_dir()?.join("state.json"))
    }

    pub fn workspaces_dir(&self) -> Result<PathBuf> {
        match &self.workspace_dir {
            Some(dir) => Ok(expand_tilde(dir)),
            None => Ok(Self::riptide_dir()?.join("workspaces")),
        }
    }

    pub fn effective_target_branch(&self) -> &str {
        self.target_branch.as_deref().unwrap_or("main")
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        rlog_debug!("Config::load path={}", path.display());
        if !path.exists() {
            rlog_debug!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        rlog_debug!(
            "Config loaded: target_branch={:?} workspace_dir={:?} command={:?}",
            config.target_branch,
            config.workspace_dir,
            config.command
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::riptide_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        let path = Self::config_path()?;
        fs::write(&path, toml::to_string_pretty(self)?)?;
        rlog_debug!("Config saved to {}", path.display());
        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        let dir = Self::riptide_dir()?;
        let workspaces = self.workspaces_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        if !workspaces.exists() {
            fs::create_dir_all(&workspaces)?;
        }
        Ok(())
    }
}

fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
