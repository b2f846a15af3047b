use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::foreman_config::{CONFIG_FILE, ForemanToml};

/// Environment variable that overrides the default workspace location.
pub const WORKSPACE_ENV: &str = "FOREMAN_WORKSPACE";

const STATE_FILE: &str = "projects.json";

/// Runtime paths for one Foreman workspace.
///
/// The workspace holds the worker state document, its lock file, the
/// `foreman.toml` configuration and the log directory.
#[derive(Debug, Clone)]
pub struct Config {
    pub workspace: PathBuf,
    pub state_file: PathBuf,
    pub lock_file: PathBuf,
    pub config_file: PathBuf,
    pub log_dir: PathBuf,
    pub audit_file: PathBuf,
    pub verbose: bool,
}

impl Config {
    /// Resolve the workspace: explicit path, then `FOREMAN_WORKSPACE`, then
    /// `~/.foreman`.
    pub fn new(workspace: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let workspace = match workspace {
            Some(path) => path,
            None => match std::env::var_os(WORKSPACE_ENV) {
                Some(path) if !path.is_empty() => PathBuf::from(path),
                _ => dirs::home_dir()
                    .context("Could not determine home directory; pass --workspace")?
                    .join(".foreman"),
            },
        };
        Ok(Self::at(workspace, verbose))
    }

    /// Paths rooted at `workspace` without consulting the environment.
    pub fn at(workspace: impl Into<PathBuf>, verbose: bool) -> Self {
        let workspace = workspace.into();
        let state_file = workspace.join(STATE_FILE);
        let lock_file = workspace.join(format!("{}.lock", STATE_FILE));
        let config_file = workspace.join(CONFIG_FILE);
        let log_dir = workspace.join("log");
        let audit_file = log_dir.join("audit.jsonl");
        Self {
            workspace,
            state_file,
            lock_file,
            config_file,
            log_dir,
            audit_file,
            verbose,
        }
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.workspace)
            .with_context(|| format!("Failed to create workspace {}", self.workspace.display()))?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }

    /// Load `foreman.toml`, or defaults when the workspace has none.
    pub fn load_settings(&self) -> Result<ForemanToml> {
        ForemanToml::load_or_default(&self.workspace).with_context(|| {
            format!("Failed to load config from {}", self.config_file.display())
        })
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace
    }
}
