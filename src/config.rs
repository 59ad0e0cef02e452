use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Upper bound on tasks running at once inside one orchestration.
    pub max_concurrency: usize,
    /// How often an unavailable runner is retried before the task fails.
    pub dispatch_retries: u32,
    pub retry_backoff_ms: u64,
    pub bind_addr: String,
    /// Directory for persisted orchestration records. Unset disables persistence.
    pub state_dir: Option<String>,
    pub log_file: Option<String>,
    pub runner: RunnerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub command: String,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            dispatch_retries: 2,
            retry_backoff_ms: 250,
            bind_addr: "127.0.0.1:7878".to_string(),
            state_dir: None,
            log_file: None,
            runner: RunnerConfig::default(),
        }
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            command: "claude -p".to_string(),
            timeout_secs: 600,
        }
    }
}

impl RunnerConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    pub fn fanout_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".fanout"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::fanout_dir()?.join("fanout.toml"))
    }

    pub fn state_dir(&self) -> Option<PathBuf> {
        self.state_dir.as_deref().map(expand_tilde)
    }

    pub fn log_file(&self) -> Option<PathBuf> {
        self.log_file.as_deref().map(expand_tilde)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    /// Load from the default location, falling back to defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Config::load");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        config.validate()?;
        debug!(
            max_concurrency = config.max_concurrency,
            dispatch_retries = config.dispatch_retries,
            state_dir = ?config.state_dir,
            runner = %config.runner.command,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.exists()) {
            fs::create_dir_all(dir)?;
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_concurrency(self.max_concurrency)?;
        if self.runner.command.trim().is_empty() {
            return Err(Error::Validation("runner.command must not be empty".into()));
        }
        Ok(())
    }
}

pub fn validate_concurrency(limit: usize) -> Result<()> {
    if limit == 0 {
        return Err(Error::Validation(
            "max_concurrency must be at least 1".into(),
        ));
    }
    Ok(())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
