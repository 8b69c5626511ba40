use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::{Error, Result};

/// Default token budget per execution batch, leaving headroom under the
/// agent's context ceiling.
pub const DEFAULT_TOKEN_BUDGET: u32 = 120_000;

/// Default control-plane poll period in seconds.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default heartbeat staleness threshold in seconds.
pub const DEFAULT_HEARTBEAT_STALENESS_SECS: i64 = 120;

/// Default retry ceiling for scheduled queue entries.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default backoff base in seconds (doubled per attempt).
pub const DEFAULT_BACKOFF_BASE_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Override for the tracking database location.
    pub db_path: Option<String>,
    #[serde(default = "default_token_budget")]
    pub token_budget: u32,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_heartbeat_staleness_secs")]
    pub heartbeat_staleness_secs: i64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_base_secs")]
    pub backoff_base_secs: i64,
}

fn default_token_budget() -> u32 {
    DEFAULT_TOKEN_BUDGET
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

fn default_heartbeat_staleness_secs() -> i64 {
    DEFAULT_HEARTBEAT_STALENESS_SECS
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

fn default_backoff_base_secs() -> i64 {
    DEFAULT_BACKOFF_BASE_SECS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            token_budget: DEFAULT_TOKEN_BUDGET,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            heartbeat_staleness_secs: DEFAULT_HEARTBEAT_STALENESS_SECS,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            backoff_base_secs: DEFAULT_BACKOFF_BASE_SECS,
        }
    }
}

impl Config {
    pub fn braid_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir().ok_or(Error::NoHomeDir)?.join(".braid"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::braid_dir()?.join("braid.toml"))
    }

    /// Resolve the database path, honoring the config override.
    pub fn db_path(&self) -> Result<PathBuf> {
        match &self.db_path {
            Some(path) => Ok(expand_tilde(path)),
            None => Ok(Self::braid_dir()?.join("braid.db")),
        }
    }

    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(&path)?)?;
        debug!(
            token_budget = config.token_budget,
            poll_interval_secs = config.poll_interval_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let dir = Self::braid_dir()?;
        if !dir.exists() {
            fs::create_dir_all(&dir)?;
        }
        fs::write(Self::config_path()?, toml::to_string_pretty(self)?)?;
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
