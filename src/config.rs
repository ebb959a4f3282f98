//! Configuration loading and management
//!
//! Handles parsing of `.sak.toml` at the storage root. Every field has a
//! default, so a missing file is equivalent to an empty one.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Name of the configuration file inside a storage root
pub const CONFIG_FILE: &str = ".sak.toml";

/// Environment variable that forces captured task output to be echoed
pub const VERBOSE_ENV: &str = "SAK_VERBOSE";

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Metadata log configuration
    #[serde(default)]
    pub log: LogConfig,

    /// SQL index configuration
    #[serde(default)]
    pub index: IndexConfig,

    /// Index synchronization configuration
    #[serde(default)]
    pub sync: SyncConfig,

    /// Sync cursor lock configuration
    #[serde(default)]
    pub lock: LockConfig,

    /// Task execution configuration
    #[serde(default)]
    pub task: TaskConfig,
}

/// Which backend speaks the batch metadata protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogBackendKind {
    /// `git annex metadata --batch` subprocess
    #[default]
    Annex,
    /// In-process writer committing straight to the log branch
    Git,
}

/// Metadata log configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default)]
    pub backend: LogBackendKind,

    /// Branch holding the metadata files
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Executable used to launch `git annex`
    #[serde(default = "default_annex_command")]
    pub annex_command: String,
}

fn default_branch() -> String {
    "git-annex".to_string()
}

fn default_annex_command() -> String {
    "git".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            backend: LogBackendKind::default(),
            branch: default_branch(),
            annex_command: default_annex_command(),
        }
    }
}

/// SQL index configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Database file, relative to the storage root
    #[serde(default = "default_index_file")]
    pub file: String,

    /// SQLite busy timeout per connection
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

fn default_index_file() -> String {
    "db.sqlite".to_string()
}

fn default_busy_timeout_ms() -> u64 {
    5000
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            file: default_index_file(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// Index synchronization configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Changed keys mirrored per SQL transaction
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts per batch when the commit hits a transient error
    #[serde(default = "default_commit_retries")]
    pub commit_retries: u32,
}

fn default_batch_size() -> usize {
    256
}

fn default_commit_retries() -> u32 {
    3
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            commit_retries: default_commit_retries(),
        }
    }
}

/// Sync cursor lock configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LockConfig {
    /// Give up waiting for a concurrent sync after this long; unset waits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Task execution configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Echo captured task output to stderr while it is recorded
    #[serde(default)]
    pub echo_output: bool,
}

impl Config {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `<root>/.sak.toml` if present, then apply environment overrides.
    pub fn load_from_root(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_FILE);
        let mut config = if config_path.exists() {
            Self::load(&config_path)?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Ok(value) = std::env::var(VERBOSE_ENV) {
            let value = value.trim();
            if !value.is_empty() && value != "0" && !value.eq_ignore_ascii_case("false") {
                self.task.echo_output = true;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.log.branch.trim().is_empty() {
            return Err(Error::InvalidConfig("log.branch cannot be empty".to_string()));
        }
        if self.log.annex_command.trim().is_empty() {
            return Err(Error::InvalidConfig(
                "log.annex_command cannot be empty".to_string(),
            ));
        }
        if self.index.file.trim().is_empty() {
            return Err(Error::InvalidConfig("index.file cannot be empty".to_string()));
        }
        if self.sync.batch_size == 0 {
            return Err(Error::InvalidConfig(
                "sync.batch_size must be at least 1".to_string(),
            ));
        }
        if self.sync.commit_retries == 0 {
            return Err(Error::InvalidConfig(
                "sync.commit_retries must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Default storage root: `$HOME/sak`
pub fn default_root() -> Result<PathBuf> {
    directories::BaseDirs::new()
        .map(|dirs| dirs.home_dir().join("sak"))
        .ok_or_else(|| Error::InvalidConfig("could not determine home directory".to_string()))
}
