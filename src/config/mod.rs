//! Configuration
//!
//! A single TOML file, every key optional:
//!
//! ```toml
//! [storage]
//! database = "/var/lib/repowatch/repowatch.db"
//!
//! [workspace]
//! root = "/var/lib/repowatch/repositories"
//!
//! [github]
//! organizations = ["acme"]
//!
//! [intervals]
//! min_fetch_secs = 300
//! max_fetch_secs = 21600
//! ```
//!
//! The GitHub token is read from `github.token` or, when unset, from the
//! `GITHUB_TOKEN` environment variable.

pub mod error;

pub use error::{ConfigError, ConfigResult};

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub storage: StorageConfig,
    pub workspace: WorkspaceConfig,
    pub github: GitHubConfig,
    pub intervals: IntervalConfig,
    pub workers: WorkerConfig,
    pub limits: LimitConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StorageConfig {
    /// SQLite database file
    pub database: PathBuf,
    pub pool_size: u32,
    /// Attempts at taking the schema migration lock before giving up
    pub migration_lock_attempts: usize,
    pub migration_lock_delay_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_data_dir().join("repowatch.db"),
            pool_size: 8,
            migration_lock_attempts: 30,
            migration_lock_delay_ms: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkspaceConfig {
    /// Clones live at `<root>/<owner>/<name>`
    pub root: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_data_dir().join("repositories"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GitHubConfig {
    /// Organisations to enumerate; empty means the token owner's repositories
    pub organizations: Vec<String>,
    pub token: Option<String>,
    /// Base URL for GitHub Enterprise installations
    pub api_url: Option<String>,
}

impl GitHubConfig {
    /// Token from the file, falling back to `GITHUB_TOKEN`
    pub fn resolved_token(&self) -> Option<String> {
        self.token
            .clone()
            .filter(|t| !t.trim().is_empty())
            .or_else(|| std::env::var("GITHUB_TOKEN").ok())
            .filter(|t| !t.trim().is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct IntervalConfig {
    pub discovery_secs: u64,
    /// How often the change discoverer looks for repositories due a fetch
    pub fetch_tick_secs: u64,
    pub min_fetch_secs: u64,
    pub max_fetch_secs: u64,
    pub head_count_secs: u64,
    pub stats_secs: u64,
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            discovery_secs: 60 * 60,
            fetch_tick_secs: 60,
            min_fetch_secs: 5 * 60,
            max_fetch_secs: 6 * 60 * 60,
            head_count_secs: 24 * 60 * 60,
            stats_secs: 60,
        }
    }
}

impl IntervalConfig {
    pub fn discovery(&self) -> Duration {
        Duration::from_secs(self.discovery_secs)
    }

    pub fn fetch_tick(&self) -> Duration {
        Duration::from_secs(self.fetch_tick_secs)
    }

    pub fn min_fetch(&self) -> Duration {
        Duration::from_secs(self.min_fetch_secs)
    }

    pub fn max_fetch(&self) -> Duration {
        Duration::from_secs(self.max_fetch_secs)
    }

    pub fn head_count(&self) -> Duration {
        Duration::from_secs(self.head_count_secs)
    }

    pub fn stats(&self) -> Duration {
        Duration::from_secs(self.stats_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub clone_workers: usize,
    pub fetch_workers: usize,
    /// Bound of each pool's job queue
    pub queue_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            clone_workers: 2,
            fetch_workers: 4,
            queue_depth: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LimitConfig {
    /// Consecutive clone/fetch failures before a repository is disabled
    pub max_consecutive_failures: u32,
    /// Delivery attempts for an unparseable push hint before dead-lettering
    pub push_hint_max_retries: u32,
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 5,
            push_hint_max_retries: 3,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String,
    pub file: Option<String>,
    pub color: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "text".to_string(),
            file: None,
            color: true,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("Repowatch"))
        .unwrap_or_else(|| PathBuf::from(".repowatch"))
}

/// Default configuration file location, `<config dir>/Repowatch/repowatch.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Repowatch").join("repowatch.toml"))
}

impl Config {
    /// Load configuration.
    ///
    /// An explicit path must exist. Without one the default location is used
    /// when present, otherwise built-in defaults apply.
    pub fn load(explicit: Option<&Path>) -> ConfigResult<Self> {
        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigError::Missing {
                    path: path.to_path_buf(),
                })
            }
            Some(path) => Some(path.to_path_buf()),
            None => default_config_path().filter(|p| p.exists()),
        };

        let config = match path {
            Some(path) => {
                let contents = std::fs::read_to_string(&path).map_err(|source| {
                    ConfigError::Read {
                        path: path.clone(),
                        source,
                    }
                })?;
                Self::from_toml_str(&contents).map_err(|source| ConfigError::Parse {
                    path: path.clone(),
                    source,
                })?
            }
            None => Config::default(),
        };

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Check invariants that would otherwise surface as misbehaving workers
    pub fn validate(&self) -> ConfigResult<()> {
        let intervals = &self.intervals;
        if intervals.min_fetch_secs == 0 {
            return Err(ConfigError::invalid("intervals.min_fetch_secs must be > 0"));
        }
        if intervals.min_fetch_secs > intervals.max_fetch_secs {
            return Err(ConfigError::invalid(format!(
                "intervals.min_fetch_secs ({}) exceeds intervals.max_fetch_secs ({})",
                intervals.min_fetch_secs, intervals.max_fetch_secs
            )));
        }
        for (name, value) in [
            ("intervals.discovery_secs", intervals.discovery_secs),
            ("intervals.fetch_tick_secs", intervals.fetch_tick_secs),
            ("intervals.head_count_secs", intervals.head_count_secs),
            ("intervals.stats_secs", intervals.stats_secs),
        ] {
            if value == 0 {
                return Err(ConfigError::invalid(format!("{} must be > 0", name)));
            }
        }
        if self.workers.clone_workers == 0 || self.workers.fetch_workers == 0 {
            return Err(ConfigError::invalid("worker pool sizes must be > 0"));
        }
        if self.workers.queue_depth == 0 {
            return Err(ConfigError::invalid("workers.queue_depth must be > 0"));
        }
        if self.storage.pool_size == 0 {
            return Err(ConfigError::invalid("storage.pool_size must be > 0"));
        }
        if self.limits.max_consecutive_failures == 0 {
            return Err(ConfigError::invalid(
                "limits.max_consecutive_failures must be > 0",
            ));
        }
        if self.logging.format.parse::<crate::core::logging::LogFormat>().is_err() {
            return Err(ConfigError::invalid(format!(
                "logging.format '{}' is not one of text, ext, json",
                self.logging.format
            )));
        }
        Ok(())
    }

    /// Create the workspace root and confirm it is writable
    pub fn prepare_workspace(&self) -> ConfigResult<()> {
        let root = &self.workspace.root;
        let workspace_error = |source| ConfigError::Workspace {
            path: root.clone(),
            source,
        };
        std::fs::create_dir_all(root).map_err(workspace_error)?;
        let probe = root.join(".repowatch-write-probe");
        std::fs::write(&probe, b"ok").map_err(workspace_error)?;
        std::fs::remove_file(&probe).map_err(workspace_error)?;
        if let Some(parent) = self.storage.database.parent() {
            std::fs::create_dir_all(parent).map_err(|source| ConfigError::Workspace {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        Ok(())
    }
}
