//! Application configuration
//!
//! Configuration is loaded from:
//! 1. Default values
//! 2. Config file (~/.config/lorekeep/config.toml)
//! 3. Environment variables (LOREKEEP_* prefix)
//!
//! Environment variables take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Environment variable prefix
const ENV_PREFIX: &str = "LOREKEEP";

/// Identifies who is syncing what against the remote authority
///
/// Threaded explicitly through every remote call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncContext {
    /// Identity presented to the remote authority
    ///
    /// Left empty, the workspace uses the one stored with its data.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_identity: String,
    /// Remote workspace holding the dataset
    #[serde(default = "default_workspace_id")]
    pub workspace_id: String,
    /// Dataset within the workspace
    #[serde(default = "default_dataset_id")]
    pub dataset_id: String,
}

impl Default for SyncContext {
    fn default() -> Self {
        Self {
            remote_identity: String::new(),
            workspace_id: default_workspace_id(),
            dataset_id: default_dataset_id(),
        }
    }
}

/// Materialized view settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewSettings {
    /// Quiet period before a debounced regeneration runs
    pub debounce_ms: u64,
    /// Members needed for a group to get a dedicated artifact
    pub min_members: usize,
    /// Cross-references that also qualify a group
    pub min_cross_references: usize,
    /// How long an artifact may stay stale before it is reported unhealthy
    pub stale_after_secs: u64,
    /// Audit entries kept per scope by the sweeper
    pub audit_retention: usize,
}

impl Default for ViewSettings {
    fn default() -> Self {
        Self {
            debounce_ms: 1_500,
            min_members: 10,
            min_cross_references: 25,
            stale_after_secs: 300,
            audit_retention: 200,
        }
    }
}

impl ViewSettings {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }
}

/// Remote sync timer settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Period of the push/refresh timer when healthy
    pub interval_secs: u64,
    /// Upper bound for exponential backoff after transient failures
    pub max_backoff_secs: u64,
    /// Per-request timeout for the HTTP remote
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 30,
            max_backoff_secs: 600,
            request_timeout_secs: 15,
        }
    }
}

/// Pending-operation sweeper settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperSettings {
    /// Confirmed operations are kept this long for inspection
    pub confirmed_retention_secs: u64,
    /// Unconfirmed operations older than this are reclaimed
    pub stale_after_secs: u64,
    /// How often the background sweeper runs
    pub interval_secs: u64,
}

impl Default for SweeperSettings {
    fn default() -> Self {
        Self {
            confirmed_retention_secs: 24 * 60 * 60,
            stale_after_secs: 30 * 24 * 60 * 60,
            interval_secs: 60 * 60,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for data storage (SQLite db, exports)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Remote authority base URL (optional)
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Whether sync is enabled
    #[serde(default)]
    pub sync_enabled: bool,

    /// Log file for background mode (stderr when unset)
    #[serde(default)]
    pub log_file: Option<PathBuf>,

    #[serde(default)]
    pub context: SyncContext,

    #[serde(default)]
    pub views: ViewSettings,

    #[serde(default)]
    pub sync: SyncSettings,

    #[serde(default)]
    pub sweeper: SweeperSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            remote_url: None,
            sync_enabled: false,
            log_file: None,
            context: SyncContext::default(),
            views: ViewSettings::default(),
            sync: SyncSettings::default(),
            sweeper: SweeperSettings::default(),
        }
    }
}

impl Config {
    /// Load configuration from default location and environment
    ///
    /// Order of precedence (highest to lowest):
    /// 1. Environment variables (LOREKEEP_DATA_DIR, LOREKEEP_REMOTE_URL, ...)
    /// 2. Config file (~/.config/lorekeep/config.toml or LOREKEEP_CONFIG)
    /// 3. Default values
    pub fn load() -> Result<Self> {
        Self::load_from_path(&Self::config_file_path())
    }

    /// Load configuration, preferring a path given on the command line
    pub fn load_with_cli_override(path: Option<&PathBuf>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_path(path),
            None => Self::load(),
        }
    }

    /// Load configuration from a specific path
    ///
    /// Environment variables are still applied as overrides.
    /// If the file doesn't exist, defaults are used.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {:?}", path))?;
            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {:?}", path))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        config.ensure_data_dir()?;
        Ok(config)
    }

    /// Load configuration from a TOML string (useful for testing)
    pub fn load_from_str(toml_content: &str) -> Result<Self> {
        let mut config: Config =
            toml::from_str(toml_content).context("Failed to parse config TOML")?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Configuration rooted at a specific data directory, ignoring files and env
    pub fn with_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        let var = |name: &str| std::env::var(format!("{}_{}", ENV_PREFIX, name)).ok();

        if let Some(val) = var("DATA_DIR") {
            self.data_dir = PathBuf::from(val);
        }

        if let Some(val) = var("REMOTE_URL") {
            self.remote_url = if val.is_empty() { None } else { Some(val) };
        }

        if let Some(val) = var("SYNC_ENABLED") {
            self.sync_enabled = val.eq_ignore_ascii_case("true") || val == "1";
        }

        if let Some(val) = var("WORKSPACE_ID") {
            self.context.workspace_id = val;
        }

        if let Some(val) = var("DATASET_ID") {
            self.context.dataset_id = val;
        }

        if let Some(val) = var("REMOTE_IDENTITY") {
            self.context.remote_identity = val;
        }

        if let Some(ms) = var("DEBOUNCE_MS").and_then(|v| v.parse().ok()) {
            self.views.debounce_ms = ms;
        }
    }

    /// Ensure data directory exists
    fn ensure_data_dir(&self) -> Result<()> {
        if !self.data_dir.exists() {
            std::fs::create_dir_all(&self.data_dir)
                .with_context(|| format!("Failed to create data directory: {:?}", self.data_dir))?;
        }
        Ok(())
    }

    /// Save configuration to the default file
    pub fn save(&self) -> Result<()> {
        self.save_to_path(&Self::config_file_path())
    }

    /// Save configuration to a specific file
    pub fn save_to_path(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(config_path, content)
            .with_context(|| format!("Failed to write config file: {:?}", config_path))?;
        Ok(())
    }

    /// Get the config file path
    ///
    /// Can be overridden with LOREKEEP_CONFIG environment variable
    pub fn config_file_path() -> PathBuf {
        if let Ok(path) = std::env::var(format!("{}_CONFIG", ENV_PREFIX)) {
            return PathBuf::from(path);
        }

        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lorekeep")
            .join("config.toml")
    }

    /// Get the path to the SQLite database
    pub fn sqlite_path(&self) -> PathBuf {
        self.data_dir.join("lorekeep.db")
    }

    /// Default destination for context exports
    pub fn exports_dir(&self) -> PathBuf {
        self.data_dir.join("contexts")
    }
}

/// Get the default data directory
fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("lorekeep")
}

fn default_workspace_id() -> String {
    "default".to_string()
}

fn default_dataset_id() -> String {
    "main".to_string()
}
