//! Configuration for addonkeeper.
//!
//! Handles loading and parsing the `.akeeprc` file: one `key = value` per
//! line, `#` starts a comment. Unknown keys are ignored so older binaries
//! can read newer files.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::warn;

use crate::addons::EngineSettings;
use crate::logging::LogConfig;

/// Default `.akeeprc` content with every setting documented.
const DEFAULT_RC: &str = r#"# addonkeeper configuration
# =========================
# Lines starting with '#' are comments.
#
# Installation
# ------------
# Folder the game client loads add-ons from. Required unless --root is given.
# addon_root = ~/Games/Client/Interface/AddOns

# Catalog file (JSON array of catalog entries). Overridden by --catalog.
# catalog = ~/.addonkeeper/catalog.json

# Where downloaded packages are kept until extracted.
# cache_dir = ~/.addonkeeper/cache

# Sources
# -------
# Download the repository's default branch first when an add-on links one.
# prefer_source_control = true

# Token for the GitHub API; raises the rate limit.
# github_token =

# Deletion
# --------
# Extra attempts when a folder cannot be removed, and the first wait in ms.
# delete_retries = 2
# delete_backoff_ms = 250

# Logging Configuration
# ---------------------
# Logs are stored in ~/.addonkeeper/logs/ with automatic cleanup.
#
# log_enabled = true       # Enable/disable file logging (true/false)
# log_level = info         # Log level: trace, debug, info, warn, error, off
# log_retention = 72       # Hours to keep log files
"#;

/// Maximum delete retries accepted from the config file.
const MAX_DELETE_RETRIES: u32 = 10;

/// Application configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Path to config file.
    pub config_path: PathBuf,
    /// Add-on installation root.
    pub addon_root: Option<PathBuf>,
    /// Catalog file.
    pub catalog_path: Option<PathBuf>,
    /// Download cache.
    pub cache_dir: PathBuf,
    pub prefer_source_control: bool,
    pub github_token: Option<String>,
    pub delete_retries: u32,
    pub delete_backoff_ms: u64,
    /// Logging configuration.
    pub log_config: LogConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: Self::default_config_path(),
            addon_root: None,
            catalog_path: None,
            cache_dir: data_directory().join("cache"),
            prefer_source_control: true,
            github_token: None,
            delete_retries: 2,
            delete_backoff_ms: 250,
            log_config: LogConfig::default(),
        }
    }
}

/// Returns `~/.addonkeeper`.
#[must_use]
pub fn data_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".addonkeeper")
}

/// Expands a leading `~` to the home directory.
#[must_use]
pub fn expand_home(value: &str) -> PathBuf {
    match value.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
            home.join(rest.trim_start_matches(['/', '\\']))
        }
        None => PathBuf::from(value),
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(value.to_lowercase().as_str(), "true" | "yes" | "1" | "on")
}

impl Config {
    /// Returns the default config file path (`~/.akeeprc`).
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".akeeprc")
    }

    /// Loads configuration from the default path, creating it if it doesn't exist.
    pub fn load() -> io::Result<Self> {
        Self::load_from(&Self::default_config_path())
    }

    /// Loads configuration from a specific path, creating it if it doesn't
    /// exist.
    pub fn load_from(path: &Path) -> io::Result<Self> {
        if !path.exists() {
            Self::create_default_config(path)?;
        }

        let content = fs::read_to_string(path)?;
        let mut config = Self::parse_str(&content);
        config.config_path = path.to_path_buf();
        Ok(config)
    }

    /// Parses config text on top of the defaults.
    #[must_use]
    pub fn parse_str(content: &str) -> Self {
        let mut config = Self::default();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            if let Some((key, value)) = line.split_once('=') {
                // Remove inline comments
                let value = value.split('#').next().unwrap_or(value).trim();
                config.apply_setting(key.trim(), value);
            }
        }

        config
    }

    fn create_default_config(path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = fs::File::create(path)?;
        file.write_all(DEFAULT_RC.as_bytes())?;
        Ok(())
    }

    /// Applies a single setting.
    fn apply_setting(&mut self, key: &str, value: &str) {
        match key {
            "addon_root" if !value.is_empty() => self.addon_root = Some(expand_home(value)),
            "catalog" if !value.is_empty() => self.catalog_path = Some(expand_home(value)),
            "cache_dir" if !value.is_empty() => self.cache_dir = expand_home(value),
            "prefer_source_control" => self.prefer_source_control = parse_bool(value),
            "github_token" => {
                self.github_token = (!value.is_empty()).then(|| value.to_string());
            }
            "delete_retries" => match value.parse::<u32>() {
                Ok(n) => self.delete_retries = n.min(MAX_DELETE_RETRIES),
                Err(_) => warn!("[CONFIG] Invalid delete_retries '{}'", value),
            },
            "delete_backoff_ms" => match value.parse() {
                Ok(ms) => self.delete_backoff_ms = ms,
                Err(_) => warn!("[CONFIG] Invalid delete_backoff_ms '{}'", value),
            },
            "log_level" => {
                self.log_config.level = LogConfig::parse_level(value);
            }
            "log_retention" | "log_retention_hours" => {
                self.log_config.retention_hours = LogConfig::parse_retention(value);
            }
            "log_enabled" | "logging" => {
                self.log_config.enabled = parse_bool(value);
            }
            _ => {}
        }
    }

    /// Settings handed to the engine.
    #[must_use]
    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            cache_dir: self.cache_dir.clone(),
            prefer_source_control: self.prefer_source_control,
            delete_retries: self.delete_retries,
            delete_backoff: Duration::from_millis(self.delete_backoff_ms),
        }
    }
}
