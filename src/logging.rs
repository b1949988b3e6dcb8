//! File logging for addonkeeper.
//!
//! Each run writes one timestamped log under `~/.addonkeeper/logs/`. Logs
//! older than the retention period are removed at startup. Nothing is
//! written to the terminal; the CLI prints engine events itself.

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing_subscriber::fmt::writer::MakeWriterExt;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Default log retention in hours.
pub const DEFAULT_LOG_RETENTION_HOURS: u32 = 72;

/// Default log level.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Log file name prefix.
const LOG_PREFIX: &str = "addonkeeper_";

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    /// Log retention period in hours.
    pub retention_hours: u32,
    /// Log level (trace, debug, info, warn, error, off).
    pub level: String,
    /// Whether logging is enabled.
    pub enabled: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            retention_hours: DEFAULT_LOG_RETENTION_HOURS,
            level: DEFAULT_LOG_LEVEL.to_string(),
            enabled: true,
        }
    }
}

impl LogConfig {
    /// Normalizes a level name; unknown names fall back to the default.
    #[must_use]
    pub fn parse_level(value: &str) -> String {
        match value.trim().to_lowercase().as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "info" => "info",
            "warn" | "warning" => "warn",
            "error" => "error",
            "off" | "none" | "disabled" => "off",
            _ => DEFAULT_LOG_LEVEL,
        }
        .to_string()
    }

    #[must_use]
    pub fn parse_retention(value: &str) -> u32 {
        value.trim().parse().unwrap_or(DEFAULT_LOG_RETENTION_HOURS)
    }
}

/// Returns the log directory (`~/.addonkeeper/logs/`).
#[must_use]
pub fn log_directory() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".addonkeeper")
        .join("logs")
}

/// Path of a new log file in `dir`.
#[must_use]
pub fn new_log_path(dir: &Path) -> PathBuf {
    let now = chrono::Local::now();
    dir.join(format!("{}{}.log", LOG_PREFIX, now.format("%Y-%m-%d_%H-%M-%S")))
}

/// Removes this program's logs in `dir` older than `retention_hours`.
///
/// Returns how many files were removed.
pub fn cleanup_old_logs(dir: &Path, retention_hours: u32) -> io::Result<u32> {
    if !dir.exists() {
        return Ok(0);
    }

    let retention = Duration::from_secs(u64::from(retention_hours) * 3600);
    let now = SystemTime::now();
    let mut deleted = 0;

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let is_ours = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(LOG_PREFIX) && n.ends_with(".log"));
        if !is_ours {
            continue;
        }

        let age = fs::metadata(&path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if age.is_some_and(|a| a > retention) && fs::remove_file(&path).is_ok() {
            deleted += 1;
        }
    }

    Ok(deleted)
}

/// Installs the global file subscriber.
///
/// `RUST_LOG` overrides the configured level.
pub fn init(config: &LogConfig) -> io::Result<()> {
    if !config.enabled || config.level == "off" {
        return Ok(());
    }

    let log_dir = log_directory();
    fs::create_dir_all(&log_dir)?;
    let deleted = cleanup_old_logs(&log_dir, config.retention_hours)?;

    let log_path = new_log_path(&log_dir);
    let log_file = File::create(&log_path)?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let file_layer = fmt::layer()
        .with_writer(log_file.with_max_level(tracing::Level::TRACE))
        .with_ansi(false)
        .with_target(false)
        .with_thread_ids(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .init();

    tracing::info!("addonkeeper logging initialized");
    tracing::info!("Log file: {}", log_path.display());
    tracing::info!("Log level: {}", config.level);
    if deleted > 0 {
        tracing::info!("Cleaned up {} old log file(s)", deleted);
    }

    Ok(())
}
