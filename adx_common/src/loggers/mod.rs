//! # Logging Setup
//!
//! Installs the process-wide `tracing` subscriber used by the server binaries:
//! a coloured console layer plus a JSON layer written to a daily rolling file
//! `<log_dir>/<app_name>.<date>`. `RUST_LOG` wins over the configured level.

use std::fs;
use std::path::Path;

use thiserror::Error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("log directory unusable: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid log filter {filter:?}: {message}")]
    Filter { filter: String, message: String },

    #[error("a global subscriber is already installed: {0}")]
    AlreadyInstalled(String),
}

/// Installs the global subscriber. Keep the returned guard alive for the
/// life of the process or buffered file output is lost.
///
/// # Errors
///
/// Returns an error if the directory cannot be created, the level is not a
/// valid filter, or a subscriber was already installed.
pub fn init_tracing(app_name: &str, log_dir: &Path, log_level: &str) -> Result<WorkerGuard, LoggerError> {
    fs::create_dir_all(log_dir)?;

    let file_appender = rolling::daily(log_dir, app_name);
    let (non_blocking_appender, guard) = non_blocking(file_appender);

    let console_layer = fmt::layer().with_target(true).with_ansi(true);
    let file_layer = fmt::layer()
        .with_ansi(false)
        .with_writer(non_blocking_appender)
        .json();

    let env_filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(log_level).map_err(|e| LoggerError::Filter {
            filter: log_level.to_string(),
            message: e.to_string(),
        })?,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggerError::AlreadyInstalled(e.to_string()))?;

    info!(app_name, log_dir = %log_dir.display(), log_level, "Logging initialized");
    Ok(guard)
}

/// Deletes all but the `keep` newest `<app_name>.<date>` files in `log_dir`.
/// Returns how many files were removed.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn cleanup_old_logs(log_dir: &Path, app_name: &str, keep: usize) -> Result<usize, LoggerError> {
    let prefix = format!("{app_name}.");
    let mut entries: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .filter(|e| {
            e.file_type().is_ok_and(|t| t.is_file())
                && e.file_name().to_string_lossy().starts_with(&prefix)
        })
        .filter_map(|e| {
            let modified = e.metadata().and_then(|m| m.modified()).ok()?;
            Some((modified, e.path()))
        })
        .collect();

    // Newest first.
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    let mut removed = 0;
    for (_, path) in entries.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => eprintln!("Failed to delete old log file {:?}: {}", path, e),
        }
    }
    Ok(removed)
}
