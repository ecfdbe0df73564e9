use std::fs;
use std::path::Path;
use std::sync::Once;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::SchedError;

static INIT: Once = Once::new();

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber: console output plus, when a directory
/// is configured, JSON lines in a daily-rolling file. Later calls are no-ops.
pub fn init(config: &LoggingConfig) -> Result<(), SchedError> {
    let mut outcome = Ok(());
    INIT.call_once(|| outcome = install(config));
    outcome
}

fn install(config: &LoggingConfig) -> Result<(), SchedError> {
    let console = config.console.then(|| {
        fmt::Layer::new()
            .with_file(true)
            .with_line_number(true)
            .with_thread_ids(true)
            .with_target(true)
            .with_ansi(true)
            .with_filter(filter(&config.level))
    });

    let file = match &config.directory {
        Some(log_dir) => {
            fs::create_dir_all(log_dir)?;
            cleanup_old_logs(log_dir, config.max_log_files);

            let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix("ftsched")
                .filename_suffix("log")
                .build(log_dir)
                .map_err(|e| SchedError::Config(format!("Failed to create file appender: {}", e)))?;

            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(file_appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .map_err(|e| SchedError::Config(format!("Failed to set tracing subscriber: {}", e)))
}

/// Keeps the `keep` most recently modified `.log` files in `log_dir`
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().extension().is_some_and(|ext| ext == "log"))
        .collect();

    // Newest first
    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    log_files
        .iter()
        .skip(keep)
        .filter(|old_file| fs::remove_file(old_file.path()).is_ok())
        .count()
}
