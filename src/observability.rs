// SPDX-License-Identifier: Apache-2.0

//! Logging setup.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime};

use tracing_appender::rolling::RollingFileAppender;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

const LOG_FILE_PREFIX: &str = "qorefed.log";
const LOG_RETENTION_DAYS: u64 = 14;

/// Installs the global subscriber. `RUST_LOG` overrides the configured
/// filter. Does nothing if a subscriber is already installed.
pub fn init_tracing(config: &LoggingConfig) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.filter));

    let installed = match &config.directory {
        Some(dir) => {
            let _ = fs::create_dir_all(dir);
            if let Err(e) = cleanup_old_logs(dir, LOG_RETENTION_DAYS) {
                eprintln!("Failed to clean up old logs: {}", e);
            }
            let file_appender: RollingFileAppender =
                tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let builder = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(file_appender)
                .with_ansi(false)
                .with_thread_ids(true)
                .with_span_events(FmtSpan::CLOSE);
            if config.json {
                builder
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .try_init()
                    .is_ok()
            } else {
                builder.try_init().is_ok()
            }
        }
        None => {
            let builder = tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr);
            if config.json {
                builder.json().try_init().is_ok()
            } else {
                builder.try_init().is_ok()
            }
        }
    };

    if installed {
        tracing::info!(directory = ?config.directory, json = config.json, "Tracing initialized");
    }
}

fn cleanup_old_logs(log_dir: &Path, retention_days: u64) -> std::io::Result<()> {
    let now = SystemTime::now();
    let retention = Duration::from_secs(retention_days * 24 * 60 * 60);

    for entry in fs::read_dir(log_dir)? {
        let path = entry?.path();
        let is_log = path
            .file_name()
            .and_then(|name| name.to_str())
            .map(|name| name.starts_with(LOG_FILE_PREFIX))
            .unwrap_or(false);
        if !is_log {
            continue;
        }
        let modified = fs::metadata(&path).and_then(|m| m.modified())?;
        if now.duration_since(modified).unwrap_or_default() > retention {
            let _ = fs::remove_file(&path);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cleanup_keeps_recent_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{LOG_FILE_PREFIX}.2026-01-01"));
        let other = dir.path().join("notes.txt");
        fs::write(&log, "entry").unwrap();
        fs::write(&other, "keep").unwrap();

        cleanup_old_logs(dir.path(), 0).unwrap();
        assert!(other.exists());

        fs::write(&log, "entry").unwrap();
        cleanup_old_logs(dir.path(), LOG_RETENTION_DAYS).unwrap();
        assert!(log.exists());
    }
}
