//! Tracing subscriber setup.
//!
//! Stdout carries the CNI result document, so logs go to the configured
//! `logFile` or to stderr.

use crate::config::LogSettings;
use anyhow::Context;
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Environment variable that overrides the configured level.
pub const LOG_ENV: &str = "BRIDGE_CNI_LOG";

const DEFAULT_LEVEL: &str = "warn";

/// Builds the filter: `BRIDGE_CNI_LOG`, then `logLevel`, then `warn`.
pub fn build_filter(settings: &LogSettings) -> EnvFilter {
    EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| {
            settings
                .log_level
                .as_deref()
                .map_or_else(|| EnvFilter::try_new(DEFAULT_LEVEL), EnvFilter::try_new)
        })
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LEVEL))
}

/// Installs the global subscriber.
pub fn init_logging(settings: &LogSettings) -> anyhow::Result<()> {
    let writer = match &settings.log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            BoxMakeWriter::new(Mutex::new(file))
        }
        None => BoxMakeWriter::new(std::io::stderr),
    };

    tracing_subscriber::registry()
        .with(build_filter(settings))
        .with(
            fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .try_init()
        .context("failed to set tracing subscriber")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_from_config_level() {
        let settings = LogSettings {
            log_level: Some("debug".into()),
            log_file: None,
        };
        if std::env::var(LOG_ENV).is_err() {
            assert_eq!(build_filter(&settings).to_string(), "debug");
        }
    }

    #[test]
    fn test_filter_falls_back_to_warn() {
        if std::env::var(LOG_ENV).is_err() {
            assert_eq!(build_filter(&LogSettings::default()).to_string(), "warn");
        }
    }

    #[test]
    fn test_log_file_is_opened() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge-cni.log");
        let settings = LogSettings {
            log_level: Some("info".into()),
            log_file: Some(path.clone()),
        };
        // A second global subscriber may already be installed by another
        // test; only the file side effect is asserted.
        let _ = init_logging(&settings);
        assert!(path.exists());
    }
}
