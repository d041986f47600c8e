//! ---
//! dbt_section: "01-core-functionality"
//! dbt_subsection: "module"
//! dbt_type: "source"
//! dbt_scope: "code"
//! dbt_description: "Tracing subscriber setup for harness and daemon processes."
//! dbt_version: "v0.0.0-prealpha"
//! dbt_owner: "tbd"
//! ---
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::daily;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::LoggingConfig;

const LOG_ENV: &str = "DBT_LOG";

/// Available console log formats.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
    StructuredJson,
    #[default]
    Pretty,
}

/// Stream receiving console output.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleTarget {
    #[default]
    Stdout,
    Stderr,
}

/// Keeps the non-blocking writers alive; buffered lines are flushed on drop.
#[must_use = "dropping the guard stops log delivery"]
pub struct LoggingGuard {
    _console: WorkerGuard,
    _file: Option<WorkerGuard>,
}

impl std::fmt::Debug for LoggingGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoggingGuard")
            .field("file", &self._file.is_some())
            .finish()
    }
}

/// Initialize the tracing subscriber based on configuration and environment variables.
///
/// * `DBT_LOG` overrides the log filter (e.g. `info`, `debug,dbt_harness=trace`).
///   When unset the standard `RUST_LOG` variable is honoured, finally defaulting
///   to `info`.
/// * Console output goes to the configured stream. A daily rolling JSON file is
///   added when `config.directory` is set.
///
/// Installing a subscriber twice is not an error; the first one stays active.
pub fn init_tracing(service_name: &str, config: &LoggingConfig) -> Result<LoggingGuard> {
    let (console_writer, console_guard) = match config.console {
        ConsoleTarget::Stdout => tracing_appender::non_blocking(std::io::stdout()),
        ConsoleTarget::Stderr => tracing_appender::non_blocking(std::io::stderr()),
    };

    let mut file_guard = None;
    let file_layer = match &config.directory {
        Some(directory) => {
            std::fs::create_dir_all(directory).with_context(|| {
                format!("unable to create log directory {}", directory.display())
            })?;
            let prefix = config
                .file_prefix
                .clone()
                .unwrap_or_else(|| service_name.to_owned());
            let appender = daily(directory, format!("{prefix}.log"));
            let (file_writer, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            Some(
                fmt::layer()
                    .with_target(true)
                    .with_timer(fmt::time::UtcTime::rfc_3339())
                    .json()
                    .with_writer(file_writer)
                    .boxed(),
            )
        }
        None => None,
    };

    let filter = match std::env::var(LOG_ENV) {
        Ok(directive) => EnvFilter::try_new(directive).unwrap_or_else(|err| {
            eprintln!("invalid {LOG_ENV} directive ({err}); defaulting to info logging");
            EnvFilter::new("info")
        }),
        Err(_) => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let console_layer = match config.format {
        LogFormat::StructuredJson => fmt::layer()
            .with_target(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .json()
            .with_writer(console_writer)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .with_target(true)
            .with_ansi(false)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(console_writer)
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .ok();

    info!(service = %service_name, format = ?config.format, file_logging = config.directory.is_some(), "tracing initialised");
    Ok(LoggingGuard {
        _console: console_guard,
        _file: file_guard,
    })
}

/// Install a subscriber that writes through the libtest capture.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new("debug"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_tracing_creates_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_dir = dir.path().join("logs");
        let config = LoggingConfig {
            directory: Some(log_dir.clone()),
            ..LoggingConfig::default()
        };
        let _guard = init_tracing("dbt-test", &config).unwrap();
        assert!(log_dir.is_dir());
    }

    #[test]
    fn init_test_tracing_is_idempotent() {
        init_test_tracing();
        init_test_tracing();
    }

    #[test]
    fn log_format_uses_kebab_case() {
        #[derive(Deserialize)]
        struct Wrapper {
            format: LogFormat,
            console: ConsoleTarget,
        }
        let parsed: Wrapper =
            toml::from_str("format = \"structured-json\"\nconsole = \"stderr\"").unwrap();
        assert_eq!(parsed.format, LogFormat::StructuredJson);
        assert_eq!(parsed.console, ConsoleTarget::Stderr);
    }
}
