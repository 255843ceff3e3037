//! Logging initialization.
//!
//! The kernel itself only emits `tracing` events; this module wires the
//! subscriber for the `cortexd` binary. Library consumers install their own
//! subscriber, so nothing here runs unless the host asks for it.

use anyhow::Result;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use super::config::LoggingConfig;

/// Install the global subscriber per config.
///
/// Returns the file writer guard when file logging is enabled; the guard
/// must stay alive for the lifetime of the process or buffered log lines
/// are lost.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    match &config.directory {
        Some(directory) => {
            let appender = tracing_appender::rolling::daily(directory, "cortexd.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            if config.format == "json" {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_writer(writer)
                    .with_ansi(false)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
            }
            Ok(Some(guard))
        }
        None => {
            if config.format == "json" {
                tracing_subscriber::fmt()
                    .json()
                    .with_env_filter(filter)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
            } else {
                tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .try_init()
                    .map_err(|e| anyhow::anyhow!("failed to install subscriber: {e}"))?;
            }
            Ok(None)
        }
    }
}
