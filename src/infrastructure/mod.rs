//! Infrastructure: configuration and logging setup.

pub mod config;
pub mod logging;

pub use config::{ConfigError, ConfigLoader, KernelConfig, LoggingConfig};
pub use logging::init_logging;
