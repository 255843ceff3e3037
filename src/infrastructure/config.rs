//! Kernel configuration loading and validation.

use anyhow::{Context, Result};
use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::adapters::http::GatewayConfig;
use crate::domain::models::ExecutionEnvironment;
use crate::services::{
    FederationConfig, FinOpsConfig, MemoryConfig, PoolConfig, RouterConfig,
};

/// Configuration error kinds surfaced by validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid pool.max_containers: must be at least 1")]
    InvalidMaxContainers,

    #[error("Invalid memory capacity: stm and ltm capacities must be at least 1")]
    InvalidMemoryCapacity,

    #[error("Invalid {field}: {value} is outside (0, 1]")]
    InvalidUnitFraction { field: &'static str, value: f64 },

    #[error("Invalid gateway.max_concurrent_tasks: must be at least 1")]
    InvalidMaxConcurrentTasks,

    #[error("Invalid federation.max_peers: must be at least 1")]
    InvalidMaxPeers,

    #[error("Invalid finops.max_records: must be at least 1")]
    InvalidMaxRecords,

    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid environment {id}: {reason}")]
    InvalidEnvironment { id: String, reason: String },
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error.
    pub level: String,
    /// Output format: json or pretty.
    pub format: String,
    /// When set, logs are additionally written to daily-rotated files in
    /// this directory.
    pub directory: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// The complete kernel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    pub pool: PoolConfig,
    pub memory: MemoryConfig,
    pub finops: FinOpsConfig,
    pub router: RouterConfig,
    pub gateway: GatewayConfig,
    pub federation: FederationConfig,
    pub logging: LoggingConfig,
    /// Execution environments registered at startup.
    pub environments: Vec<ExecutionEnvironment>,
}

/// Hierarchical configuration loader.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging.
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults
    /// 2. `cortexos.yaml` (project config)
    /// 3. `cortexos.local.yaml` (local overrides)
    /// 4. Environment variables (`CORTEXOS_` prefix, `__` nesting)
    pub fn load() -> Result<KernelConfig> {
        let config: KernelConfig = Figment::new()
            .merge(Serialized::defaults(KernelConfig::default()))
            .merge(Yaml::file("cortexos.yaml"))
            .merge(Yaml::file("cortexos.local.yaml"))
            .merge(Env::prefixed("CORTEXOS_").split("__"))
            .extract()
            .context("Failed to extract kernel configuration")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from one specific file.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<KernelConfig> {
        let config: KernelConfig = Figment::new()
            .merge(Serialized::defaults(KernelConfig::default()))
            .merge(Yaml::file(path.as_ref()))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Validate a configuration after loading.
    pub fn validate(config: &KernelConfig) -> Result<(), ConfigError> {
        if config.pool.max_containers == 0 {
            return Err(ConfigError::InvalidMaxContainers);
        }
        if config.memory.stm_capacity == 0 || config.memory.ltm_capacity == 0 {
            return Err(ConfigError::InvalidMemoryCapacity);
        }
        for (field, value) in [
            ("memory.q_learning_rate", config.memory.q_learning_rate),
            ("memory.q_discount_factor", config.memory.q_discount_factor),
            ("memory.promotion_q_threshold", config.memory.promotion_q_threshold),
            (
                "finops.default_budget_alert_threshold",
                config.finops.default_budget_alert_threshold,
            ),
        ] {
            if value <= 0.0 || value > 1.0 {
                return Err(ConfigError::InvalidUnitFraction { field, value });
            }
        }
        if config.gateway.max_concurrent_tasks == 0 {
            return Err(ConfigError::InvalidMaxConcurrentTasks);
        }
        if config.federation.max_peers == 0 {
            return Err(ConfigError::InvalidMaxPeers);
        }
        if config.finops.max_records == 0 {
            return Err(ConfigError::InvalidMaxRecords);
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&config.logging.level.as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }
        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        for environment in &config.environments {
            if environment.id.is_empty() {
                return Err(ConfigError::InvalidEnvironment {
                    id: "<empty>".to_string(),
                    reason: "environment id cannot be empty".to_string(),
                });
            }
            if environment.command.is_empty() {
                return Err(ConfigError::InvalidEnvironment {
                    id: environment.id.clone(),
                    reason: "command cannot be empty".to_string(),
                });
            }
            if environment.timeout_ms == 0 {
                return Err(ConfigError::InvalidEnvironment {
                    id: environment.id.clone(),
                    reason: "timeout_ms must be positive".to_string(),
                });
            }
        }

        Ok(())
    }
}
