//! Application configuration, loaded from YAML and environment variables:
//! storage DSN, relay polling/backoff/batch settings, per-step HTTP
//! endpoints, and the monitoring bind address.

use std::time::Duration;

use serde::Deserialize;

use crate::executor::StepEndpoint;
use crate::relay::RelayConfig;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for an explicit configuration file path.
pub const CONFIG_ENV_VAR: &str = "SAGAFLOW_CONFIG";
/// Prefix for configuration environment variables (e.g. `SAGAFLOW__STORAGE__DSN`).
pub const CONFIG_ENV_PREFIX: &str = "SAGAFLOW";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// `sqlx` connection string, e.g. `sqlite://sagaflow.db` or `sqlite::memory:`.
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: "sqlite::memory:".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RelaySettings {
    pub poll_interval_secs: u64,
    pub batch_size: u32,
    pub max_retries: u32,
    pub max_backoff_secs: u64,
}

impl Default for RelaySettings {
    fn default() -> Self {
        let defaults = RelayConfig::default();
        Self {
            poll_interval_secs: defaults.poll_interval.as_secs(),
            batch_size: defaults.batch_size,
            max_retries: defaults.max_retries,
            max_backoff_secs: defaults.max_backoff.as_secs(),
        }
    }
}

impl RelaySettings {
    pub fn to_relay_config(&self) -> RelayConfig {
        RelayConfig {
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            batch_size: self.batch_size,
            max_retries: self.max_retries,
            max_backoff: Duration::from_secs(self.max_backoff_secs),
        }
    }
}

/// One entry of the `steps` config list: the HTTP endpoint a `Call<name>`
/// command is dispatched to.
#[derive(Debug, Clone, Deserialize)]
pub struct StepEndpointSettings {
    pub name: String,
    pub url: String,
    #[serde(default = "default_step_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_step_timeout_secs() -> u64 {
    5
}

impl StepEndpointSettings {
    pub fn to_step_endpoint(&self) -> StepEndpoint {
        StepEndpoint::new(self.name.clone(), self.url.clone(), Duration::from_secs(self.timeout_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringSettings {
    pub bind_address: String,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8089".to_string(),
        }
    }
}

/// Top-level configuration tree.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub relay: RelaySettings,
    pub steps: Vec<StepEndpointSettings>,
    pub monitoring: MonitoringSettings,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config error: {0}")]
    Load(#[from] ::config::ConfigError),
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Sources, in order of priority (later overrides earlier):
    /// 1. `config.yaml` in the current directory, if present.
    /// 2. The file named by `path`, if given.
    /// 3. The file named by `SAGAFLOW_CONFIG`, if set.
    /// 4. Environment variables prefixed `SAGAFLOW__`.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    pub fn for_test() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_uses_in_memory_storage_and_conservative_backoff() {
        let config = Config::default();
        assert_eq!(config.storage.dsn, "sqlite::memory:");
        assert_eq!(config.relay.max_retries, 5);
        assert_eq!(config.relay.max_backoff_secs, 32);
        assert!(config.steps.is_empty());
    }

    #[test]
    fn relay_settings_round_trip_into_relay_config() {
        let settings = RelaySettings::default();
        let relay_config = settings.to_relay_config();
        assert_eq!(relay_config.max_retries, settings.max_retries);
        assert_eq!(relay_config.batch_size, settings.batch_size);
    }
}
