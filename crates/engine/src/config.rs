//! Bus configuration.
//!
//! Sources, later overriding earlier:
//! 1. `sagabus.yaml` in the working directory (if present)
//! 2. the YAML file named by `SAGABUS_CONFIG` (if set)
//! 3. environment variables prefixed `SAGABUS__`, nested with `__`
//!    (e.g. `SAGABUS__SAGA__MAX_ATTEMPTS=10`)

use std::time::Duration;

use serde::Deserialize;

pub use sagabus_observability::LogFormat;

pub const DEFAULT_CONFIG_FILE: &str = "sagabus";
pub const CONFIG_ENV_VAR: &str = "SAGABUS_CONFIG";
pub const CONFIG_ENV_PREFIX: &str = "SAGABUS";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Name of the local service: commands and replies addressed to it are consumed.
    pub service_name: String,
    /// Maximum number of envelopes processed concurrently.
    pub workers: usize,
    pub ingress_capacity: usize,
    pub shutdown_grace_ms: u64,
    pub saga: SagaConfig,
    pub outbox: OutboxConfig,
    pub store: StoreConfig,
    pub log: LogConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: "sagabus".to_string(),
            workers: 8,
            ingress_capacity: 1024,
            shutdown_grace_ms: 5000,
            saga: SagaConfig::default(),
            outbox: OutboxConfig::default(),
            store: StoreConfig::default(),
            log: LogConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SagaConfig {
    /// Attempts per envelope before `SagaConcurrencyExhausted`.
    pub max_attempts: u32,
    /// Linear backoff step between attempts.
    pub retry_backoff_ms: u64,
    /// Number of applied message ids remembered per instance.
    pub dedupe_window: usize,
}

impl Default for SagaConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_backoff_ms: 10,
            dedupe_window: 64,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct OutboxConfig {
    pub relay_interval_ms: u64,
    pub batch_size: usize,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            relay_interval_ms: 1000,
            batch_size: 100,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Memory,
    Postgres,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Memory,
            database_url: None,
            max_connections: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub format: LogFormat,
}

impl BusConfig {
    /// Load configuration from files and environment.
    pub fn load() -> Result<Self, config::ConfigError> {
        use config::{Config, Environment, File, FileFormat};

        let mut builder = Config::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml).required(true));
        }

        builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    /// Parse configuration from a YAML document (missing keys take defaults).
    pub fn from_yaml(yaml: &str) -> Result<Self, config::ConfigError> {
        use config::{Config, File, FileFormat};

        Config::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()?
            .try_deserialize()
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = name.into();
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn relay_interval(&self) -> Duration {
        Duration::from_millis(self.outbox.relay_interval_ms.max(1))
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.saga.retry_backoff_ms)
    }
}
