//! Configuration management for Throttler.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

use crate::error::{Result, ThrottlerError};
use crate::middleware::FailurePolicy;
use crate::ratelimit::QuotaRegistry;

/// Prefix for environment variable overrides, e.g. `THROTTLER__STORAGE__URL`.
const ENV_PREFIX: &str = "THROTTLER";

/// Main configuration for the Throttler middleware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThrottlerConfig {
    /// Counter store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// What to do when the counter store cannot be reached
    #[serde(default)]
    pub failure_policy: FailurePolicy,

    /// Prefix for every limiter key written to the store
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Path to the per-worker quota rules
    #[serde(default)]
    pub quotas_path: Option<String>,
}

impl Default for ThrottlerConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            failure_policy: FailurePolicy::default(),
            key_prefix: default_key_prefix(),
            quotas_path: None,
        }
    }
}

fn default_key_prefix() -> String {
    "throttler".to_string()
}

/// Which counter store backs the limiter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// In-process store; only correct when all throttled work runs in one process
    #[default]
    Memory,
    /// Shared Redis store
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Backend selection
    #[serde(default)]
    pub backend: StorageBackend,

    /// Memory store: sweep expired counters once this many are held
    #[serde(default = "default_prune_threshold")]
    pub prune_threshold: usize,

    /// Redis store: connection URL
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Redis store: bound on every round trip, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            prune_threshold: default_prune_threshold(),
            url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_prune_threshold() -> usize {
    10000
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_timeout_ms() -> u64 {
    250
}

impl ThrottlerConfig {
    /// Load configuration from an optional file, overridden by
    /// `THROTTLER__*` environment variables.
    ///
    /// The file format is picked from its extension (YAML, TOML or JSON).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: ThrottlerConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;

        info!(
            backend = ?config.storage.backend,
            failure_policy = ?config.failure_policy,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: ThrottlerConfig = serde_yaml::from_str(&contents)
            .map_err(|e| ThrottlerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make the limiter unusable.
    pub fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() {
            return Err(ThrottlerError::Config("key_prefix must not be empty".to_string()));
        }
        if self.storage.backend == StorageBackend::Redis && self.storage.timeout_ms == 0 {
            return Err(ThrottlerError::Config(
                "storage.timeout_ms must be positive for the redis backend".to_string(),
            ));
        }
        Ok(())
    }

    /// Load the quota rules referenced by `quotas_path`.
    ///
    /// Returns an empty registry when no path is configured.
    pub fn load_quotas(&self) -> Result<QuotaRegistry> {
        match &self.quotas_path {
            Some(path) => QuotaRegistry::from_file(Path::new(path)),
            None => Ok(QuotaRegistry::new()),
        }
    }
}
