//! Configuration management for Keel
//!
//! Provides hierarchical configuration loading from multiple sources:
//! 1. Environment variables (KEEL_* prefix, `__` between levels)
//! 2. keel.local.toml (gitignored, local overrides)
//! 3. keel.toml (git-tracked, project config)
//! 4. ~/.config/keel/config.toml (user defaults)
//! 5. Built-in defaults (lowest precedence)
//!
//! The storage crates never read configuration themselves; they take the
//! settings produced by [`KineticConfig::store_settings`] and
//! [`AioConfig::queue_settings`].

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use keel_aio::QueueSettings;
use keel_kv::{ConnectionOptions, StoreSettings};
use serde::{Deserialize, Serialize};

mod error;
mod loader;
mod paths;

pub use error::ConfigError;
pub use loader::ConfigLoader;
pub use paths::{
    LOCAL_CONFIG_FILE, PROJECT_CONFIG_FILE, Paths, USER_CONFIG_FILE, user_config_dir,
};

/// Main Keel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KeelConfig {
    pub kinetic: KineticConfig,
    pub aio: AioConfig,
}

/// Network key-value device backend
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct KineticConfig {
    pub host: String,
    pub port: u16,
    pub user_id: i64,
    pub hmac_key: String,
    pub use_ssl: bool,
    /// Size of the connection pool, fixed at open.
    pub num_connections: u32,
    pub timeout_seconds: u64,
    /// Most ops per device batch.
    pub max_batch_ops: u32,
    /// Block size used when reporting capacity.
    pub block_size: u64,
    /// Required to run with `max_batch_ops <= 1`, which is not atomic.
    pub allow_unbatched_commit: bool,
}

impl Default for KineticConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8123,
            user_id: 1,
            hmac_key: "asdfasdf".to_string(),
            use_ssl: false,
            num_connections: 8,
            timeout_seconds: 10,
            max_batch_ops: 100,
            block_size: 65536,
            allow_unbatched_commit: false,
        }
    }
}

impl std::fmt::Debug for KineticConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KineticConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user_id", &self.user_id)
            .field("hmac_key", &"<redacted>")
            .field("use_ssl", &self.use_ssl)
            .field("num_connections", &self.num_connections)
            .field("timeout_seconds", &self.timeout_seconds)
            .field("max_batch_ops", &self.max_batch_ops)
            .field("block_size", &self.block_size)
            .field("allow_unbatched_commit", &self.allow_unbatched_commit)
            .finish()
    }
}

impl KineticConfig {
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            host: self.host.clone(),
            port: self.port,
            user_id: self.user_id,
            hmac_key: self.hmac_key.clone(),
            use_ssl: self.use_ssl,
            timeout: Duration::from_secs(self.timeout_seconds),
        }
    }

    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            options: self.connection_options(),
            num_connections: self.num_connections as usize,
            max_batch_ops: self.max_batch_ops as usize,
            block_size: self.block_size,
            allow_unbatched_commit: self.allow_unbatched_commit,
        }
    }
}

/// Kernel asynchronous I/O backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AioConfig {
    /// Kernel context depth.
    pub max_in_flight: u32,
    /// Extra attempts after a transient submission failure.
    pub submit_retries: u32,
    pub retry_delay_us: u64,
}

impl Default for AioConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 128,
            submit_retries: 10,
            retry_delay_us: 500,
        }
    }
}

impl AioConfig {
    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            max_in_flight: self.max_in_flight,
            submit_retries: self.submit_retries,
            retry_delay: Duration::from_micros(self.retry_delay_us),
        }
    }
}

impl KeelConfig {
    /// Load configuration from default locations
    pub fn load() -> Result<Self> {
        ConfigLoader::new().load()
    }

    /// Load configuration from specific project directory
    pub fn load_from_dir(project_dir: impl AsRef<Path>) -> Result<Self> {
        ConfigLoader::new().with_project_dir(project_dir).load()
    }

    /// Rejects settings the backends cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.kinetic
            .store_settings()
            .validate()
            .map_err(|e| ConfigError::ValidationError(format!("[kinetic] {e}")))?;
        if self.kinetic.host.is_empty() {
            return Err(ConfigError::ValidationError(
                "[kinetic] host must not be empty".to_string(),
            ));
        }
        if self.aio.max_in_flight == 0 {
            return Err(ConfigError::ValidationError(
                "[aio] max_in_flight must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Render as TOML, the format of every config file.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::SerializeError(e.to_string()))
    }
}
