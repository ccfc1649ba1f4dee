//! Configuration management for Tollgate.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{Result, TollgateError};
use crate::ratelimit::{Algorithm, FailPolicy};

/// Prefix for environment variable overrides, e.g. `TOLLGATE__STORE__REDIS_URL`.
const ENV_PREFIX: &str = "TOLLGATE";

/// Main configuration for the Tollgate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TollgateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Shared counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Path to the client/tier catalog YAML file
    #[serde(default)]
    pub catalog_path: Option<String>,

    /// Usage accounting configuration
    #[serde(default)]
    pub usage: UsageConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// gRPC server address
    #[serde(default = "default_grpc_addr")]
    pub grpc_addr: SocketAddr,

    /// Deadline for a single decision, soft-throttle delay included
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// Identifier of this instance, attached to log output
    #[serde(default = "default_instance_id")]
    pub instance_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_addr: default_grpc_addr(),
            request_timeout_ms: default_request_timeout_ms(),
            instance_id: default_instance_id(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn default_grpc_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8081))
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_instance_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// System-wide limit applied across all clients
    #[serde(default)]
    pub system: SystemLimitConfig,

    /// Soft-throttle delay used when a tier does not set its own
    #[serde(default = "default_soft_delay_ms")]
    pub soft_delay_ms: u64,

    /// What to do when the counter store cannot be reached
    #[serde(default)]
    pub fail_policy: FailPolicy,

    /// Upper bound on a single counter store round trip
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Algorithm used until an administrator stores a different one
    #[serde(default)]
    pub default_algorithm: Algorithm,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            system: SystemLimitConfig::default(),
            soft_delay_ms: default_soft_delay_ms(),
            fail_policy: FailPolicy::default(),
            store_timeout_ms: default_store_timeout_ms(),
            default_algorithm: Algorithm::default(),
        }
    }
}

impl RateLimitingConfig {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

fn default_soft_delay_ms() -> u64 {
    500
}

fn default_store_timeout_ms() -> u64 {
    250
}

/// System-wide limit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemLimitConfig {
    /// Whether the global cap is evaluated at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Requests admitted per second across the whole cluster
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u64,
}

impl Default for SystemLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            requests_per_second: default_requests_per_second(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_requests_per_second() -> u64 {
    1000
}

/// Which counter store backs the buckets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local store; only correct for a single instance
    #[default]
    Memory,
    /// Redis, shared by every instance
    Redis,
}

/// Shared counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Prefix prepended to every bucket key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How long a bucket is kept once it would be fully refilled
    #[serde(default = "default_keep_after_refill_secs")]
    pub keep_after_refill_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            keep_after_refill_secs: default_keep_after_refill_secs(),
        }
    }
}

impl StoreConfig {
    pub fn keep_after_refill(&self) -> Duration {
        Duration::from_secs(self.keep_after_refill_secs)
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_key_prefix() -> String {
    "tollgate:".to_string()
}

fn default_keep_after_refill_secs() -> u64 {
    3600
}

/// Usage accounting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageConfig {
    /// Calendar months of usage kept per client, the current one included
    #[serde(default = "default_retention_months")]
    pub retention_months: u32,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            retention_months: default_retention_months(),
        }
    }
}

fn default_retention_months() -> u32 {
    crate::usage::DEFAULT_RETENTION_MONTHS
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TollgateConfig {
    /// Load configuration from a file path, with environment overrides.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::load(Some(config::File::with_name(path)))
    }

    /// Load configuration from environment overrides only.
    pub fn from_env() -> Result<Self> {
        Self::load(None::<config::File<config::FileSourceFile, config::FileFormat>>)
    }

    /// Parse configuration from a YAML string (no environment overrides).
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        config::Config::builder()
            .add_source(config::File::from_str(yaml, config::FileFormat::Yaml))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }

    fn load<S>(file: Option<S>) -> Result<Self>
    where
        S: config::Source + Send + Sync + 'static,
    {
        let mut builder = config::Config::builder();
        if let Some(file) = file {
            builder = builder.add_source(file);
        }
        builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| TollgateError::Config(e.to_string()))
    }
}
