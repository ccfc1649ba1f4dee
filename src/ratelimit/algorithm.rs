//! Bucket algorithm selection.
//!
//! The active algorithm is a single persisted setting. It is read fresh at the
//! start of every tier evaluation and only applies to buckets created after
//! it changes; existing buckets keep the algorithm they were created with
//! until they expire.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{Result, TollgateError};

/// Config key holding the active algorithm.
pub const ALGORITHM_CONFIG_KEY: &str = "RATE_LIMIT_ALGORITHM";

/// Bucket semantics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Algorithm {
    /// Continuous refill at `capacity / period`
    #[default]
    TokenBucket,
    /// Counter reset at every period boundary
    FixedWindow,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::TokenBucket => "TOKEN_BUCKET",
            Algorithm::FixedWindow => "FIXED_WINDOW",
        }
    }

    /// Compact code stored alongside bucket state.
    pub fn code(&self) -> i64 {
        match self {
            Algorithm::TokenBucket => 0,
            Algorithm::FixedWindow => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Algorithm::TokenBucket),
            1 => Some(Algorithm::FixedWindow),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TollgateError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "TOKEN_BUCKET" => Ok(Algorithm::TokenBucket),
            "FIXED_WINDOW" => Ok(Algorithm::FixedWindow),
            other => Err(TollgateError::InvalidConfiguration(format!(
                "invalid algorithm {other:?}, must be TOKEN_BUCKET or FIXED_WINDOW"
            ))),
        }
    }
}

/// A stored configuration value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigEntry {
    pub key: String,
    pub value: String,
    pub updated_by: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Key/value configuration collaborator.
#[async_trait]
pub trait ConfigRepository: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ConfigEntry>>;

    /// Store a value, recording who changed it.
    async fn set(&self, key: &str, value: &str, actor: &str) -> Result<ConfigEntry>;
}

/// Process-local configuration repository.
#[derive(Debug, Default)]
pub struct MemoryConfigRepository {
    entries: RwLock<HashMap<String, ConfigEntry>>,
}

impl MemoryConfigRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ConfigRepository for MemoryConfigRepository {
    async fn get(&self, key: &str) -> Result<Option<ConfigEntry>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str, actor: &str) -> Result<ConfigEntry> {
        let entry = ConfigEntry {
            key: key.to_string(),
            value: value.to_string(),
            updated_by: Some(actor.to_string()),
            updated_at: Utc::now(),
        };
        self.entries.write().insert(key.to_string(), entry.clone());
        Ok(entry)
    }
}

/// The active algorithm plus who last changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlgorithmSetting {
    pub algorithm: Algorithm,
    pub updated_by: Option<String>,
    /// `None` while the configured default is in effect
    pub updated_at: Option<DateTime<Utc>>,
}

/// Reads and validates writes of the active algorithm.
pub struct AlgorithmSelector {
    repository: Arc<dyn ConfigRepository>,
    default: Algorithm,
}

impl AlgorithmSelector {
    pub fn new(repository: Arc<dyn ConfigRepository>, default: Algorithm) -> Self {
        Self {
            repository,
            default,
        }
    }

    /// Algorithm in effect while nothing is stored.
    pub fn default_algorithm(&self) -> Algorithm {
        self.default
    }

    /// The algorithm new buckets should be created with.
    pub async fn current(&self) -> Result<Algorithm> {
        Ok(self.setting().await?.algorithm)
    }

    pub async fn setting(&self) -> Result<AlgorithmSetting> {
        let Some(entry) = self.repository.get(ALGORITHM_CONFIG_KEY).await? else {
            return Ok(AlgorithmSetting {
                algorithm: self.default,
                updated_by: None,
                updated_at: None,
            });
        };

        let algorithm = entry.value.parse().unwrap_or_else(|_| {
            warn!(
                value = %entry.value,
                fallback = %self.default,
                "Stored rate limit algorithm is not recognised"
            );
            self.default
        });

        Ok(AlgorithmSetting {
            algorithm,
            updated_by: entry.updated_by,
            updated_at: Some(entry.updated_at),
        })
    }

    /// Validate and store a new algorithm.
    ///
    /// Invalid values fail with `InvalidConfiguration` before anything is written.
    pub async fn set(&self, value: &str, actor: &str) -> Result<AlgorithmSetting> {
        let algorithm: Algorithm = value.parse()?;
        let entry = self
            .repository
            .set(ALGORITHM_CONFIG_KEY, algorithm.as_str(), actor)
            .await?;

        info!(algorithm = %algorithm, actor = %actor, "Rate limit algorithm changed");

        Ok(AlgorithmSetting {
            algorithm,
            updated_by: entry.updated_by,
            updated_at: Some(entry.updated_at),
        })
    }
}
