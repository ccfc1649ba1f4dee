//! Clients, tiers and the lookups the rate limiter consumes.
//!
//! The catalog is loaded from YAML and kept in memory. Tier edits are visible
//! to the very next evaluation.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TollgateError};

/// What happens when a client exhausts its per-minute window.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ThrottleMode {
    /// Reject immediately
    #[default]
    #[serde(alias = "hard")]
    Hard,
    /// Delay once and retry before rejecting
    #[serde(alias = "soft")]
    Soft,
}

/// A named plan defining a client's limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tier {
    pub id: String,
    pub name: String,
    pub requests_per_minute: u64,
    pub requests_per_month: u64,
    #[serde(default)]
    pub throttle_mode: ThrottleMode,
    /// Soft-throttle delay; the service default applies when unset
    #[serde(default)]
    pub soft_delay_ms: Option<u64>,
}

/// An API key holder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Client {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub api_key: String,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(rename = "tier")]
    pub tier_id: String,
}

fn default_active() -> bool {
    true
}

impl Client {
    /// Display name, falling back to the id.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }
}

/// Resolves callers.
#[async_trait]
pub trait ClientLookup: Send + Sync {
    async fn client_by_api_key(&self, api_key: &str) -> Result<Client>;

    async fn client_by_id(&self, client_id: &str) -> Result<Client>;
}

/// Resolves tiers; must always return the latest administrator values.
#[async_trait]
pub trait TierLookup: Send + Sync {
    async fn tier(&self, tier_id: &str) -> Result<Tier>;
}

/// On-disk catalog format.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatalogFile {
    #[serde(default)]
    pub tiers: Vec<Tier>,
    #[serde(default)]
    pub clients: Vec<Client>,
}

/// Clients and their API key index, always updated together.
#[derive(Debug, Default)]
struct Directory {
    clients: HashMap<String, Client>,
    /// api key -> client id
    api_keys: HashMap<String, String>,
}

/// In-memory client and tier directory.
///
/// Lock order is `tiers` then `directory`; every mutation that checks one
/// against the other holds both for the whole operation.
#[derive(Debug, Default)]
pub struct Catalog {
    tiers: RwLock<HashMap<String, Tier>>,
    directory: RwLock<Directory>,
}

impl Catalog {
    /// Create an empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the catalog from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading client catalog");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load the catalog from a YAML string.
    ///
    /// Every client must reference a tier defined in the same document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let file: CatalogFile = serde_yaml::from_str(yaml)
            .map_err(|e| TollgateError::Config(format!("Failed to parse catalog: {}", e)))?;

        let catalog = Catalog::new();
        for tier in file.tiers {
            catalog.upsert_tier(tier);
        }
        for client in file.clients {
            catalog.upsert_client(client)?;
        }

        info!(
            tiers = catalog.tier_count(),
            clients = catalog.client_count(),
            "Client catalog loaded"
        );
        Ok(catalog)
    }

    /// Create or replace a tier. Takes effect on the next evaluation.
    pub fn upsert_tier(&self, tier: Tier) {
        self.tiers.write().insert(tier.id.clone(), tier);
    }

    /// Delete a tier that no client is assigned to.
    pub fn delete_tier(&self, tier_id: &str) -> Result<Tier> {
        let mut tiers = self.tiers.write();
        let directory = self.directory.read();
        if directory.clients.values().any(|c| c.tier_id == tier_id) {
            return Err(TollgateError::TierInUse(tier_id.to_string()));
        }
        tiers
            .remove(tier_id)
            .ok_or_else(|| TollgateError::UnknownClientOrTier(format!("tier {}", tier_id)))
    }

    /// Create or replace a client.
    ///
    /// The tier must exist and the API key must not belong to another client.
    pub fn upsert_client(&self, client: Client) -> Result<()> {
        let tiers = self.tiers.read();
        let mut directory = self.directory.write();

        if !tiers.contains_key(&client.tier_id) {
            return Err(TollgateError::UnknownClientOrTier(format!(
                "tier {} for client {}",
                client.tier_id, client.id
            )));
        }
        if let Some(owner) = directory.api_keys.get(&client.api_key) {
            if *owner != client.id {
                return Err(TollgateError::InvalidConfiguration(format!(
                    "API key of client {} is already assigned to client {}",
                    client.id, owner
                )));
            }
        }

        let Directory { clients, api_keys } = &mut *directory;
        if let Some(previous) = clients.get(&client.id) {
            api_keys.remove(&previous.api_key);
        }
        api_keys.insert(client.api_key.clone(), client.id.clone());
        clients.insert(client.id.clone(), client);
        Ok(())
    }

    /// Move a client to another tier.
    pub fn assign_tier(&self, client_id: &str, tier_id: &str) -> Result<()> {
        let tiers = self.tiers.read();
        let mut directory = self.directory.write();

        if !tiers.contains_key(tier_id) {
            return Err(TollgateError::UnknownClientOrTier(format!("tier {}", tier_id)));
        }
        let client = directory
            .clients
            .get_mut(client_id)
            .ok_or_else(|| TollgateError::UnknownClientOrTier(format!("client {}", client_id)))?;
        client.tier_id = tier_id.to_string();
        Ok(())
    }

    /// Activate or deactivate a client.
    pub fn set_active(&self, client_id: &str, active: bool) -> Result<()> {
        let mut directory = self.directory.write();
        let client = directory
            .clients
            .get_mut(client_id)
            .ok_or_else(|| TollgateError::UnknownClientOrTier(format!("client {}", client_id)))?;
        client.active = active;
        Ok(())
    }

    /// Snapshot of every client, ordered by id.
    pub fn clients(&self) -> Vec<Client> {
        let mut clients: Vec<Client> = self.directory.read().clients.values().cloned().collect();
        clients.sort_by(|a, b| a.id.cmp(&b.id));
        clients
    }

    pub fn tier_count(&self) -> usize {
        self.tiers.read().len()
    }

    pub fn client_count(&self) -> usize {
        self.directory.read().clients.len()
    }
}

#[async_trait]
impl ClientLookup for Catalog {
    async fn client_by_api_key(&self, api_key: &str) -> Result<Client> {
        let client_id = self
            .directory
            .read()
            .api_keys
            .get(api_key)
            .cloned()
            .ok_or_else(|| TollgateError::UnknownClientOrTier("invalid API key".to_string()))?;
        self.client_by_id(&client_id).await
    }

    async fn client_by_id(&self, client_id: &str) -> Result<Client> {
        self.directory
            .read()
            .clients
            .get(client_id)
            .cloned()
            .ok_or_else(|| TollgateError::UnknownClientOrTier(format!("client {}", client_id)))
    }
}

#[async_trait]
impl TierLookup for Catalog {
    async fn tier(&self, tier_id: &str) -> Result<Tier> {
        self.tiers
            .read()
            .get(tier_id)
            .cloned()
            .ok_or_else(|| TollgateError::UnknownClientOrTier(format!("tier {}", tier_id)))
    }
}
