//! Backend connector resolution and the registry of configured stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use chasm_common::{AccessToken, AccountId, Error, Result};

use crate::remote::RemoteConnector;

/// Factory function type for creating connectors.
pub type ConnectorFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteConnector>> + Send + Sync>;

/// Registry for backend connector factories.
///
/// Allows dynamic registration and resolution of backends by name and
/// configuration, so persisted stores can be rebuilt from their records.
pub struct ConnectorRegistry {
    factories: HashMap<String, ConnectorFactory>,
}

impl ConnectorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a connector factory.
    ///
    /// # Errors
    /// - Returns error if name is already registered
    pub fn register(&mut self, name: impl Into<String>, factory: ConnectorFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Backend '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Resolve a connector by name and configuration.
    ///
    /// # Errors
    /// - Backend not found
    /// - Configuration invalid
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteConnector>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Backend '{}' is not registered", name)))?;
        factory(config)
    }

    /// Get list of registered backend names, sorted.
    pub fn backends(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a backend is registered.
    pub fn has_backend(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Create a registry with the persistent backends.
pub fn create_default_registry() -> ConnectorRegistry {
    let mut registry = ConnectorRegistry::new();

    // Register local filesystem backend
    registry
        .register("local", Box::new(|config: Value| {
            let root = config
                .get("root")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::InvalidInput("Local backend requires 'root' path".to_string()))?;
            Ok(Arc::new(crate::local::LocalBackend::new(root)?))
        }))
        .expect("Failed to register local backend");

    // Register Dropbox backend
    registry
        .register("dropbox", Box::new(|config: Value| {
            let config: crate::dropbox::DropboxConfig = if config.is_null() {
                Default::default()
            } else {
                serde_json::from_value(config)
                    .map_err(|e| Error::InvalidInput(format!("Invalid Dropbox config: {}", e)))?
            };
            Ok(Arc::new(crate::dropbox::DropboxBackend::new(config)))
        }))
        .expect("Failed to register dropbox backend");

    registry
}

/// Durable description of one configured store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreRecord {
    /// Backend name the connector is resolved by.
    pub backend: String,
    /// Account identity, unique per backend.
    pub account_id: AccountId,
    /// Account name shown to the operator.
    pub display_name: String,
    /// Token re-applied before every remote call.
    pub access_token: AccessToken,
    /// Backend-specific connector configuration.
    #[serde(default)]
    pub provider_config: Value,
    /// When the store was set up.
    pub added_at: DateTime<Utc>,
}

/// Collection of already configured stores, consulted by setup.
pub trait StoreRegistry: Send + Sync {
    /// All registered stores, in registration order.
    fn records(&self) -> &[StoreRecord];

    /// Find the store for `account_id` on `backend`.
    fn find_account(&self, backend: &str, account_id: &AccountId) -> Option<&StoreRecord> {
        self.records()
            .iter()
            .find(|r| r.backend == backend && &r.account_id == account_id)
    }

    /// Stores configured for one backend.
    fn stores_for(&self, backend: &str) -> Vec<&StoreRecord> {
        self.records()
            .iter()
            .filter(|r| r.backend == backend)
            .collect()
    }
}

impl StoreRegistry for Vec<StoreRecord> {
    fn records(&self) -> &[StoreRecord] {
        self
    }
}
