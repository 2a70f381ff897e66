//! Persisted preferences: application credentials and configured stores.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use chasm_common::{AccountId, Error, Result};

use crate::registry::{StoreRecord, StoreRegistry};
use crate::remote::AppCredentials;

/// Preferences file name.
pub const PREFERENCES_FILENAME: &str = "preferences.json";

/// Preferences stored as JSON on disk.
///
/// Acts as the durable [`StoreRegistry`]: a store is only appended after a
/// successful setup, and at most one store exists per backend account.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Preferences {
    /// Application key/secret per backend name.
    #[serde(default)]
    pub app_credentials: BTreeMap<String, AppCredentials>,
    /// Configured stores, in registration order.
    #[serde(default)]
    stores: Vec<StoreRecord>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl Preferences {
    /// Default location: `<config dir>/chasm/preferences.json`.
    pub fn default_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().ok_or_else(|| {
            Error::NotFound("No configuration directory for this platform".to_string())
        })?;
        Ok(config_dir.join("chasm").join(PREFERENCES_FILENAME))
    }

    /// Load preferences from `path`, starting empty if the file is missing.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut prefs: Preferences = if path.exists() {
            let content = fs::read_to_string(&path).await?;
            serde_json::from_str(&content)?
        } else {
            debug!("No preferences at {}, starting empty", path.display());
            Preferences::default()
        };

        let mut seen: Vec<(&str, &AccountId)> = Vec::new();
        for record in &prefs.stores {
            let key = (record.backend.as_str(), &record.account_id);
            if seen.contains(&key) {
                return Err(Error::Serialization(format!(
                    "Preferences list {} account {} twice",
                    record.backend, record.account_id
                )));
            }
            seen.push(key);
        }

        prefs.path = Some(path);
        Ok(prefs)
    }

    /// Write preferences back to the file they were loaded from.
    ///
    /// The file holds access tokens, so it is readable by the owner only.
    /// It is replaced atomically via a uniquely named sibling temporary file.
    pub async fn save(&self) -> Result<()> {
        let path = self.path.as_ref().ok_or_else(|| {
            Error::InvalidInput("Preferences were not loaded from a file".to_string())
        })?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(self)?;
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));

        if let Err(e) = write_private(&tmp, content.as_bytes()).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        if let Err(e) = fs::rename(&tmp, path).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Saved preferences to {}", path.display());
        Ok(())
    }

    /// Path the preferences are persisted at, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Application credentials for `backend` (empty if unconfigured).
    pub fn app_credentials(&self, backend: &str) -> AppCredentials {
        self.app_credentials.get(backend).cloned().unwrap_or_default()
    }

    /// Append a freshly set up store.
    ///
    /// # Errors
    /// - `DuplicateAccount` if the backend account is already registered;
    ///   the registry is left unchanged
    pub fn add_store(&mut self, record: StoreRecord) -> Result<()> {
        if let Some(existing) = self.find_account(&record.backend, &record.account_id) {
            return Err(Error::DuplicateAccount {
                display_name: existing.display_name.clone(),
            });
        }
        self.stores.push(record);
        Ok(())
    }

    /// Remove the store for `account_id` on `backend`.
    pub fn remove_store(&mut self, backend: &str, account_id: &AccountId) -> Option<StoreRecord> {
        let idx = self
            .stores
            .iter()
            .position(|r| r.backend == backend && &r.account_id == account_id)?;
        Some(self.stores.remove(idx))
    }
}

/// Create `path` readable and writable by the owner only and fill it.
async fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(path).await?;
    file.write_all(content).await?;
    file.sync_all().await
}

impl StoreRegistry for Preferences {
    fn records(&self) -> &[StoreRecord] {
        &self.stores
    }
}
