//! Remote object-store capability consumed by every store.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

use chasm_common::{AccessToken, AccountId, Result};

/// Application key/secret pair registered with a provider.
///
/// Constant for the lifetime of the process and shared by every account
/// of that provider; injected into each connector call rather than read
/// from global state.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct AppCredentials {
    pub key: String,
    pub secret: String,
}

impl AppCredentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }
}

impl std::fmt::Debug for AppCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppCredentials")
            .field("key", &self.key)
            .field("secret", &"[REDACTED]")
            .finish()
    }
}

/// One listed remote object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    /// Hierarchical name, `/`-separated.
    pub path: String,
    /// Whether this entry is a directory.
    pub is_dir: bool,
    /// Size in bytes (None for directories).
    pub size: Option<u64>,
}

impl RemoteEntry {
    pub fn file(path: impl Into<String>, size: u64) -> Self {
        Self {
            path: path.into(),
            is_dir: false,
            size: Some(size),
        }
    }

    pub fn dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            is_dir: true,
            size: None,
        }
    }

    /// Last component of the path.
    pub fn base_name(&self) -> &str {
        base_name(&self.path)
    }
}

/// Last `/`-separated component of a remote path, ignoring trailing slashes.
pub fn base_name(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(idx) => &trimmed[idx + 1..],
        None => trimmed,
    }
}

/// Identity of the account a token belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub account_id: AccountId,
    pub display_name: String,
}

/// Client handle for one provider, scoped to a single operation.
///
/// Handles are produced by a [`RemoteConnector`] with the app credentials
/// and (after setup) the account token already applied. Stores never keep
/// a handle beyond the operation that created it.
#[async_trait]
pub trait RemoteObjectStore: Send + Sync {
    /// Provider name (e.g., "dropbox", "local", "memory").
    fn name(&self) -> &str;

    /// URL the operator visits to authorize this application.
    fn authorization_url(&self) -> Result<String>;

    /// Exchange an operator-supplied authorization code for an access token.
    async fn exchange_auth_code(&self, code: &str) -> Result<AccessToken>;

    /// Fetch the identity of the authenticated account.
    async fn account_info(&self) -> Result<AccountInfo>;

    /// Store `data` under `name`.
    ///
    /// # Preconditions
    /// - `size` equals `data.len()`
    ///
    /// # Postconditions
    /// - With `overwrite`, any prior object of the same name is replaced
    ///
    /// # Errors
    /// - Object exists and `overwrite` is false
    /// - Network/authentication errors
    async fn put(&self, name: &str, data: Vec<u8>, size: u64, overwrite: bool) -> Result<RemoteEntry>;

    /// Delete the object (or directory tree) named `name`.
    async fn delete(&self, name: &str) -> Result<()>;

    /// List entries under `path` (empty string is the root).
    ///
    /// With `recursive`, nested entries are included. Order is whatever
    /// the backend returns.
    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>>;

    /// Download the object `name` into a new local file at `local_path`.
    async fn download_to_file(&self, name: &str, local_path: &Path) -> Result<()>;
}

/// Produces fresh client handles for one provider.
pub trait RemoteConnector: Send + Sync {
    /// Provider name, matching the handles it produces.
    fn name(&self) -> &str;

    /// Build a client handle with the app credentials and optional token applied.
    fn connect(
        &self,
        app: &AppCredentials,
        token: Option<&AccessToken>,
    ) -> Result<Box<dyn RemoteObjectStore>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("/abc"), "abc");
        assert_eq!(base_name("abc"), "abc");
        assert_eq!(base_name("/sub/x"), "x");
        assert_eq!(base_name("/sub/"), "sub");
    }

    #[test]
    fn test_entry_constructors() {
        let file = RemoteEntry::file("/abc", 3);
        assert!(!file.is_dir);
        assert_eq!(file.size, Some(3));
        assert_eq!(file.base_name(), "abc");

        let dir = RemoteEntry::dir("/sub");
        assert!(dir.is_dir);
        assert_eq!(dir.size, None);
    }

    #[test]
    fn test_app_credentials_debug_redacts_secret() {
        let app = AppCredentials::new("key", "hunter2");
        let debug = format!("{:?}", app);
        assert!(debug.contains("key"));
        assert!(!debug.contains("hunter2"));
    }
}
