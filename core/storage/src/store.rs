//! Store contract and the workflows every backend shares.
//!
//! A store is one (backend, account) binding. It keeps only the durable
//! token: every operation asks the connector for a fresh client handle with
//! the app credentials and token applied, runs each remote call under a
//! deadline, and retries transient failures.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use chasm_common::{AccessToken, AccountId, Error, Result, Share, ShareId};

use crate::broker::{AuthCodeSource, CredentialBroker};
use crate::registry::{StoreRecord, StoreRegistry};
use crate::remote::{AccountInfo, AppCredentials, RemoteConnector, RemoteEntry, RemoteObjectStore};
use crate::retry::{with_deadline, RetryConfig, RetryExecutor};

/// Per-store call policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Deadline for a single remote call.
    pub call_timeout: Duration,
    /// Retry policy for transient remote failures.
    pub retry: RetryConfig,
    /// Parent directory for restore staging; the system temp dir if unset.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
}

impl StoreConfig {
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_staging_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.staging_dir = Some(dir.into());
        self
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
            staging_dir: None,
        }
    }
}

/// Outcome of [`Store::clean`].
///
/// Cleaning keeps going past failed deletes; the names that could not be
/// removed are collected here.
#[derive(Debug, Default)]
pub struct CleanReport {
    /// Names deleted from the backend root.
    pub removed: Vec<String>,
    /// Names whose delete failed, with the reason.
    pub failed: Vec<(String, Error)>,
}

impl CleanReport {
    /// True if every listed entry was removed.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Outcome of a successful [`Store::restore`].
///
/// The staging directory now belongs to the caller, who must move its
/// contents away and remove it.
#[derive(Debug)]
pub struct RestoredShares {
    pub dir: PathBuf,
    /// Every downloaded file, in listing order.
    pub files: Vec<PathBuf>,
}

/// A bound (backend, account) unit that can hold shares.
#[async_trait]
pub trait Store: Send + Sync {
    /// Human-readable name, e.g. "Dropbox Store (Ada Lovelace)".
    fn label(&self) -> String;

    /// Bind the store to an account through the authorization handshake.
    ///
    /// On failure the store is left unbound and must not be registered.
    ///
    /// # Errors
    /// - `AuthHandshake`, `TokenExchange`, `AccountLookup` from the handshake
    /// - `DuplicateAccount` if `registry` already holds the account
    /// - `AlreadyExists` if the store is already bound
    async fn setup(
        &mut self,
        registry: &dyn StoreRegistry,
        codes: &dyn AuthCodeSource,
    ) -> Result<()>;

    /// Put the share under its id, replacing any previous content.
    async fn upload(&self, share: &Share) -> Result<()>;

    /// Delete the share with the given id.
    async fn delete(&self, sid: &ShareId) -> Result<()>;

    /// The label followed by one line per remote entry.
    ///
    /// Degrades to the label alone if the listing fails.
    async fn description(&self) -> String;

    /// Delete everything in the store.
    ///
    /// # Errors
    /// - Listing failure; nothing is deleted in that case
    async fn clean(&self) -> Result<CleanReport>;

    /// Download every file into a fresh staging directory.
    ///
    /// The first failed download aborts the restore. The staging directory
    /// is removed on every failure path.
    async fn restore(&self) -> Result<RestoredShares>;
}

#[derive(Clone)]
struct Binding {
    token: AccessToken,
    account: AccountInfo,
    added_at: DateTime<Utc>,
}

/// [`Store`] over any [`RemoteConnector`].
pub struct RemoteStore {
    connector: Arc<dyn RemoteConnector>,
    app: AppCredentials,
    config: StoreConfig,
    executor: RetryExecutor,
    provider_config: Value,
    binding: Option<Binding>,
}

impl RemoteStore {
    /// Create an unbound store; call [`Store::setup`] before use.
    pub fn new(connector: Arc<dyn RemoteConnector>, app: AppCredentials, config: StoreConfig) -> Self {
        let executor = RetryExecutor::new(config.retry.clone());
        Self {
            connector,
            app,
            config,
            executor,
            provider_config: Value::Null,
            binding: None,
        }
    }

    /// Connector configuration persisted with the store record.
    pub fn with_provider_config(mut self, provider_config: Value) -> Self {
        self.provider_config = provider_config;
        self
    }

    /// Rebuild a bound store from its registry record.
    pub fn from_record(
        connector: Arc<dyn RemoteConnector>,
        app: AppCredentials,
        config: StoreConfig,
        record: &StoreRecord,
    ) -> Result<Self> {
        if record.backend != connector.name() {
            return Err(Error::InvalidInput(format!(
                "Record for backend '{}' given to '{}' connector",
                record.backend,
                connector.name()
            )));
        }

        let mut store = Self::new(connector, app, config)
            .with_provider_config(record.provider_config.clone());
        store.binding = Some(Binding {
            token: record.access_token.clone(),
            account: AccountInfo {
                account_id: record.account_id.clone(),
                display_name: record.display_name.clone(),
            },
            added_at: record.added_at,
        });
        Ok(store)
    }

    pub fn backend(&self) -> &str {
        self.connector.name()
    }

    pub fn is_bound(&self) -> bool {
        self.binding.is_some()
    }

    pub fn account_id(&self) -> Option<&AccountId> {
        self.binding.as_ref().map(|b| &b.account.account_id)
    }

    /// Registry record for a bound store.
    pub fn record(&self) -> Result<StoreRecord> {
        let binding = self.binding()?;
        Ok(StoreRecord {
            backend: self.backend().to_string(),
            account_id: binding.account.account_id.clone(),
            display_name: binding.account.display_name.clone(),
            access_token: binding.token.clone(),
            provider_config: self.provider_config.clone(),
            added_at: binding.added_at,
        })
    }

    fn binding(&self) -> Result<&Binding> {
        self.binding.as_ref().ok_or_else(|| {
            Error::NotBound(format!("{} has no access token", self.label()))
        })
    }

    /// Run one remote primitive on a freshly authenticated client handle.
    async fn call<F, Fut, T>(&self, label: &str, op: F) -> Result<T>
    where
        F: Fn(Box<dyn RemoteObjectStore>) -> Fut + Send + Sync,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let token = &self.binding()?.token;
        let op = &op;
        self.executor
            .execute(label, || async move {
                let client = self.connector.connect(&self.app, Some(token))?;
                with_deadline(self.config.call_timeout, label, op(client)).await
            })
            .await
    }

    async fn list_all(&self) -> Result<Vec<RemoteEntry>> {
        self.call("list", |client: Box<dyn RemoteObjectStore>| async move {
            client.list("", true).await
        })
        .await
    }

    fn staging_dir(&self) -> Result<tempfile::TempDir> {
        let mut builder = tempfile::Builder::new();
        let prefix = format!("chasm_{}_restore", self.backend());
        builder.prefix(&prefix);
        let staged = match &self.config.staging_dir {
            Some(parent) => builder.tempdir_in(parent),
            None => builder.tempdir(),
        };
        staged.map_err(|e| Error::Staging(format!("Failed to create restore directory: {}", e)))
    }

    async fn download_all(&self, entries: &[RemoteEntry], staging: &Path) -> Result<Vec<PathBuf>> {
        // Every target is checked before anything is written.
        let planned = entries
            .iter()
            .filter(|e| !e.is_dir)
            .map(|entry| -> Result<(&RemoteEntry, PathBuf)> {
                Ok((entry, staging.join(relative_path(&entry.path)?)))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut files = Vec::new();
        for (entry, target) in planned {
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::Staging(e.to_string()))?;
            }

            debug!("Downloading {} to {}", entry.path, target.display());
            let name = entry.path.as_str();
            let dest = target.as_path();
            self.call("download", |client: Box<dyn RemoteObjectStore>| async move {
                client.download_to_file(name, dest).await
            })
            .await
            .map_err(|e| {
                error!("Download of {} failed: {}", entry.path, e);
                e
            })?;

            info!("✓ Downloaded {}", entry.base_name());
            files.push(target);
        }
        Ok(files)
    }
}

#[async_trait]
impl Store for RemoteStore {
    fn label(&self) -> String {
        let owner = match &self.binding {
            Some(binding) => binding.account.display_name.as_str(),
            None => "not set up",
        };
        format!("{} Store ({})", title_case(self.backend()), owner)
    }

    async fn setup(
        &mut self,
        registry: &dyn StoreRegistry,
        codes: &dyn AuthCodeSource,
    ) -> Result<()> {
        if self.binding.is_some() {
            return Err(Error::AlreadyExists(format!("{} is already set up", self.label())));
        }

        let broker = CredentialBroker::new(self.connector.as_ref(), &self.app, self.config.call_timeout);
        let auth = broker.authorize(codes).await.map_err(|e| {
            error!("Setup of {} store failed: {}", self.backend(), e);
            e
        })?;

        if registry
            .find_account(self.backend(), &auth.account.account_id)
            .is_some()
        {
            let err = Error::DuplicateAccount {
                display_name: auth.account.display_name.clone(),
            };
            error!("Setup of {} store failed: {}", self.backend(), err);
            return Err(err);
        }

        self.binding = Some(Binding {
            token: auth.token,
            account: auth.account,
            added_at: Utc::now(),
        });
        info!("✓ {} is set up", self.label());
        Ok(())
    }

    async fn upload(&self, share: &Share) -> Result<()> {
        let name = share.sid.as_str();
        let data = &share.data;
        let size = share.size();

        info!("Uploading share {} ({} bytes) to {}", name, size, self.label());
        let result = self
            .call("upload", |client: Box<dyn RemoteObjectStore>| {
                let data = data.clone();
                async move { client.put(name, data, size, true).await }
            })
            .await;

        match result {
            Ok(_) => {
                info!("✓ Uploaded share {}", name);
                Ok(())
            }
            Err(e) => {
                error!("Upload of share {} to {} failed: {}", name, self.label(), e);
                Err(e)
            }
        }
    }

    async fn delete(&self, sid: &ShareId) -> Result<()> {
        let name = sid.as_str();
        info!("Deleting share {} from {}", name, self.label());
        let result = self
            .call("delete", |client: Box<dyn RemoteObjectStore>| async move {
                client.delete(name).await
            })
            .await;

        match result {
            Ok(()) => {
                info!("✓ Deleted share {} from {}", name, self.label());
                Ok(())
            }
            Err(e) => {
                error!("Delete of share {} from {} failed: {}", name, self.label(), e);
                Err(e)
            }
        }
    }

    async fn description(&self) -> String {
        let mut text = self.label();
        match self.list_all().await {
            Ok(entries) => {
                for entry in &entries {
                    text.push_str("\n\t- ");
                    text.push_str(entry.base_name());
                }
            }
            Err(e) => warn!("Listing {} failed: {}", text, e),
        }
        text
    }

    async fn clean(&self) -> Result<CleanReport> {
        let label = self.label();
        info!("Cleaning {}", label);

        let entries = self.list_all().await.map_err(|e| {
            error!("Clean of {} aborted, listing failed: {}", label, e);
            e
        })?;

        // Nested entries go with their top-level directory.
        let mut report = CleanReport::default();
        for entry in entries.iter().filter(|e| is_top_level(&e.path)) {
            let name = entry.base_name();
            let result = self
                .call("delete", |client: Box<dyn RemoteObjectStore>| async move {
                    client.delete(name).await
                })
                .await;

            match result {
                Ok(()) => {
                    info!("✓ Removed {}", name);
                    report.removed.push(name.to_string());
                }
                Err(e) => {
                    warn!("Failed to remove {}: {}", name, e);
                    report.failed.push((name.to_string(), e));
                }
            }
        }

        if report.is_complete() {
            info!("✓ Cleaned {} ({} removed)", label, report.removed.len());
        } else {
            let names: Vec<&str> = report.failed.iter().map(|(n, _)| n.as_str()).collect();
            error!(
                "Clean of {} left {} entries behind: {}",
                label,
                names.len(),
                names.join(", ")
            );
        }
        Ok(report)
    }

    async fn restore(&self) -> Result<RestoredShares> {
        let label = self.label();
        self.binding()?;

        let staging = self.staging_dir().map_err(|e| {
            error!("Restore from {} failed: {}", label, e);
            e
        })?;
        info!("Restoring {} into {}", label, staging.path().display());

        // Dropping `staging` on any error below removes it.
        let entries = self.list_all().await.map_err(|e| {
            error!("Restore from {} aborted, listing failed: {}", label, e);
            e
        })?;
        let files = self.download_all(&entries, staging.path()).await?;

        let dir = staging.keep();
        info!("✓ Restored {} files from {} to {}", files.len(), label, dir.display());
        Ok(RestoredShares { dir, files })
    }
}

/// Local path of a remote entry, relative to the restore directory.
///
/// Only plain name components are accepted, so the result never leaves
/// the directory it is joined to.
fn relative_path(remote: &str) -> Result<PathBuf> {
    let mut relative = PathBuf::new();
    for component in Path::new(remote.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => relative.push(part),
            _ => {
                return Err(Error::InvalidInput(format!(
                    "Remote entry escapes the restore directory: {}",
                    remote
                )))
            }
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(Error::InvalidInput(format!(
            "Remote entry has no name: {:?}",
            remote
        )));
    }
    Ok(relative)
}

fn is_top_level(path: &str) -> bool {
    !path.trim_matches('/').contains('/')
}

fn title_case(name: &str) -> String {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use chasm_common::RemoteOp;
    use tempfile::TempDir;

    fn app() -> AppCredentials {
        AppCredentials::new("app-key", "app-secret")
    }

    fn config() -> StoreConfig {
        StoreConfig::default()
            .with_call_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::disabled())
    }

    fn entered(code: &'static str) -> impl Fn(&str) -> Result<String> + Send + Sync {
        move |_: &str| Ok(code.to_string())
    }

    fn share(sid: &str, data: &[u8]) -> Share {
        Share::new(ShareId::new(sid).unwrap(), data.to_vec())
    }

    async fn bound_with(backend: &MemoryBackend, config: StoreConfig) -> RemoteStore {
        backend.add_account("ada-code", "1001", "Ada");
        let mut store = RemoteStore::new(Arc::new(backend.clone()), app(), config);
        store
            .setup(&Vec::<StoreRecord>::new(), &entered("ada-code"))
            .await
            .unwrap();
        store
    }

    async fn bound(backend: &MemoryBackend) -> RemoteStore {
        bound_with(backend, config()).await
    }

    #[tokio::test]
    async fn test_setup_binds_new_account() {
        let backend = MemoryBackend::new();
        backend.add_account("code", "1001", "Ada");
        let mut store = RemoteStore::new(Arc::new(backend.clone()), app(), config());
        assert!(!store.is_bound());

        store
            .setup(&Vec::<StoreRecord>::new(), &entered("code"))
            .await
            .unwrap();

        assert!(store.is_bound());
        assert_eq!(store.account_id().unwrap().as_str(), "1001");
        let record = store.record().unwrap();
        assert!(!record.access_token.secret().is_empty());
        assert_eq!(record.backend, "memory");
        assert_eq!(store.label(), "Memory Store (Ada)");
    }

    #[tokio::test]
    async fn test_setup_rejects_registered_account() {
        let backend = MemoryBackend::new();
        let existing = bound(&backend).await.record().unwrap();
        let registry = vec![existing];

        let mut store = RemoteStore::new(Arc::new(backend.clone()), app(), config());
        let result = store.setup(&registry, &entered("ada-code")).await;

        assert!(matches!(
            result,
            Err(Error::DuplicateAccount { ref display_name }) if display_name == "Ada"
        ));
        assert!(!store.is_bound());
        assert!(store.record().is_err());
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_setup_allows_second_account() {
        let backend = MemoryBackend::new();
        let registry = vec![bound(&backend).await.record().unwrap()];
        backend.add_account("bob-code", "2002", "Bob");

        let mut store = RemoteStore::new(Arc::new(backend.clone()), app(), config());
        store.setup(&registry, &entered("bob-code")).await.unwrap();

        assert_eq!(store.account_id().unwrap().as_str(), "2002");
    }

    #[tokio::test]
    async fn test_failed_handshake_leaves_store_unbound() {
        let backend = MemoryBackend::new();
        let mut store = RemoteStore::new(Arc::new(backend.clone()), app(), config());

        let result = store
            .setup(&Vec::<StoreRecord>::new(), &entered("wrong"))
            .await;

        assert!(matches!(result, Err(Error::TokenExchange(_))));
        assert!(!store.is_bound());
    }

    #[tokio::test]
    async fn test_setup_twice_fails() {
        let backend = MemoryBackend::new();
        let mut store = bound(&backend).await;

        let result = store
            .setup(&Vec::<StoreRecord>::new(), &entered("ada-code"))
            .await;
        assert!(matches!(result, Err(Error::AlreadyExists(_))));
    }

    #[tokio::test]
    async fn test_unbound_store_refuses_operations() {
        let backend = MemoryBackend::new();
        let store = RemoteStore::new(Arc::new(backend.clone()), app(), config());

        assert!(matches!(
            store.upload(&share("abc", b"x")).await,
            Err(Error::NotBound(_))
        ));
        assert!(matches!(store.restore().await, Err(Error::NotBound(_))));
        assert_eq!(store.description().await, "Memory Store (not set up)");
        assert_eq!(backend.calls(RemoteOp::List), 0);
    }

    #[tokio::test]
    async fn test_upload_creates_one_entry() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;

        store.upload(&share("abc", &[1, 2, 3])).await.unwrap();

        let entries = store.list_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].base_name(), "abc");
        assert_eq!(entries[0].size, Some(3));
    }

    #[tokio::test]
    async fn test_upload_same_id_replaces_content() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;

        store.upload(&share("abc", b"first")).await.unwrap();
        store.upload(&share("abc", b"second")).await.unwrap();

        let entries = store.list_all().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(backend.file("1001", "abc").unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_upload_failure_is_reported() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        backend.fail(RemoteOp::Put, Some("abc"));

        let result = store.upload(&share("abc", b"x")).await;
        assert!(matches!(result, Err(Error::Remote { op: RemoteOp::Put, .. })));
    }

    #[tokio::test]
    async fn test_delete_removes_share() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        store.upload(&share("abc", b"x")).await.unwrap();
        store.upload(&share("def", b"y")).await.unwrap();

        store.delete(&ShareId::new("abc").unwrap()).await.unwrap();

        let names: Vec<String> = store
            .list_all()
            .await
            .unwrap()
            .iter()
            .map(|e| e.base_name().to_string())
            .collect();
        assert_eq!(names, vec!["def"]);
    }

    #[tokio::test]
    async fn test_delete_missing_share_fails() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;

        let result = store.delete(&ShareId::new("nope").unwrap()).await;
        assert!(matches!(result, Err(Error::Remote { op: RemoteOp::Delete, .. })));
    }

    #[tokio::test]
    async fn test_description_lists_base_names() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        backend.insert_file("1001", "a", vec![1]);
        backend.insert_file("1001", "sub/x", vec![2]);

        assert_eq!(
            store.description().await,
            "Memory Store (Ada)\n\t- a\n\t- sub\n\t- x"
        );
    }

    #[tokio::test]
    async fn test_description_degrades_to_label() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        backend.insert_file("1001", "a", vec![1]);
        backend.fail(RemoteOp::List, None);

        assert_eq!(store.description().await, "Memory Store (Ada)");
    }

    #[tokio::test]
    async fn test_clean_empties_store() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        for name in ["a", "b", "c"] {
            backend.insert_file("1001", name, vec![0]);
        }

        let report = store.clean().await.unwrap();

        assert!(report.is_complete());
        assert_eq!(report.removed, vec!["a", "b", "c"]);
        assert!(store.list_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_clean_removes_directories_once() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        backend.insert_file("1001", "a", vec![0]);
        backend.insert_file("1001", "sub/x", vec![0]);

        let report = store.clean().await.unwrap();

        assert_eq!(report.removed, vec!["a", "sub"]);
        assert_eq!(backend.calls(RemoteOp::Delete), 2);
        assert!(backend.paths("1001").is_empty());
    }

    #[tokio::test]
    async fn test_clean_continues_past_failed_delete() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        for name in ["a", "b", "c"] {
            backend.insert_file("1001", name, vec![0]);
        }
        backend.fail(RemoteOp::Delete, Some("b"));

        let report = store.clean().await.unwrap();

        assert_eq!(report.removed, vec!["a", "c"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "b");
        assert_eq!(backend.paths("1001"), vec!["/b"]);
    }

    #[tokio::test]
    async fn test_clean_never_deletes_when_listing_fails() {
        let backend = MemoryBackend::new();
        let store = bound(&backend).await;
        backend.insert_file("1001", "a", vec![0]);
        backend.fail(RemoteOp::List, None);

        assert!(store.clean().await.is_err());
        assert_eq!(backend.calls(RemoteOp::Delete), 0);
        assert_eq!(backend.paths("1001"), vec!["/a"]);
    }

    #[tokio::test]
    async fn test_restore_downloads_files_only() {
        let backend = MemoryBackend::new();
        let staging = TempDir::new().unwrap();
        let store = bound_with(&backend, config().with_staging_dir(staging.path())).await;
        backend.insert_file("1001", "x", b"payload".to_vec());
        backend.insert_dir("1001", "sub");

        let restored = store.restore().await.unwrap();

        assert!(restored.dir.starts_with(staging.path()));
        assert_eq!(restored.files, vec![restored.dir.join("x")]);
        assert_eq!(std::fs::read(restored.dir.join("x")).unwrap(), b"payload");
        assert!(!restored.dir.join("sub").exists());
        std::fs::remove_dir_all(&restored.dir).unwrap();
    }

    #[tokio::test]
    async fn test_restore_matches_listing() {
        let backend = MemoryBackend::new();
        let staging = TempDir::new().unwrap();
        let store = bound_with(&backend, config().with_staging_dir(staging.path())).await;
        store.upload(&share("s1", b"one")).await.unwrap();
        store.upload(&share("s2", b"two")).await.unwrap();
        backend.insert_file("1001", "nested/s3", b"three".to_vec());

        let restored = store.restore().await.unwrap();

        for entry in store.list_all().await.unwrap().iter().filter(|e| !e.is_dir) {
            let local = restored.dir.join(relative_path(&entry.path).unwrap());
            assert_eq!(
                std::fs::read(local).unwrap(),
                backend.file("1001", &entry.path).unwrap()
            );
        }
        assert_eq!(restored.files.len(), 3);
    }

    #[tokio::test]
    async fn test_restore_failure_removes_staging() {
        let backend = MemoryBackend::new();
        let staging = TempDir::new().unwrap();
        let store = bound_with(&backend, config().with_staging_dir(staging.path())).await;
        backend.insert_file("1001", "x", vec![1]);
        backend.insert_file("1001", "y", vec![2]);
        backend.insert_file("1001", "z", vec![3]);
        backend.fail(RemoteOp::Download, Some("/y"));

        let result = store.restore().await;

        assert!(matches!(result, Err(Error::Remote { op: RemoteOp::Download, .. })));
        // Aborted at "y": "z" is never attempted.
        assert_eq!(backend.calls(RemoteOp::Download), 2);
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_restore_rejects_entries_escaping_staging() {
        let backend = MemoryBackend::new();
        let parent = TempDir::new().unwrap();
        let staging = parent.path().join("staging");
        std::fs::create_dir(&staging).unwrap();
        let store = bound_with(&backend, config().with_staging_dir(&staging)).await;
        backend.insert_file("1001", "a", vec![1]);
        backend.insert_file("1001", "../../escaped", b"outside".to_vec());

        let result = store.restore().await;

        assert!(matches!(result, Err(Error::InvalidInput(_))));
        assert_eq!(backend.calls(RemoteOp::Download), 0);
        assert!(!parent.path().join("escaped").exists());
        assert_eq!(std::fs::read_dir(&staging).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_restore_listing_failure_removes_staging() {
        let backend = MemoryBackend::new();
        let staging = TempDir::new().unwrap();
        let store = bound_with(&backend, config().with_staging_dir(staging.path())).await;
        backend.fail(RemoteOp::List, None);

        assert!(store.restore().await.is_err());
        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_restore_staging_failure() {
        let backend = MemoryBackend::new();
        let temp = TempDir::new().unwrap();
        let not_a_dir = temp.path().join("file");
        std::fs::write(&not_a_dir, b"").unwrap();
        let store = bound_with(&backend, config().with_staging_dir(&not_a_dir)).await;

        assert!(matches!(store.restore().await, Err(Error::Staging(_))));
        assert_eq!(backend.calls(RemoteOp::List), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let backend = MemoryBackend::new();
        let retry = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);
        let store = bound_with(&backend, config().with_retry(retry)).await;
        backend.fail_transiently(RemoteOp::Put, Some("abc"), 2);

        store.upload(&share("abc", b"x")).await.unwrap();

        assert_eq!(backend.calls(RemoteOp::Put), 3);
        assert_eq!(backend.file("1001", "abc").unwrap(), b"x");
    }

    #[tokio::test]
    async fn test_permanent_failures_are_not_retried() {
        let backend = MemoryBackend::new();
        let retry = RetryConfig::new(3).with_initial_delay(Duration::from_millis(1));
        let store = bound_with(&backend, config().with_retry(retry)).await;
        backend.fail(RemoteOp::Put, None);

        assert!(store.upload(&share("abc", b"x")).await.is_err());
        assert_eq!(backend.calls(RemoteOp::Put), 1);
    }

    #[tokio::test]
    async fn test_slow_call_times_out() {
        let backend = MemoryBackend::new();
        let store = bound_with(
            &backend,
            config().with_call_timeout(Duration::from_millis(20)),
        )
        .await;
        backend.set_latency(Duration::from_millis(500));

        let result = store.upload(&share("abc", b"x")).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn test_rebuilt_store_reuses_token() {
        let backend = MemoryBackend::new();
        let record = bound(&backend).await.record().unwrap();

        let store = RemoteStore::from_record(Arc::new(backend.clone()), app(), config(), &record)
            .unwrap();
        store.upload(&share("abc", b"x")).await.unwrap();

        assert_eq!(store.label(), "Memory Store (Ada)");
        assert_eq!(store.record().unwrap().added_at, record.added_at);
        assert_eq!(backend.file("1001", "abc").unwrap(), b"x");
    }

    #[test]
    fn test_record_for_other_backend_is_rejected() {
        let record = StoreRecord {
            backend: "dropbox".to_string(),
            account_id: AccountId::new("1"),
            display_name: "Ada".to_string(),
            access_token: AccessToken::new("t").unwrap(),
            provider_config: Value::Null,
            added_at: Utc::now(),
        };

        let result = RemoteStore::from_record(Arc::new(MemoryBackend::new()), app(), config(), &record);
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_path_helpers() {
        assert!(is_top_level("/a"));
        assert!(!is_top_level("/sub/x"));
        assert_eq!(relative_path("/sub/x").unwrap(), PathBuf::from("sub").join("x"));
        assert!(relative_path("/../x").is_err());
        assert!(relative_path("/sub/../../x").is_err());
        assert!(relative_path("./x").is_err());
        assert!(relative_path("/").is_err());
        assert_eq!(title_case("dropbox"), "Dropbox");
    }
}
