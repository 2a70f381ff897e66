//! In-memory backend for testing.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use uuid::Uuid;

use chasm_common::{AccessToken, AccountId, Error, RemoteOp, Result};

use crate::remote::{AccountInfo, AppCredentials, RemoteConnector, RemoteEntry, RemoteObjectStore};

/// In-memory storage node.
#[derive(Debug, Clone)]
enum Node {
    File(Vec<u8>),
    Directory,
}

#[derive(Debug, Clone)]
struct Account {
    id: AccountId,
    display_name: String,
}

#[derive(Debug, Clone)]
struct Fault {
    op: RemoteOp,
    name: Option<String>,
    /// Remaining transient failures; `None` rejects forever.
    transient: Option<u32>,
}

#[derive(Debug, Default)]
struct State {
    /// Authorization code -> account.
    codes: HashMap<String, Account>,
    /// Issued token -> account.
    tokens: HashMap<String, Account>,
    /// Per-account object trees keyed by `/`-rooted path.
    objects: HashMap<AccountId, BTreeMap<String, Node>>,
    faults: Vec<Fault>,
    calls: HashMap<String, usize>,
    latency: Option<Duration>,
}

impl State {
    fn record(&mut self, op: RemoteOp) {
        *self.calls.entry(op.to_string()).or_default() += 1;
    }

    fn check_fault(&mut self, op: RemoteOp, name: &str) -> Result<()> {
        let hit = self.faults.iter_mut().find(|f| {
            f.op == op && f.name.as_deref().map_or(true, |n| n == name)
        });
        match hit {
            None => Ok(()),
            Some(Fault { transient: None, .. }) => {
                Err(Error::remote(op, format!("injected failure for {}", name)))
            }
            Some(Fault {
                transient: Some(remaining),
                ..
            }) => {
                if *remaining == 0 {
                    return Ok(());
                }
                *remaining -= 1;
                Err(Error::Network(format!("injected transient failure for {}", name)))
            }
        }
    }
}

/// In-memory backend.
///
/// Holds any number of accounts, each with its own object tree. Useful for
/// testing the store workflows: failures and latency can be injected per
/// operation and every remote call is counted. All data is lost on drop.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    state: Arc<RwLock<State>>,
}

impl MemoryBackend {
    /// Create a new backend with no accounts.
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, State> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, State> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register an account reachable through authorization `code`.
    pub fn add_account(&self, code: &str, account_id: &str, display_name: &str) {
        let account = Account {
            id: AccountId::new(account_id),
            display_name: display_name.to_string(),
        };
        let mut state = self.write();
        state.objects.entry(account.id.clone()).or_default();
        state.codes.insert(code.to_string(), account);
    }

    /// Place a file directly into an account's tree, creating parents.
    pub fn insert_file(&self, account_id: &str, path: &str, data: Vec<u8>) {
        let mut state = self.write();
        let tree = state.objects.entry(AccountId::new(account_id)).or_default();
        insert_node(tree, &normalize(path), Node::File(data));
    }

    /// Place a directory directly into an account's tree, creating parents.
    pub fn insert_dir(&self, account_id: &str, path: &str) {
        let mut state = self.write();
        let tree = state.objects.entry(AccountId::new(account_id)).or_default();
        insert_node(tree, &normalize(path), Node::Directory);
    }

    /// Contents of a file in an account's tree.
    pub fn file(&self, account_id: &str, path: &str) -> Option<Vec<u8>> {
        match self
            .read()
            .objects
            .get(&AccountId::new(account_id))?
            .get(&normalize(path))?
        {
            Node::File(data) => Some(data.clone()),
            Node::Directory => None,
        }
    }

    /// Every path in an account's tree.
    pub fn paths(&self, account_id: &str) -> Vec<String> {
        self.read()
            .objects
            .get(&AccountId::new(account_id))
            .map(|tree| tree.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Reject every `op` call (on `name`, or on any name) until cleared.
    pub fn fail(&self, op: RemoteOp, name: Option<&str>) {
        self.write().faults.push(Fault {
            op,
            name: name.map(str::to_string),
            transient: None,
        });
    }

    /// Fail the next `times` matching calls with a transient network error.
    pub fn fail_transiently(&self, op: RemoteOp, name: Option<&str>, times: u32) {
        self.write().faults.push(Fault {
            op,
            name: name.map(str::to_string),
            transient: Some(times),
        });
    }

    /// Remove all injected failures.
    pub fn clear_failures(&self) {
        self.write().faults.clear();
    }

    /// Delay every remote call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.write().latency = Some(latency);
    }

    /// Number of `op` calls made so far, including failed ones.
    pub fn calls(&self, op: RemoteOp) -> usize {
        self.read().calls.get(&op.to_string()).copied().unwrap_or(0)
    }
}

impl RemoteConnector for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn connect(
        &self,
        app: &AppCredentials,
        token: Option<&AccessToken>,
    ) -> Result<Box<dyn RemoteObjectStore>> {
        Ok(Box::new(MemoryClient {
            state: self.state.clone(),
            app_key: app.key.clone(),
            token: token.cloned(),
        }))
    }
}

fn normalize(path: &str) -> String {
    let trimmed = path.trim_matches('/');
    format!("/{}", trimmed)
}

fn insert_node(tree: &mut BTreeMap<String, Node>, key: &str, node: Node) {
    let mut prefix = String::new();
    let components: Vec<&str> = key.trim_start_matches('/').split('/').collect();
    if let Some((_, parents)) = components.split_last() {
        for component in parents {
            prefix.push('/');
            prefix.push_str(component);
            tree.entry(prefix.clone()).or_insert(Node::Directory);
        }
    }
    tree.insert(key.to_string(), node);
}

/// Client handle for [`MemoryBackend`].
struct MemoryClient {
    state: Arc<RwLock<State>>,
    app_key: String,
    token: Option<AccessToken>,
}

impl MemoryClient {
    /// Count the call, honour latency and faults, and resolve the account.
    async fn begin(&self, op: RemoteOp, name: &str) -> Result<AccountId> {
        let latency = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            state.record(op);
            state.latency
        };
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }

        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.check_fault(op, name)?;

        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::NotBound("no access token applied".to_string()))?;
        state
            .tokens
            .get(token.secret())
            .map(|account| account.id.clone())
            .ok_or_else(|| Error::remote(op, "invalid access token"))
    }
}

#[async_trait]
impl RemoteObjectStore for MemoryClient {
    fn name(&self) -> &str {
        "memory"
    }

    fn authorization_url(&self) -> Result<String> {
        Ok(format!(
            "memory://authorize?client_id={}&response_type=code",
            self.app_key
        ))
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<AccessToken> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let account = state
            .codes
            .get(code)
            .cloned()
            .ok_or_else(|| Error::TokenExchange("invalid_grant".to_string()))?;

        let token = format!("mem-{}", Uuid::new_v4());
        state.tokens.insert(token.clone(), account);
        AccessToken::new(token)
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let account_id = self.begin(RemoteOp::AccountInfo, "").await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let account = state
            .tokens
            .values()
            .find(|account| account.id == account_id)
            .ok_or_else(|| Error::AccountLookup(format!("unknown account {}", account_id)))?;

        Ok(AccountInfo {
            account_id,
            display_name: account.display_name.clone(),
        })
    }

    async fn put(&self, name: &str, data: Vec<u8>, size: u64, overwrite: bool) -> Result<RemoteEntry> {
        let account = self.begin(RemoteOp::Put, name).await?;
        if size != data.len() as u64 {
            return Err(Error::InvalidInput(format!(
                "size {} does not match payload length {}",
                size,
                data.len()
            )));
        }

        let key = normalize(name);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let tree = state.objects.entry(account).or_default();

        match tree.get(&key) {
            Some(Node::Directory) => {
                return Err(Error::remote(RemoteOp::Put, format!("{} is a directory", key)));
            }
            Some(Node::File(_)) if !overwrite => {
                return Err(Error::AlreadyExists(format!("Object already exists: {}", key)));
            }
            _ => {}
        }

        insert_node(tree, &key, Node::File(data));
        Ok(RemoteEntry::file(key, size))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let account = self.begin(RemoteOp::Delete, name).await?;
        let key = normalize(name);
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let tree = state.objects.entry(account).or_default();

        if tree.remove(&key).is_none() {
            return Err(Error::remote(RemoteOp::Delete, format!("path_lookup/not_found: {}", key)));
        }
        let nested = format!("{}/", key);
        tree.retain(|path, _| !path.starts_with(&nested));
        Ok(())
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let account = self.begin(RemoteOp::List, path).await?;
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let Some(tree) = state.objects.get(&account) else {
            return Ok(Vec::new());
        };

        let root = normalize(path);
        let prefix = if root == "/" {
            "/".to_string()
        } else {
            match tree.get(&root) {
                Some(Node::Directory) => format!("{}/", root),
                _ => {
                    return Err(Error::remote(
                        RemoteOp::List,
                        format!("path/not_found: {}", root),
                    ))
                }
            }
        };

        let entries = tree
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .filter(|(key, _)| recursive || !key[prefix.len()..].contains('/'))
            .map(|(key, node)| match node {
                Node::File(data) => RemoteEntry::file(key.clone(), data.len() as u64),
                Node::Directory => RemoteEntry::dir(key.clone()),
            })
            .collect();

        Ok(entries)
    }

    async fn download_to_file(&self, name: &str, local_path: &Path) -> Result<()> {
        let account = self.begin(RemoteOp::Download, name).await?;
        let key = normalize(name);
        let data = {
            let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
            match state.objects.get(&account).and_then(|tree| tree.get(&key)) {
                Some(Node::File(data)) => data.clone(),
                Some(Node::Directory) => {
                    return Err(Error::remote(
                        RemoteOp::Download,
                        format!("{} is a directory", key),
                    ))
                }
                None => {
                    return Err(Error::remote(
                        RemoteOp::Download,
                        format!("path/not_found: {}", key),
                    ))
                }
            }
        };

        tokio::fs::write(local_path, data).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn connected(backend: &MemoryBackend) -> Box<dyn RemoteObjectStore> {
        backend.add_account("code", "42", "Ada");
        let app = AppCredentials::new("key", "secret");
        let anonymous = backend.connect(&app, None).unwrap();
        let token = anonymous.exchange_auth_code("code").await.unwrap();
        backend.connect(&app, Some(&token)).unwrap()
    }

    #[tokio::test]
    async fn test_put_and_download() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;
        let temp = tempfile::TempDir::new().unwrap();
        let target = temp.path().join("abc");

        client.put("abc", vec![1, 2, 3], 3, true).await.unwrap();
        client.download_to_file("abc", &target).await.unwrap();

        assert_eq!(std::fs::read(&target).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_put_without_overwrite_conflicts() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;

        client.put("abc", vec![1], 1, false).await.unwrap();
        let result = client.put("abc", vec![2], 1, false).await;

        assert!(matches!(result, Err(Error::AlreadyExists(_))));
        assert_eq!(backend.file("42", "abc"), Some(vec![1]));
    }

    #[tokio::test]
    async fn test_put_rejects_size_mismatch() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;

        let result = client.put("abc", vec![1, 2, 3], 2, true).await;
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_list_recursive_and_flat() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;
        backend.insert_file("42", "/a", vec![1]);
        backend.insert_file("42", "/sub/x", vec![2]);

        let flat = client.list("", false).await.unwrap();
        let flat_paths: Vec<_> = flat.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(flat_paths, vec!["/a", "/sub"]);

        let all = client.list("", true).await.unwrap();
        assert_eq!(all.len(), 3);
        assert!(all.iter().any(|e| e.path == "/sub" && e.is_dir));
    }

    #[tokio::test]
    async fn test_delete_directory_removes_subtree() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;
        backend.insert_file("42", "/sub/x", vec![2]);

        client.delete("sub").await.unwrap();
        assert!(backend.paths("42").is_empty());
    }

    #[tokio::test]
    async fn test_unknown_token_is_rejected() {
        let backend = MemoryBackend::new();
        let app = AppCredentials::new("key", "secret");
        let forged = AccessToken::new("forged").unwrap();
        let client = backend.connect(&app, Some(&forged)).unwrap();

        assert!(matches!(
            client.list("", true).await,
            Err(Error::Remote { op: RemoteOp::List, .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failure_and_call_count() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;
        backend.fail(RemoteOp::Delete, Some("b"));

        client.put("a", vec![], 0, true).await.unwrap();
        client.put("b", vec![], 0, true).await.unwrap();
        assert!(client.delete("a").await.is_ok());
        assert!(client.delete("b").await.is_err());
        assert_eq!(backend.calls(RemoteOp::Delete), 2);

        backend.clear_failures();
        assert!(client.delete("b").await.is_ok());
    }

    #[tokio::test]
    async fn test_transient_failure_runs_out() {
        let backend = MemoryBackend::new();
        let client = connected(&backend).await;
        backend.fail_transiently(RemoteOp::List, None, 1);

        assert!(matches!(client.list("", true).await, Err(Error::Network(_))));
        assert!(client.list("", true).await.is_ok());
    }
}
