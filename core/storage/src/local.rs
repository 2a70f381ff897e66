//! Local filesystem backend.

use async_trait::async_trait;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use url::Url;

use chasm_common::{AccessToken, AccountId, Error, RemoteOp, Result};

use crate::remote::{AccountInfo, AppCredentials, RemoteConnector, RemoteEntry, RemoteObjectStore};

const TOKEN_PREFIX: &str = "local:";

/// Local filesystem backend.
///
/// Stores shares as files under a root directory, e.g. a mounted removable
/// drive. The account is the root itself: its id is a CRC32 of the root
/// path, and the token issued by the handshake is only accepted by the
/// same root.
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    /// Create a new local backend with the given root directory.
    ///
    /// # Postconditions
    /// - Root directory is created if it doesn't exist
    /// - Root is stored in canonical form, so the account id is stable
    ///
    /// # Errors
    /// - Permission denied
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();

        // Sync for constructor
        if !root.exists() {
            std::fs::create_dir_all(root)?;
        }

        Ok(Self {
            root: std::fs::canonicalize(root)?,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn account_id(&self) -> AccountId {
        let checksum = crc32fast::hash(self.root.to_string_lossy().as_bytes());
        AccountId::new(format!("{:08x}", checksum))
    }
}

impl RemoteConnector for LocalBackend {
    fn name(&self) -> &str {
        "local"
    }

    fn connect(
        &self,
        app: &AppCredentials,
        token: Option<&AccessToken>,
    ) -> Result<Box<dyn RemoteObjectStore>> {
        Ok(Box::new(LocalClient {
            root: self.root.clone(),
            account_id: self.account_id(),
            app_key: app.key.clone(),
            token: token.cloned(),
        }))
    }
}

/// Client handle for [`LocalBackend`].
struct LocalClient {
    root: PathBuf,
    account_id: AccountId,
    app_key: String,
    token: Option<AccessToken>,
}

impl LocalClient {
    fn authenticate(&self, op: RemoteOp) -> Result<()> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::NotBound("no access token applied".to_string()))?;
        let expected = format!("{}{}", TOKEN_PREFIX, self.account_id);
        if token.secret() != expected {
            return Err(Error::remote(op, "access token belongs to a different root"));
        }
        Ok(())
    }

    /// Convert a remote name to a filesystem path under the root.
    fn to_fs_path(&self, name: &str) -> Result<PathBuf> {
        let relative = Path::new(name.trim_start_matches('/'));
        let mut fs_path = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(part) => fs_path.push(part),
                Component::CurDir => {}
                _ => {
                    return Err(Error::InvalidInput(format!(
                        "Remote name escapes the store root: {}",
                        name
                    )))
                }
            }
        }
        Ok(fs_path)
    }

    fn to_remote_path(&self, fs_path: &Path) -> String {
        let relative = fs_path.strip_prefix(&self.root).unwrap_or(fs_path);
        let parts: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        format!("/{}", parts.join("/"))
    }
}

#[async_trait]
impl RemoteObjectStore for LocalClient {
    fn name(&self) -> &str {
        "local"
    }

    fn authorization_url(&self) -> Result<String> {
        let mut url = Url::from_directory_path(&self.root).map_err(|_| {
            Error::InvalidInput(format!("Root is not absolute: {}", self.root.display()))
        })?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.app_key)
            .append_pair("response_type", "code")
            .append_pair("code", self.account_id.as_str());
        Ok(url.to_string())
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<AccessToken> {
        if code != self.account_id.as_str() {
            return Err(Error::TokenExchange(format!(
                "code does not match store at {}",
                self.root.display()
            )));
        }
        AccessToken::new(format!("{}{}", TOKEN_PREFIX, self.account_id))
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        self.authenticate(RemoteOp::AccountInfo)?;
        Ok(AccountInfo {
            account_id: self.account_id.clone(),
            display_name: self.root.display().to_string(),
        })
    }

    async fn put(&self, name: &str, data: Vec<u8>, size: u64, overwrite: bool) -> Result<RemoteEntry> {
        self.authenticate(RemoteOp::Put)?;
        if size != data.len() as u64 {
            return Err(Error::InvalidInput(format!(
                "size {} does not match payload length {}",
                size,
                data.len()
            )));
        }

        let fs_path = self.to_fs_path(name)?;
        if fs_path.is_dir() {
            return Err(Error::remote(RemoteOp::Put, format!("{} is a directory", name)));
        }
        if fs_path.exists() && !overwrite {
            return Err(Error::AlreadyExists(format!("Object already exists: {}", name)));
        }
        if let Some(parent) = fs_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::write(&fs_path, &data).await?;
        Ok(RemoteEntry::file(self.to_remote_path(&fs_path), size))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.authenticate(RemoteOp::Delete)?;
        let fs_path = self.to_fs_path(name)?;

        if fs_path.is_dir() {
            fs::remove_dir_all(&fs_path).await?;
        } else if fs_path.exists() {
            fs::remove_file(&fs_path).await?;
        } else {
            return Err(Error::remote(RemoteOp::Delete, format!("not found: {}", name)));
        }
        Ok(())
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        self.authenticate(RemoteOp::List)?;
        let start = self.to_fs_path(path)?;
        if !start.is_dir() {
            return Err(Error::remote(RemoteOp::List, format!("not a directory: {}", path)));
        }

        let mut results = Vec::new();
        let mut pending = vec![start];

        while let Some(dir) = pending.pop() {
            let mut entries = fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                let entry_path = entry.path();
                let fs_meta = entry.metadata().await?;
                let remote_path = self.to_remote_path(&entry_path);

                if fs_meta.is_dir() {
                    results.push(RemoteEntry::dir(remote_path));
                    if recursive {
                        pending.push(entry_path);
                    }
                } else {
                    results.push(RemoteEntry::file(remote_path, fs_meta.len()));
                }
            }
        }

        Ok(results)
    }

    async fn download_to_file(&self, name: &str, local_path: &Path) -> Result<()> {
        self.authenticate(RemoteOp::Download)?;
        let fs_path = self.to_fs_path(name)?;

        if !fs_path.is_file() {
            return Err(Error::remote(RemoteOp::Download, format!("not a file: {}", name)));
        }

        fs::copy(&fs_path, local_path).await?;
        Ok(())
    }
}
