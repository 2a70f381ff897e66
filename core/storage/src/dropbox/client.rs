//! Dropbox v2 API client.

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use reqwest::{header, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use chasm_common::{AccessToken, AccountId, Error, RemoteOp, Result};

use crate::remote::{AccountInfo, AppCredentials, RemoteConnector, RemoteEntry, RemoteObjectStore};

use super::auth;

/// Dropbox RPC API base URL.
const DROPBOX_API_BASE: &str = "https://api.dropboxapi.com/2";
/// Dropbox content API base URL.
const DROPBOX_CONTENT_BASE: &str = "https://content.dropboxapi.com/2";
/// Header carrying JSON arguments on content endpoints.
const API_ARG_HEADER: &str = "Dropbox-API-Arg";

/// Dropbox backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxConfig {
    /// RPC endpoint base.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Content (upload/download) endpoint base.
    #[serde(default = "default_content_base")]
    pub content_base: String,
}

fn default_api_base() -> String {
    DROPBOX_API_BASE.to_string()
}

fn default_content_base() -> String {
    DROPBOX_CONTENT_BASE.to_string()
}

impl Default for DropboxConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            content_base: default_content_base(),
        }
    }
}

/// Dropbox backend.
pub struct DropboxBackend {
    config: DropboxConfig,
}

impl DropboxBackend {
    pub fn new(config: DropboxConfig) -> Self {
        Self { config }
    }
}

impl Default for DropboxBackend {
    fn default() -> Self {
        Self::new(DropboxConfig::default())
    }
}

impl RemoteConnector for DropboxBackend {
    fn name(&self) -> &str {
        "dropbox"
    }

    fn connect(
        &self,
        app: &AppCredentials,
        token: Option<&AccessToken>,
    ) -> Result<Box<dyn RemoteObjectStore>> {
        let http = Client::builder()
            .user_agent(concat!("chasm/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Box::new(DropboxClient {
            http,
            config: self.config.clone(),
            app: app.clone(),
            token: token.cloned(),
        }))
    }
}

/// One entry of a `list_folder` page.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = ".tag", rename_all = "lowercase")]
enum ListedEntry {
    File { path_display: String, size: u64 },
    Folder { path_display: String },
    Deleted { path_display: String },
}

impl ListedEntry {
    fn into_remote(self) -> Option<RemoteEntry> {
        match self {
            ListedEntry::File { path_display, size } => Some(RemoteEntry::file(path_display, size)),
            ListedEntry::Folder { path_display } => Some(RemoteEntry::dir(path_display)),
            ListedEntry::Deleted { .. } => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<ListedEntry>,
    cursor: String,
    has_more: bool,
}

/// Metadata returned by `files/upload`.
#[derive(Debug, Deserialize)]
struct UploadedFile {
    path_display: String,
    size: u64,
}

#[derive(Debug, Deserialize)]
struct AccountName {
    display_name: String,
}

#[derive(Debug, Deserialize)]
struct FullAccount {
    account_id: String,
    name: AccountName,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error_summary: String,
}

/// Normalise a share name to a Dropbox path (rooted, no trailing slash).
fn dropbox_path(name: &str) -> String {
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("/{}", trimmed)
    }
}

/// Serialize `Dropbox-API-Arg` JSON, escaping non-ASCII as `\uXXXX`.
///
/// HTTP header values must be ASCII.
fn api_arg(value: &serde_json::Value) -> Result<String> {
    let json = serde_json::to_string(value)?;
    let mut escaped = String::with_capacity(json.len());
    for ch in json.chars() {
        if ch.is_ascii() {
            escaped.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                escaped.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    Ok(escaped)
}

/// Client handle for [`DropboxBackend`].
struct DropboxClient {
    http: Client,
    config: DropboxConfig,
    app: AppCredentials,
    token: Option<AccessToken>,
}

impl DropboxClient {
    /// Get authorization header.
    fn auth_header(&self) -> Result<String> {
        let token = self
            .token
            .as_ref()
            .ok_or_else(|| Error::NotBound("no access token applied".to_string()))?;
        Ok(format!("Bearer {}", token.secret()))
    }

    /// POST a JSON argument to an RPC endpoint.
    async fn rpc(
        &self,
        op: RemoteOp,
        endpoint: &str,
        arg: Option<serde_json::Value>,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.config.api_base, endpoint);
        let mut request = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header()?);

        if let Some(arg) = arg {
            request = request.json(&arg);
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::Network(format!("{} request failed: {}", endpoint, e)))?;

        check_status(op, response).await
    }

    async fn list_continue(&self, cursor: &str) -> Result<ListFolderResponse> {
        let response = self
            .rpc(
                RemoteOp::List,
                "files/list_folder/continue",
                Some(serde_json::json!({ "cursor": cursor })),
            )
            .await?;
        parse_json(RemoteOp::List, response).await
    }
}

/// Map an API response status onto the error taxonomy.
///
/// 409 carries an endpoint-specific error summary; 429 and 5xx are
/// transient and surface as network errors.
async fn check_status(op: RemoteOp, response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let summary = serde_json::from_str::<ApiError>(&body)
        .map(|e| e.error_summary)
        .unwrap_or(body);

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        Err(Error::Network(format!("{} ({}): {}", op, status, summary)))
    } else if status == StatusCode::UNAUTHORIZED {
        Err(Error::remote(op, format!("invalid or expired access token: {}", summary)))
    } else {
        Err(Error::remote(op, format!("{}: {}", status, summary)))
    }
}

async fn parse_json<T: serde::de::DeserializeOwned>(
    op: RemoteOp,
    response: reqwest::Response,
) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::remote(op, format!("Failed to parse response: {}", e)))
}

#[async_trait]
impl RemoteObjectStore for DropboxClient {
    fn name(&self) -> &str {
        "dropbox"
    }

    fn authorization_url(&self) -> Result<String> {
        auth::authorization_url(&self.app)
    }

    async fn exchange_auth_code(&self, code: &str) -> Result<AccessToken> {
        auth::exchange_code(&self.app, code).await
    }

    async fn account_info(&self) -> Result<AccountInfo> {
        let response = self
            .rpc(RemoteOp::AccountInfo, "users/get_current_account", None)
            .await?;
        let account: FullAccount = parse_json(RemoteOp::AccountInfo, response).await?;

        Ok(AccountInfo {
            account_id: AccountId::new(account.account_id),
            display_name: account.name.display_name,
        })
    }

    async fn put(&self, name: &str, data: Vec<u8>, size: u64, overwrite: bool) -> Result<RemoteEntry> {
        if size != data.len() as u64 {
            return Err(Error::InvalidInput(format!(
                "size {} does not match payload length {}",
                size,
                data.len()
            )));
        }

        let path = dropbox_path(name);
        let arg = api_arg(&serde_json::json!({
            "path": path,
            "mode": if overwrite { "overwrite" } else { "add" },
            "autorename": false,
            "mute": true,
        }))?;

        let url = format!("{}/files/upload", self.config.content_base);
        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header()?)
            .header(API_ARG_HEADER, arg)
            .header(header::CONTENT_TYPE, "application/octet-stream")
            .body(data)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to upload {}: {}", path, e)))?;

        let response = check_status(RemoteOp::Put, response).await.map_err(|e| match e {
            Error::Remote { message, .. } if message.contains("conflict") => {
                Error::AlreadyExists(format!("Object already exists: {}", path))
            }
            other => other,
        })?;

        let uploaded: UploadedFile = parse_json(RemoteOp::Put, response).await?;
        Ok(RemoteEntry::file(uploaded.path_display, uploaded.size))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let path = dropbox_path(name);
        self.rpc(
            RemoteOp::Delete,
            "files/delete_v2",
            Some(serde_json::json!({ "path": path })),
        )
        .await?;
        Ok(())
    }

    async fn list(&self, path: &str, recursive: bool) -> Result<Vec<RemoteEntry>> {
        let response = self
            .rpc(
                RemoteOp::List,
                "files/list_folder",
                Some(serde_json::json!({
                    "path": dropbox_path(path),
                    "recursive": recursive,
                })),
            )
            .await?;
        let mut page: ListFolderResponse = parse_json(RemoteOp::List, response).await?;

        let mut all_entries = Vec::new();
        loop {
            all_entries.extend(page.entries.into_iter().filter_map(ListedEntry::into_remote));
            if !page.has_more {
                break;
            }
            debug!("Fetching next listing page");
            page = self.list_continue(&page.cursor).await?;
        }

        Ok(all_entries)
    }

    async fn download_to_file(&self, name: &str, local_path: &Path) -> Result<()> {
        let path = dropbox_path(name);
        let arg = api_arg(&serde_json::json!({ "path": path }))?;

        let url = format!("{}/files/download", self.config.content_base);
        let response = self
            .http
            .post(&url)
            .header(header::AUTHORIZATION, self.auth_header()?)
            .header(API_ARG_HEADER, arg)
            .send()
            .await
            .map_err(|e| Error::Network(format!("Failed to download {}: {}", path, e)))?;
        let response = check_status(RemoteOp::Download, response).await?;

        let mut file = fs::File::create(local_path).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk: Bytes = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = fs::remove_file(local_path).await;
                    return Err(Error::Network(format!("Stream read error: {}", e)));
                }
            };
            file.write_all(&chunk).await?;
        }
        file.flush().await?;

        Ok(())
    }
}
