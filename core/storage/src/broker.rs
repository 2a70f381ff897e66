//! Credential acquisition for a single remote account.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info};

use chasm_common::{AccessToken, Error, Result};

use crate::remote::{AccountInfo, AppCredentials, RemoteConnector};
use crate::retry::with_deadline;

/// Source of operator-supplied authorization codes.
///
/// Given the provider's authorization URL, surfaces it to the operator and
/// blocks until a code is entered.
#[async_trait]
pub trait AuthCodeSource: Send + Sync {
    async fn obtain_code(&self, auth_url: &str) -> Result<String>;
}

#[async_trait]
impl<F> AuthCodeSource for F
where
    F: Fn(&str) -> Result<String> + Send + Sync,
{
    async fn obtain_code(&self, auth_url: &str) -> Result<String> {
        self(auth_url)
    }
}

/// Opens the authorization URL in a browser and reads the code from stdin.
#[derive(Debug, Default, Clone, Copy)]
pub struct TerminalPrompt;

#[async_trait]
impl AuthCodeSource for TerminalPrompt {
    async fn obtain_code(&self, auth_url: &str) -> Result<String> {
        open::that(auth_url).map_err(|e| {
            Error::AuthHandshake(format!("Unable to open browser for {}: {}", auth_url, e))
        })?;

        let mut stdout = tokio::io::stdout();
        stdout.write_all(b"Enter Auth Code: ").await?;
        stdout.flush().await?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await
            .map_err(|e| {
                Error::AuthHandshake(format!("Unable to read authorization code: {}", e))
            })?;

        Ok(line)
    }
}

/// Credentials obtained by a successful handshake.
#[derive(Debug, Clone)]
pub struct Authorization {
    pub token: AccessToken,
    pub account: AccountInfo,
}

/// Performs the authorization handshake for one account of one provider.
///
/// Nothing here is retried: the code is operator input and a failed
/// exchange needs a fresh code.
pub struct CredentialBroker<'a> {
    connector: &'a dyn RemoteConnector,
    app: &'a AppCredentials,
    call_timeout: Duration,
}

impl<'a> CredentialBroker<'a> {
    pub fn new(
        connector: &'a dyn RemoteConnector,
        app: &'a AppCredentials,
        call_timeout: Duration,
    ) -> Self {
        Self {
            connector,
            app,
            call_timeout,
        }
    }

    /// Obtain a token and the identity of the account it belongs to.
    ///
    /// # Errors
    /// - `AuthHandshake` if no usable code was supplied
    /// - `TokenExchange` if the provider rejected the code
    /// - `AccountLookup` if the identity could not be fetched
    pub async fn authorize(&self, codes: &dyn AuthCodeSource) -> Result<Authorization> {
        let client = self.connector.connect(self.app, None)?;
        let auth_url = client
            .authorization_url()
            .map_err(|e| Error::AuthHandshake(e.to_string()))?;

        debug!("Requesting authorization code for {}", self.connector.name());
        let code = match codes.obtain_code(&auth_url).await {
            Ok(code) => code.trim().to_string(),
            Err(Error::AuthHandshake(msg)) => return Err(Error::AuthHandshake(msg)),
            Err(e) => return Err(Error::AuthHandshake(e.to_string())),
        };
        if code.is_empty() {
            return Err(Error::AuthHandshake(
                "No authorization code entered".to_string(),
            ));
        }

        let token = with_deadline(
            self.call_timeout,
            "token exchange",
            client.exchange_auth_code(&code),
        )
        .await
        .map_err(|e| match e {
            Error::TokenExchange(msg) => Error::TokenExchange(msg),
            other => Error::TokenExchange(other.to_string()),
        })?;

        // Identity is fetched through a handle carrying the new token.
        let authed = self.connector.connect(self.app, Some(&token))?;
        let account = with_deadline(self.call_timeout, "account lookup", authed.account_info())
            .await
            .map_err(|e| match e {
                Error::AccountLookup(msg) => Error::AccountLookup(msg),
                other => Error::AccountLookup(other.to_string()),
            })?;

        info!(
            "Authorized {} account {} ({})",
            self.connector.name(),
            account.display_name,
            account.account_id
        );

        Ok(Authorization { token, account })
    }
}
