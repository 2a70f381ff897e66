//! OAuth2 authorization for Dropbox.

use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    TokenResponse, TokenUrl,
};

use chasm_common::{AccessToken, Error, Result};

use crate::remote::AppCredentials;

/// OAuth2 authorization endpoint.
const DROPBOX_AUTH_URL: &str = "https://www.dropbox.com/oauth2/authorize";
/// OAuth2 token endpoint.
const DROPBOX_TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

type DropboxOAuthClient =
    BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Build an OAuth2 client for the application.
///
/// No redirect URI is registered: Dropbox then shows the code to the
/// operator, who pastes it back.
fn oauth_client(app: &AppCredentials) -> Result<DropboxOAuthClient> {
    if app.key.is_empty() {
        return Err(Error::InvalidInput(
            "Dropbox app key is not configured".to_string(),
        ));
    }

    Ok(BasicClient::new(ClientId::new(app.key.clone()))
        .set_client_secret(ClientSecret::new(app.secret.clone()))
        .set_auth_uri(
            AuthUrl::new(DROPBOX_AUTH_URL.to_string())
                .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
        )
        .set_token_uri(
            TokenUrl::new(DROPBOX_TOKEN_URL.to_string())
                .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
        ))
}

/// Generate the authorization URL for the operator to visit.
pub fn authorization_url(app: &AppCredentials) -> Result<String> {
    let (auth_url, _csrf_token) = oauth_client(app)?
        .authorize_url(CsrfToken::new_random)
        .url();

    Ok(auth_url.to_string())
}

/// Exchange an authorization code for an access token.
///
/// # Errors
/// - Invalid or already used authorization code
/// - Network errors
pub async fn exchange_code(app: &AppCredentials, code: &str) -> Result<AccessToken> {
    let client = oauth_client(app)?;

    let http = oauth2::reqwest::ClientBuilder::new()
        // Following redirects opens the client to SSRF.
        .redirect(oauth2::reqwest::redirect::Policy::none())
        .build()
        .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

    let token_result = client
        .exchange_code(AuthorizationCode::new(code.to_string()))
        .request_async(&http)
        .await
        .map_err(|e| Error::TokenExchange(e.to_string()))?;

    AccessToken::new(token_result.access_token().secret().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_authorization_url_generation() {
        let app = AppCredentials::new("test_key", "test_secret");
        let url = authorization_url(&app).unwrap();

        assert!(url.starts_with(DROPBOX_AUTH_URL));
        assert!(url.contains("client_id=test_key"));
        assert!(url.contains("response_type=code"));
        assert!(!url.contains("test_secret"));
    }

    #[test]
    fn test_missing_app_key_is_rejected() {
        let result = authorization_url(&AppCredentials::default());
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}
