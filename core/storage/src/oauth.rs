//! OAuth2 authentication and token management shared by the cloud providers.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, EndpointNotSet, EndpointSet,
    RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use meldanya_common::{Error, Result};

use crate::credentials::{AuthorizationFlow, CredentialStore};

/// Client with authorization and token endpoints configured.
type OAuthClient = BasicClient<EndpointSet, EndpointNotSet, EndpointNotSet, EndpointNotSet, EndpointSet>;

/// Fixed OAuth2 endpoints of a provider.
#[derive(Debug, Clone, Copy)]
pub struct OAuthEndpoints {
    /// Authorization endpoint the operator visits.
    pub auth_url: &'static str,
    /// Token endpoint for code exchange and refresh.
    pub token_url: &'static str,
    /// Scopes to request.
    pub scopes: &'static [&'static str],
    /// Extra query parameters for the authorization URL.
    pub extra_params: &'static [(&'static str, &'static str)],
}

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct Tokens {
    /// Access token for API requests.
    pub access_token: String,
    /// Refresh token for obtaining new access tokens.
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// When the access token expires.
    #[zeroize(skip)]
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Application credentials for an OAuth2 provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Client ID (app key).
    pub client_id: String,
    /// Client secret (app secret).
    pub client_secret: String,
    /// Redirect URL, if the provider needs one.
    pub redirect_url: Option<String>,
}

/// OAuth2 authentication manager.
pub struct AuthManager {
    client: OAuthClient,
    http: oauth2::reqwest::Client,
    endpoints: OAuthEndpoints,
    config: AuthConfig,
}

impl AuthManager {
    /// Create a new authentication manager.
    ///
    /// # Errors
    /// - Malformed endpoint or redirect URL
    pub fn new(endpoints: OAuthEndpoints, config: AuthConfig) -> Result<Self> {
        let mut client = BasicClient::new(ClientId::new(config.client_id.clone()))
            .set_client_secret(ClientSecret::new(config.client_secret.clone()))
            .set_auth_uri(
                AuthUrl::new(endpoints.auth_url.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid auth URL: {}", e)))?,
            )
            .set_token_uri(
                TokenUrl::new(endpoints.token_url.to_string())
                    .map_err(|e| Error::InvalidInput(format!("Invalid token URL: {}", e)))?,
            );

        if let Some(redirect) = &config.redirect_url {
            client = client.set_redirect_uri(
                RedirectUrl::new(redirect.clone())
                    .map_err(|e| Error::InvalidInput(format!("Invalid redirect URL: {}", e)))?,
            );
        }

        // Following redirects during token exchange would open the client up to SSRF.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            http,
            endpoints,
            config,
        })
    }

    /// Generate the authorization URL for the user to visit.
    pub fn authorization_url(&self) -> String {
        let mut request = self.client.authorize_url(CsrfToken::new_random);
        for scope in self.endpoints.scopes {
            request = request.add_scope(Scope::new(scope.to_string()));
        }
        for (key, value) in self.endpoints.extra_params {
            request = request.add_extra_param(*key, *value);
        }

        let (url, _csrf) = request.url();
        url.to_string()
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// - Invalid authorization code
    /// - Network errors
    pub async fn exchange_code(&self, code: &str) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token exchange failed: {}", e)))?;

        let refresh_token = token_result.refresh_token().map(|t| t.secret().clone());
        if refresh_token.is_none() {
            tracing::warn!("No refresh token received; authorization will be needed again once the access token expires");
        }

        Ok(Tokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token,
            expires_at: expiry(token_result.expires_in()),
        })
    }

    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - Invalid or revoked refresh token
    /// - Network errors
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Tokens> {
        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(&self.http)
            .await
            .map_err(|e| Error::Authentication(format!("Token refresh failed: {}", e)))?;

        // Refresh tokens may or may not be returned in refresh response
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(Tokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: Some(new_refresh_token),
            expires_at: expiry(token_result.expires_in()),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

#[async_trait]
impl AuthorizationFlow for AuthManager {
    type Credential = Tokens;

    fn authorization_url(&self) -> String {
        AuthManager::authorization_url(self)
    }

    async fn exchange_code(&self, code: &str) -> Result<Tokens> {
        AuthManager::exchange_code(self, code).await
    }
}

fn expiry(expires_in: Option<std::time::Duration>) -> DateTime<Utc> {
    // Tokens without a lifetime (long-lived Dropbox tokens) are treated as valid for a year.
    let lifetime = expires_in
        .and_then(|d| Duration::from_std(d).ok())
        .unwrap_or_else(|| Duration::days(365));
    Utc::now() + lifetime
}

/// Token manager that automatically refreshes expired tokens.
pub struct TokenManager {
    auth_manager: AuthManager,
    tokens: tokio::sync::RwLock<Tokens>,
    store: Option<CredentialStore>,
}

impl TokenManager {
    /// Create a new token manager with initial tokens.
    ///
    /// Refreshed tokens are written back to `store` when one is given.
    pub fn new(auth_manager: AuthManager, tokens: Tokens, store: Option<CredentialStore>) -> Self {
        Self {
            auth_manager,
            tokens: tokio::sync::RwLock::new(tokens),
            store,
        }
    }

    /// Get a valid access token, refreshing if necessary.
    ///
    /// # Errors
    /// - Token expired and no refresh token is available
    /// - Token refresh failed
    pub async fn get_access_token(&self) -> Result<String> {
        let tokens = self.tokens.read().await;

        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        drop(tokens);

        // Need to refresh
        let mut tokens = self.tokens.write().await;

        // Double-check after acquiring write lock
        if !tokens.is_expired() {
            return Ok(tokens.access_token.clone());
        }

        let refresh_token = tokens.refresh_token.clone().ok_or_else(|| {
            Error::Authentication(
                "Access token expired and no refresh token is available".to_string(),
            )
        })?;

        tracing::info!("Refreshing expired access token");

        let new_tokens = self.auth_manager.refresh_token(&refresh_token).await?;

        if let Some(store) = &self.store {
            if let Err(e) = store.save(&new_tokens).await {
                tracing::warn!("Failed to cache refreshed token: {}", e);
            }
        }

        *tokens = new_tokens;

        Ok(tokens.access_token.clone())
    }

    /// Get the current tokens.
    pub async fn get_tokens(&self) -> Tokens {
        self.tokens.read().await.clone()
    }
}
