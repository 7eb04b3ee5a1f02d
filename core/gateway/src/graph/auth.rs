//! OAuth2 authentication and token management for the Graph provider.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oauth2::{
    basic::BasicClient, AuthUrl, ClientId, ClientSecret, RedirectUrl, Scope, TokenResponse,
    TokenUrl,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use calsync_common::{Error, Result, UserId};

use crate::credentials::CredentialProvider;

/// OAuth2 authorization endpoint.
const MS_AUTH_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/authorize";
/// OAuth2 token endpoint.
const MS_TOKEN_URL: &str = "https://login.microsoftonline.com/common/oauth2/v2.0/token";
/// Redirect URL for the OAuth2 flow (localhost for desktop apps).
const REDIRECT_URL: &str = "http://localhost:8080/callback";

/// Scopes: calendar read/write plus refresh-token issuance.
const CALENDAR_SCOPE: &str = "https://graph.microsoft.com/Calendars.ReadWrite";
const OFFLINE_SCOPE: &str = "offline_access";

/// OAuth2 tokens with expiration tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tokens {
    /// Access token for API requests.
    pub access_token: String,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: String,
    /// When the access token expires.
    pub expires_at: DateTime<Utc>,
}

impl Tokens {
    /// Check if the access token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Configuration for OAuth2 authentication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Application (client) id registered with the identity platform.
    pub client_id: String,
    /// Client secret.
    pub client_secret: String,
    /// Redirect URL for the OAuth2 callback.
    pub redirect_url: String,
}

impl AuthConfig {
    /// Create a configuration for a registered application.
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: redirect_url.into(),
        }
    }

    /// Use the default localhost redirect.
    pub fn with_default_redirect(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        Self::new(client_id, client_secret, REDIRECT_URL)
    }
}

/// OAuth2 authentication manager for the Graph provider.
pub struct AuthManager {
    client: BasicClient,
    config: AuthConfig,
}

impl AuthManager {
    /// Create a new authentication manager.
    pub fn new(config: AuthConfig) -> Result<Self> {
        let client = BasicClient::new(
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
            AuthUrl::new(MS_AUTH_URL.to_string())
                .map_err(|e| Error::Validation(format!("Invalid auth URL: {}", e)))?,
            Some(
                TokenUrl::new(MS_TOKEN_URL.to_string())
                    .map_err(|e| Error::Validation(format!("Invalid token URL: {}", e)))?,
            ),
        )
        .set_redirect_uri(
            RedirectUrl::new(config.redirect_url.clone())
                .map_err(|e| Error::Validation(format!("Invalid redirect URL: {}", e)))?,
        );

        Ok(Self { client, config })
    }

    /// Generate the authorization URL for the user to visit.
    ///
    /// Returns the URL and a CSRF token that should be verified on callback.
    pub fn authorization_url(&self) -> (String, String) {
        let (auth_url, csrf_token) = self
            .client
            .authorize_url(oauth2::CsrfToken::new_random)
            .add_scope(Scope::new(CALENDAR_SCOPE.to_string()))
            .add_scope(Scope::new(OFFLINE_SCOPE.to_string()))
            .url();

        (auth_url.to_string(), csrf_token.secret().clone())
    }

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    /// - Invalid authorization code
    /// - Network errors
    pub async fn exchange_code(&self, code: &str) -> Result<Tokens> {
        use oauth2::reqwest::async_http_client;
        use oauth2::AuthorizationCode;

        let token_result = self
            .client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::NotAuthenticated(format!("Token exchange failed: {}", e)))?;

        let access_token = token_result.access_token().secret().clone();
        let refresh_token = token_result
            .refresh_token()
            .ok_or_else(|| {
                Error::NotAuthenticated(
                    "No refresh token received. Ensure the offline_access scope was requested."
                        .to_string(),
                )
            })?
            .secret()
            .clone();

        Ok(Tokens {
            access_token,
            refresh_token,
            expires_at: expiry_from_now(token_result.expires_in()),
        })
    }

    /// Refresh an access token using the refresh token.
    ///
    /// # Errors
    /// - Invalid or revoked refresh token
    /// - Network errors
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<Tokens> {
        use oauth2::reqwest::async_http_client;
        use oauth2::RefreshToken;

        let token_result = self
            .client
            .exchange_refresh_token(&RefreshToken::new(refresh_token.to_string()))
            .request_async(async_http_client)
            .await
            .map_err(|e| Error::NotAuthenticated(format!("Token refresh failed: {}", e)))?;

        let access_token = token_result.access_token().secret().clone();

        // Refresh tokens may or may not be returned in refresh responses
        let new_refresh_token = token_result
            .refresh_token()
            .map(|t| t.secret().clone())
            .unwrap_or_else(|| refresh_token.to_string());

        Ok(Tokens {
            access_token,
            refresh_token: new_refresh_token,
            expires_at: expiry_from_now(token_result.expires_in()),
        })
    }

    /// Get the current configuration.
    pub fn config(&self) -> &AuthConfig {
        &self.config
    }
}

fn expiry_from_now(expires_in: Option<std::time::Duration>) -> DateTime<Utc> {
    let expires_in = expires_in.unwrap_or_else(|| std::time::Duration::from_secs(3600));
    Utc::now() + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1))
}

/// Per-user token store that refreshes expired access tokens on demand.
pub struct TokenManager {
    auth_manager: AuthManager,
    tokens: tokio::sync::RwLock<HashMap<String, Tokens>>,
}

impl TokenManager {
    /// Create a new token manager.
    pub fn new(auth_manager: AuthManager) -> Self {
        Self {
            auth_manager,
            tokens: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    /// Store tokens for a user (e.g. after completing the code exchange).
    pub async fn store_tokens(&self, user: &UserId, tokens: Tokens) {
        self.tokens
            .write()
            .await
            .insert(user.as_str().to_string(), tokens);
    }

    /// Drop a user's tokens.
    pub async fn forget(&self, user: &UserId) {
        self.tokens.write().await.remove(user.as_str());
    }

    /// Get the current tokens for a user, if any.
    pub async fn tokens(&self, user: &UserId) -> Option<Tokens> {
        self.tokens.read().await.get(user.as_str()).cloned()
    }
}

#[async_trait]
impl CredentialProvider for TokenManager {
    async fn access_credential(&self, user: &UserId) -> Result<String> {
        {
            let tokens = self.tokens.read().await;
            match tokens.get(user.as_str()) {
                Some(current) if !current.is_expired() => {
                    return Ok(current.access_token.clone());
                }
                Some(_) => {}
                None => {
                    return Err(Error::NotAuthenticated(format!("no tokens for {user}")));
                }
            }
        }

        // Need to refresh
        let mut tokens = self.tokens.write().await;
        let current = tokens
            .get(user.as_str())
            .ok_or_else(|| Error::NotAuthenticated(format!("no tokens for {user}")))?;

        // Double-check after acquiring the write lock
        if !current.is_expired() {
            return Ok(current.access_token.clone());
        }

        tracing::info!(user = %user, "Refreshing expired access token");

        let refreshed = self
            .auth_manager
            .refresh_token(&current.refresh_token)
            .await?;
        let access_token = refreshed.access_token.clone();
        tokens.insert(user.as_str().to_string(), refreshed);

        Ok(access_token)
    }

    async fn is_valid(&self, user: &UserId) -> bool {
        // A refreshable token counts as valid even if currently expired.
        self.tokens.read().await.contains_key(user.as_str())
    }
}
