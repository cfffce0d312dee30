//! Access tokens for Microsoft Graph.

use chrono::{DateTime, Duration, Utc};
use oauth2::basic::BasicClient;
use oauth2::{AuthType, ClientId, ClientSecret, Scope, TokenResponse, TokenUrl};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use eqms_common::{Error, Result, SecretString};

/// Scope requesting the application permissions granted to the app registration.
const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";

fn token_url(tenant_id: &str) -> String {
    format!(
        "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
        tenant_id
    )
}

/// Bearer token with expiration tracking.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: SecretString,
    pub expires_at: DateTime<Utc>,
}

impl AccessToken {
    /// Check if the token is expired or about to expire.
    pub fn is_expired(&self) -> bool {
        // Consider expired if less than 5 minutes remaining
        self.expires_at < Utc::now() + Duration::minutes(5)
    }
}

/// Azure AD app registration used for the client-credentials grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientCredentials {
    pub tenant_id: String,
    pub client_id: String,
    pub client_secret: SecretString,
}

impl ClientCredentials {
    /// Request a fresh token from Azure AD.
    ///
    /// # Errors
    /// - `Configuration` for a malformed tenant
    /// - `Authentication` when the token endpoint rejects the request
    pub async fn request_token(&self, http: &oauth2::reqwest::Client) -> Result<AccessToken> {
        let token_url = TokenUrl::new(token_url(&self.tenant_id))
            .map_err(|e| Error::Configuration(format!("Invalid token URL: {}", e)))?;

        let client = BasicClient::new(ClientId::new(self.client_id.clone()))
            .set_client_secret(ClientSecret::new(self.client_secret.expose().to_string()))
            .set_auth_type(AuthType::RequestBody)
            .set_token_uri(token_url);

        let response = client
            .exchange_client_credentials()
            .add_scope(Scope::new(GRAPH_SCOPE.to_string()))
            .request_async(http)
            .await
            .map_err(|e| Error::Authentication(format!("Token request failed: {}", e)))?;

        let expires_in = response
            .expires_in()
            .unwrap_or_else(|| std::time::Duration::from_secs(3600));

        Ok(AccessToken {
            token: SecretString::new(response.access_token().secret().clone()),
            expires_at: Utc::now()
                + Duration::from_std(expires_in).unwrap_or_else(|_| Duration::hours(1)),
        })
    }
}

/// Where bearer tokens come from.
#[derive(Debug, Clone)]
pub enum TokenSource {
    /// Token provisioned out of band. Never refreshed.
    Static(SecretString),
    ClientCredentials(ClientCredentials),
}

/// Hands out valid access tokens, requesting new ones when the cached one expires.
pub struct TokenManager {
    source: TokenSource,
    http: oauth2::reqwest::Client,
    cached: RwLock<Option<AccessToken>>,
}

impl TokenManager {
    /// # Errors
    /// - HTTP client for the token endpoint cannot be built
    pub fn new(source: TokenSource) -> Result<Self> {
        // Token endpoints must not redirect.
        let http = oauth2::reqwest::ClientBuilder::new()
            .redirect(oauth2::reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| Error::Configuration(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            source,
            http,
            cached: RwLock::new(None),
        })
    }

    /// Get a valid access token, requesting one if necessary.
    ///
    /// # Errors
    /// - Token request failed
    pub async fn get_access_token(&self) -> Result<SecretString> {
        let credentials = match &self.source {
            TokenSource::Static(token) => return Ok(token.clone()),
            TokenSource::ClientCredentials(credentials) => credentials,
        };

        {
            let cached = self.cached.read().await;
            if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
                return Ok(token.token.clone());
            }
        }

        let mut cached = self.cached.write().await;

        // Double-check after acquiring write lock
        if let Some(token) = cached.as_ref().filter(|t| !t.is_expired()) {
            return Ok(token.token.clone());
        }

        tracing::info!(tenant = %credentials.tenant_id, "Requesting Graph access token");

        let token = credentials.request_token(&self.http).await?;
        let secret = token.token.clone();
        *cached = Some(token);
        Ok(secret)
    }

    /// Drop the cached token so the next call requests a new one.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    #[cfg(test)]
    pub(crate) async fn cache(&self, token: AccessToken) {
        *self.cached.write().await = Some(token);
    }

    #[cfg(test)]
    pub(crate) async fn has_cached_token(&self) -> bool {
        self.cached.read().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_expiration() {
        let expired = AccessToken {
            token: SecretString::new("t"),
            expires_at: Utc::now() - Duration::hours(1),
        };
        assert!(expired.is_expired());

        let valid = AccessToken {
            token: SecretString::new("t"),
            expires_at: Utc::now() + Duration::hours(1),
        };
        assert!(!valid.is_expired());
    }

    #[test]
    fn test_token_near_expiration() {
        // Token expiring in 4 minutes should be considered expired (5 min buffer)
        let token = AccessToken {
            token: SecretString::new("t"),
            expires_at: Utc::now() + Duration::minutes(4),
        };
        assert!(token.is_expired());
    }

    #[test]
    fn test_token_url() {
        assert_eq!(
            token_url("contoso.onmicrosoft.com"),
            "https://login.microsoftonline.com/contoso.onmicrosoft.com/oauth2/v2.0/token"
        );
    }

    #[tokio::test]
    async fn test_static_token() {
        let manager = TokenManager::new(TokenSource::Static(SecretString::new("abc"))).unwrap();
        assert_eq!(manager.get_access_token().await.unwrap().expose(), "abc");
    }

    #[tokio::test]
    async fn test_cached_token_is_reused() {
        let credentials = ClientCredentials {
            tenant_id: "tenant".to_string(),
            client_id: "client".to_string(),
            client_secret: SecretString::new("secret"),
        };
        let manager = TokenManager::new(TokenSource::ClientCredentials(credentials)).unwrap();
        *manager.cached.write().await = Some(AccessToken {
            token: SecretString::new("cached"),
            expires_at: Utc::now() + Duration::hours(1),
        });

        assert_eq!(manager.get_access_token().await.unwrap().expose(), "cached");
        manager.invalidate().await;
        assert!(manager.cached.read().await.is_none());
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let credentials: ClientCredentials = serde_json::from_value(serde_json::json!({
            "tenant_id": "tenant",
            "client_id": "client",
            "client_secret": "hunter2"
        }))
        .unwrap();
        assert!(!format!("{:?}", credentials).contains("hunter2"));
    }
}
