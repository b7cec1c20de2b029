//! OAuth2 access tokens for production Pub/Sub requests.
//!
//! The Google client asks a [`TokenSource`] for a token on every request.
//! Sources:
//!
//! - [`StaticTokenSource`] hands out a configured token that never expires
//!   locally.
//! - [`MetadataServerTokenSource`] fetches the service account token of the
//!   workload from the GCE metadata server (Cloud Run, GKE, Compute Engine).
//! - [`CachedTokenSource`] wraps another source and reuses its token until it
//!   is about to expire.

use crate::config::SecretValue;
use crate::error::PubSubError;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::Client as HttpClient;
use serde::Deserialize;
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "credentials_tests.rs"]
mod tests;

/// Default metadata server address
pub const DEFAULT_METADATA_HOST: &str = "metadata.google.internal";

/// Variable overriding the metadata server address
pub const METADATA_HOST_VARIABLE: &str = "GCE_METADATA_HOST";

const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

/// Tokens are refreshed this long before they expire
pub const DEFAULT_REFRESH_MARGIN_SECONDS: i64 = 300;

// ============================================================================
// Access Token
// ============================================================================

/// OAuth2 bearer token with an optional expiry
#[derive(Clone)]
pub struct AccessToken {
    token: SecretValue,
    expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Token without a known expiry
    pub fn new(token: SecretValue) -> Self {
        Self {
            token,
            expires_at: None,
        }
    }

    /// Token expiring at `expires_at`
    pub fn expiring_at(token: SecretValue, expires_at: DateTime<Utc>) -> Self {
        Self {
            token,
            expires_at: Some(expires_at),
        }
    }

    pub fn secret(&self) -> &SecretValue {
        &self.token
    }

    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.expires_soon(Duration::zero())
    }

    /// Whether the token expires within `margin`
    pub fn expires_soon(&self, margin: Duration) -> bool {
        self.expires_at
            .map(|expires_at| Utc::now() + margin >= expires_at)
            .unwrap_or(false)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<REDACTED>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

// ============================================================================
// Token Source Interface
// ============================================================================

/// Provider of bearer tokens for Pub/Sub requests
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// A token valid for the next request
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::AuthenticationFailed` when no token can be
    /// obtained.
    async fn access_token(&self) -> Result<AccessToken, PubSubError>;

    /// Drop any cached token after the service rejected it
    async fn invalidate(&self) {}
}

// ============================================================================
// Static Token
// ============================================================================

/// Source handing out a fixed token
#[derive(Debug, Clone)]
pub struct StaticTokenSource {
    token: SecretValue,
}

impl StaticTokenSource {
    pub fn new(token: SecretValue) -> Self {
        Self { token }
    }
}

#[async_trait]
impl TokenSource for StaticTokenSource {
    async fn access_token(&self) -> Result<AccessToken, PubSubError> {
        Ok(AccessToken::new(self.token.clone()))
    }
}

// ============================================================================
// Metadata Server
// ============================================================================

#[derive(Debug, Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Source fetching the default service account token from the metadata
/// server
#[derive(Debug, Clone)]
pub struct MetadataServerTokenSource {
    http_client: HttpClient,
    base_url: String,
}

impl MetadataServerTokenSource {
    /// Use `GCE_METADATA_HOST` when set, else the default metadata host
    pub fn new(http_client: HttpClient) -> Self {
        let host = std::env::var(METADATA_HOST_VARIABLE)
            .ok()
            .filter(|host| !host.is_empty())
            .unwrap_or_else(|| DEFAULT_METADATA_HOST.to_string());

        Self::with_base_url(http_client, format!("http://{}", host))
    }

    pub fn with_base_url(http_client: HttpClient, base_url: impl Into<String>) -> Self {
        Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn token_url(&self) -> String {
        format!("{}{}", self.base_url, TOKEN_PATH)
    }
}

#[async_trait]
impl TokenSource for MetadataServerTokenSource {
    async fn access_token(&self) -> Result<AccessToken, PubSubError> {
        let response = self
            .http_client
            .get(self.token_url())
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| PubSubError::AuthenticationFailed {
                message: format!("Metadata server unreachable: {}", e),
            })?;

        let status = response.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "Metadata server refused token request");
            return Err(PubSubError::AuthenticationFailed {
                message: format!("Metadata server returned {}", status),
            });
        }

        let body: MetadataTokenResponse =
            response
                .json()
                .await
                .map_err(|e| PubSubError::AuthenticationFailed {
                    message: format!("Invalid metadata token response: {}", e),
                })?;

        let token = SecretValue::from_string(body.access_token);
        Ok(match body.expires_in {
            Some(seconds) => {
                debug!(expires_in = seconds, "Fetched access token from metadata server");
                AccessToken::expiring_at(token, Utc::now() + Duration::seconds(seconds))
            }
            None => AccessToken::new(token),
        })
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Source reusing another source's token until it is about to expire
pub struct CachedTokenSource {
    inner: Arc<dyn TokenSource>,
    cached: Mutex<Option<AccessToken>>,
    refresh_margin: Duration,
}

impl CachedTokenSource {
    pub fn new(inner: Arc<dyn TokenSource>) -> Self {
        Self {
            inner,
            cached: Mutex::new(None),
            refresh_margin: Duration::seconds(DEFAULT_REFRESH_MARGIN_SECONDS),
        }
    }

    pub fn with_refresh_margin(mut self, margin: Duration) -> Self {
        self.refresh_margin = margin;
        self
    }
}

impl fmt::Debug for CachedTokenSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CachedTokenSource")
            .field("refresh_margin", &self.refresh_margin)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TokenSource for CachedTokenSource {
    async fn access_token(&self) -> Result<AccessToken, PubSubError> {
        // Held across the fetch so concurrent callers share one refresh.
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if !token.expires_soon(self.refresh_margin) {
                return Ok(token.clone());
            }
            debug!("Cached access token expiring, refreshing");
        }

        let token = self.inner.access_token().await?;
        *cached = Some(token.clone());
        Ok(token)
    }

    async fn invalidate(&self) {
        *self.cached.lock().await = None;
        self.inner.invalidate().await;
    }
}
