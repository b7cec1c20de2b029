//! Google Cloud Pub/Sub client over the v1 REST API.
//!
//! In production requests go to `https://pubsub.googleapis.com/v1` and carry
//! an OAuth2 bearer token from a [`TokenSource`]. A configured access token is
//! used as is; otherwise the workload's service account token is fetched from
//! the metadata server and refreshed before it expires. When an emulator host
//! is configured, requests are sent to `http://<emulator_host>/v1` without
//! authentication, which is how the Pub/Sub emulator expects to be addressed.
//!
//! Publishing splits large batches into requests of at most
//! [`MAX_BATCH_MESSAGES`] messages and [`MAX_BATCH_BYTES`] bytes.
//!
//! ## Example
//!
//! ```no_run
//! use cloudenvoy::providers::{GoogleClient, GoogleClientOptions};
//!
//! # fn example() -> Result<(), cloudenvoy::PubSubError> {
//! let options = GoogleClientOptions::new("my-project").with_emulator_host("localhost:8085");
//! let client = GoogleClient::new(options)?;
//! # Ok(())
//! # }
//! ```

use crate::client::{CreateOutcome, PubSubClient};
use crate::config::{SecretValue, DEFAULT_REQUEST_TIMEOUT};
use crate::credentials::{
    CachedTokenSource, MetadataServerTokenSource, StaticTokenSource, TokenSource,
};
use crate::error::{PubSubError, SerializationError};
use crate::message::{
    Metadata, MessageId, OutboundMessage, SubscriptionHandle, SubscriptionName,
    SubscriptionOptions, TopicHandle, TopicName,
};
use async_trait::async_trait;
use base64::Engine;
use reqwest::{Client as HttpClient, Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[cfg(test)]
#[path = "google_tests.rs"]
mod tests;

/// Base URL of the production Pub/Sub REST API
pub const PRODUCTION_BASE_URL: &str = "https://pubsub.googleapis.com/v1";

/// Most messages the service accepts in one publish request
pub const MAX_BATCH_MESSAGES: usize = 1000;

/// Largest publish request the service accepts
pub const MAX_BATCH_BYTES: usize = 10_000_000;

/// Allowance for the JSON framing of one message in a publish request
const MESSAGE_OVERHEAD_BYTES: usize = 64;

// ============================================================================
// Error Types
// ============================================================================

/// Google Pub/Sub specific errors
#[derive(Debug, thiserror::Error)]
pub enum GoogleError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication failed: {0}")]
    Unauthenticated(String),

    #[error("Permission denied for {operation}: {message}")]
    PermissionDenied { operation: String, message: String },

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Pub/Sub API error {status} ({code}): {message}")]
    Api {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Invalid response body: {0}")]
    InvalidResponse(#[from] serde_json::Error),
}

impl GoogleError {
    /// Map Google error to PubSubError
    pub fn to_pubsub_error(self) -> PubSubError {
        match self {
            Self::Timeout(message) => PubSubError::Timeout { message },
            Self::NetworkError(message) => PubSubError::ConnectionFailed { message },
            Self::Unauthenticated(message) => PubSubError::AuthenticationFailed { message },
            Self::PermissionDenied { operation, .. } => PubSubError::PermissionDenied { operation },
            Self::NotFound(resource) => PubSubError::NotFound { resource },
            Self::AlreadyExists(message) => PubSubError::ProviderError {
                status: StatusCode::CONFLICT.as_u16(),
                code: "ALREADY_EXISTS".to_string(),
                message,
            },
            Self::Api {
                status,
                code,
                message,
            } => PubSubError::ProviderError {
                status,
                code,
                message,
            },
            Self::InvalidResponse(e) => {
                PubSubError::SerializationError(SerializationError::JsonError(e))
            }
        }
    }
}

/// Error payload returned by Google APIs
#[derive(Debug, Default, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    error: ErrorStatus,
}

#[derive(Debug, Default, Deserialize)]
struct ErrorStatus {
    #[serde(default)]
    message: String,
    #[serde(default)]
    status: String,
}

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Serialize)]
struct PublishRequest<'a> {
    messages: Vec<WireMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct WireMessage<'a> {
    data: String,
    attributes: &'a Metadata,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateSubscriptionRequest<'a> {
    subscription: &'a SubscriptionHandle,
    update_mask: String,
}

// ============================================================================
// Client Options
// ============================================================================

/// Construction parameters for [`GoogleClient`]
#[derive(Clone, PartialEq)]
pub struct GoogleClientOptions {
    pub project_id: String,
    /// Emulator address (`host:port`); set only in development mode
    pub emulator_host: Option<String>,
    /// OAuth2 bearer token for production requests
    pub access_token: Option<SecretValue>,
    pub timeout: Duration,
    /// Override of the API base URL
    pub base_url: Option<String>,
}

impl GoogleClientOptions {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            emulator_host: None,
            access_token: None,
            timeout: DEFAULT_REQUEST_TIMEOUT,
            base_url: None,
        }
    }

    pub fn with_emulator_host(mut self, host: impl Into<String>) -> Self {
        self.emulator_host = Some(host.into());
        self
    }

    pub fn with_access_token(mut self, token: SecretValue) -> Self {
        self.access_token = Some(token);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Whether requests are redirected to the emulator
    pub fn uses_emulator(&self) -> bool {
        self.emulator_host.is_some()
    }

    /// API base URL requests are resolved against
    pub fn base_url(&self) -> String {
        if let Some(base_url) = &self.base_url {
            return base_url.trim_end_matches('/').to_string();
        }

        match &self.emulator_host {
            Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
                format!("{}/v1", host.trim_end_matches('/'))
            }
            Some(host) => format!("http://{}/v1", host.trim_end_matches('/')),
            None => PRODUCTION_BASE_URL.to_string(),
        }
    }
}

impl fmt::Debug for GoogleClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleClientOptions")
            .field("project_id", &self.project_id)
            .field("emulator_host", &self.emulator_host)
            .field(
                "access_token",
                &self.access_token.as_ref().map(|_| "<REDACTED>"),
            )
            .field("timeout", &self.timeout)
            .field("base_url", &self.base_url)
            .finish()
    }
}

// ============================================================================
// Google Client
// ============================================================================

/// Pub/Sub client for Google Cloud or the local emulator
#[derive(Clone)]
pub struct GoogleClient {
    options: GoogleClientOptions,
    base_url: String,
    http_client: HttpClient,
    token_source: Option<Arc<dyn TokenSource>>,
}

impl GoogleClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns `PubSubError::ConnectionFailed` if the HTTP client cannot be
    /// constructed.
    pub fn new(options: GoogleClientOptions) -> Result<Self, PubSubError> {
        let http_client = HttpClient::builder()
            .timeout(options.timeout)
            .user_agent(concat!("cloudenvoy/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| PubSubError::ConnectionFailed {
                message: format!("Failed to build HTTP client: {}", e),
            })?;

        let base_url = options.base_url();
        debug!(
            base_url = %base_url,
            project_id = %options.project_id,
            emulator = options.uses_emulator(),
            "Created Pub/Sub client"
        );

        let token_source = Self::default_token_source(&options, &http_client);

        Ok(Self {
            options,
            base_url,
            http_client,
            token_source,
        })
    }

    /// Authenticate requests with the given source instead of the default one.
    ///
    /// Ignored when talking to the emulator.
    pub fn with_token_source(mut self, source: Arc<dyn TokenSource>) -> Self {
        if !self.options.uses_emulator() {
            self.token_source = Some(source);
        }
        self
    }

    fn default_token_source(
        options: &GoogleClientOptions,
        http_client: &HttpClient,
    ) -> Option<Arc<dyn TokenSource>> {
        if options.uses_emulator() {
            return None;
        }

        let source: Arc<dyn TokenSource> = match &options.access_token {
            Some(token) => Arc::new(StaticTokenSource::new(token.clone())),
            None => Arc::new(CachedTokenSource::new(Arc::new(
                MetadataServerTokenSource::new(http_client.clone()),
            ))),
        };
        Some(source)
    }

    pub fn options(&self) -> &GoogleClientOptions {
        &self.options
    }

    fn topic_url(&self, topic: &TopicName) -> String {
        format!(
            "{}/{}",
            self.base_url,
            topic.resource_path(&self.options.project_id)
        )
    }

    fn subscription_url(&self, name: &SubscriptionName) -> String {
        format!(
            "{}/{}",
            self.base_url,
            name.resource_path(&self.options.project_id)
        )
    }

    async fn request(&self, method: Method, url: &str) -> Result<RequestBuilder, PubSubError> {
        let request = self.http_client.request(method, url);
        match &self.token_source {
            Some(source) => {
                let token = source.access_token().await?;
                Ok(request.bearer_auth(token.secret().expose_secret()))
            }
            None => Ok(request),
        }
    }

    /// Send a request and decode the JSON response
    async fn execute<T: DeserializeOwned>(
        &self,
        request: RequestBuilder,
        operation: &str,
        resource: &str,
    ) -> Result<T, GoogleError> {
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                GoogleError::Timeout(format!("{} timed out: {}", operation, e))
            } else if e.is_connect() {
                GoogleError::NetworkError(format!("Connection failed: {}", e))
            } else {
                GoogleError::NetworkError(format!("HTTP request failed: {}", e))
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| GoogleError::NetworkError(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            let error = Self::parse_error_response(&body, status, operation, resource);
            if let (GoogleError::Unauthenticated(_), Some(source)) = (&error, &self.token_source) {
                source.invalidate().await;
            }
            return Err(error);
        }

        let body = if body.trim().is_empty() { "{}" } else { body.as_str() };
        Ok(serde_json::from_str(body)?)
    }

    fn parse_error_response(
        body: &str,
        status: StatusCode,
        operation: &str,
        resource: &str,
    ) -> GoogleError {
        let error = serde_json::from_str::<ErrorResponse>(body)
            .map(|response| response.error)
            .unwrap_or_default();

        let message = if error.message.is_empty() {
            body.to_string()
        } else {
            error.message
        };

        warn!(
            status = status.as_u16(),
            code = %error.status,
            operation = %operation,
            resource = %resource,
            "Pub/Sub request failed"
        );

        match status {
            StatusCode::CONFLICT => GoogleError::AlreadyExists(resource.to_string()),
            _ if error.status == "ALREADY_EXISTS" => {
                GoogleError::AlreadyExists(resource.to_string())
            }
            StatusCode::UNAUTHORIZED => GoogleError::Unauthenticated(message),
            StatusCode::FORBIDDEN => GoogleError::PermissionDenied {
                operation: operation.to_string(),
                message,
            },
            StatusCode::NOT_FOUND => GoogleError::NotFound(resource.to_string()),
            _ => GoogleError::Api {
                status: status.as_u16(),
                code: if error.status.is_empty() {
                    status.canonical_reason().unwrap_or("UNKNOWN").to_string()
                } else {
                    error.status
                },
                message,
            },
        }
    }

    /// Treat a conflict as [`CreateOutcome::AlreadyExists`], everything else
    /// as a failure
    fn create_outcome<T>(result: Result<T, GoogleError>) -> Result<CreateOutcome<T>, PubSubError> {
        match result {
            Ok(resource) => Ok(CreateOutcome::Created(resource)),
            Err(GoogleError::AlreadyExists(resource)) => {
                debug!(resource = %resource, "Resource already exists");
                Ok(CreateOutcome::AlreadyExists)
            }
            Err(e) => Err(e.to_pubsub_error()),
        }
    }
}

impl fmt::Debug for GoogleClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GoogleClient")
            .field("options", &self.options)
            .field("base_url", &self.base_url)
            .field("authenticated", &self.token_source.is_some())
            .finish()
    }
}

/// Size a message adds to a publish request body
fn encoded_size(message: &OutboundMessage) -> usize {
    let data = message.data.len().div_ceil(3) * 4;
    let attributes: usize = message
        .attributes
        .iter()
        .map(|(key, value)| key.len() + value.len() + 6)
        .sum();
    data + attributes + MESSAGE_OVERHEAD_BYTES
}

/// Split messages into consecutive batches within the request limits.
///
/// A single message larger than the byte limit still forms its own batch;
/// the service decides whether to accept it.
fn publish_batches(messages: &[OutboundMessage]) -> Vec<&[OutboundMessage]> {
    let mut batches = Vec::new();
    let mut start = 0;
    let mut bytes = 0;

    for (index, message) in messages.iter().enumerate() {
        let size = encoded_size(message);
        let count = index - start;
        if count > 0 && (count == MAX_BATCH_MESSAGES || bytes + size > MAX_BATCH_BYTES) {
            batches.push(&messages[start..index]);
            start = index;
            bytes = 0;
        }
        bytes += size;
    }

    if start < messages.len() {
        batches.push(&messages[start..]);
    }
    batches
}

#[async_trait]
impl PubSubClient for GoogleClient {
    #[instrument(skip_all, fields(topic = %topic))]
    async fn create_topic(
        &self,
        topic: &TopicName,
    ) -> Result<CreateOutcome<TopicHandle>, PubSubError> {
        let url = self.topic_url(topic);
        let request = self
            .request(Method::PUT, &url)
            .await?
            .json(&serde_json::json!({}));

        Self::create_outcome(self.execute(request, "create_topic", topic.as_str()).await)
    }

    #[instrument(skip_all, fields(topic = %topic))]
    async fn get_topic(&self, topic: &TopicName) -> Result<TopicHandle, PubSubError> {
        let url = self.topic_url(topic);
        let request = self.request(Method::GET, &url).await?;
        self.execute(request, "get_topic", topic.as_str())
            .await
            .map_err(GoogleError::to_pubsub_error)
    }

    #[instrument(skip_all, fields(topic = %topic, count = messages.len()))]
    async fn publish(
        &self,
        topic: &TopicName,
        messages: &[OutboundMessage],
    ) -> Result<Vec<MessageId>, PubSubError> {
        let url = format!("{}:publish", self.topic_url(topic));
        let mut ids = Vec::with_capacity(messages.len());

        for batch in publish_batches(messages) {
            let body = PublishRequest {
                messages: batch
                    .iter()
                    .map(|message| WireMessage {
                        data: base64::engine::general_purpose::STANDARD.encode(&message.data),
                        attributes: &message.attributes,
                    })
                    .collect(),
            };

            let request = self.request(Method::POST, &url).await?.json(&body);
            let response: PublishResponse = self
                .execute(request, "publish", topic.as_str())
                .await
                .map_err(GoogleError::to_pubsub_error)?;

            debug!(
                batch = batch.len(),
                published = response.message_ids.len(),
                "Published batch"
            );
            ids.extend(response.message_ids.into_iter().map(MessageId::new));
        }

        Ok(ids)
    }

    #[instrument(skip_all, fields(topic = %topic, subscription = %name))]
    async fn create_subscription(
        &self,
        topic: &TopicName,
        name: &SubscriptionName,
        options: &SubscriptionOptions,
    ) -> Result<CreateOutcome<SubscriptionHandle>, PubSubError> {
        let mut body = SubscriptionHandle {
            name: name.resource_path(&self.options.project_id),
            topic: topic.resource_path(&self.options.project_id),
            ..Default::default()
        };
        options.apply_to(&mut body);

        let url = self.subscription_url(name);
        let request = self.request(Method::PUT, &url).await?.json(&body);

        Self::create_outcome(
            self.execute(request, "create_subscription", name.as_str())
                .await,
        )
    }

    #[instrument(skip_all, fields(subscription = %name))]
    async fn get_subscription(
        &self,
        name: &SubscriptionName,
    ) -> Result<SubscriptionHandle, PubSubError> {
        let url = self.subscription_url(name);
        let request = self.request(Method::GET, &url).await?;
        self.execute(request, "get_subscription", name.as_str())
            .await
            .map_err(GoogleError::to_pubsub_error)
    }

    #[instrument(skip_all, fields(subscription = %subscription.name))]
    async fn update_subscription(
        &self,
        subscription: &SubscriptionHandle,
        update_mask: &[&'static str],
    ) -> Result<SubscriptionHandle, PubSubError> {
        let name = SubscriptionName::from_resource(&subscription.name)?;

        let mut subscription = subscription.clone();
        subscription.name = name.resource_path(&self.options.project_id);

        let body = UpdateSubscriptionRequest {
            subscription: &subscription,
            update_mask: update_mask.join(","),
        };

        let url = self.subscription_url(&name);
        let request = self.request(Method::PATCH, &url).await?.json(&body);
        self.execute(request, "update_subscription", name.as_str())
            .await
            .map_err(GoogleError::to_pubsub_error)
    }
}
