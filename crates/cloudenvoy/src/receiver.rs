//! HTTP endpoint receiving push deliveries from Pub/Sub.
//!
//! Pub/Sub POSTs every message to the webhook URL registered on the
//! subscription. The endpoint:
//!
//! 1. authenticates the request with the verification token from the `token`
//!    query parameter (or an `Authorization: Bearer` header),
//! 2. decodes the push envelope into a [`ReceivedMessage`],
//! 3. hands the message to the application's [`MessageHandler`].
//!
//! | Outcome                | Status |
//! |------------------------|--------|
//! | Message handled        | 204    |
//! | Unreadable query       | 400    |
//! | Missing or bad token   | 401    |
//! | Malformed envelope     | 422    |
//! | Handler failure        | 500    |
//!
//! Any non-2xx answer makes Pub/Sub redeliver the message later.

use crate::authenticator::{Authenticator, VerificationTokens};
use crate::config::Config;
use crate::error::{AuthenticationError, SerializationError};
use crate::message::{MessageId, Metadata, ReceivedMessage};
use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, Query, State},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::post,
    Router,
};
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
#[path = "receiver_tests.rs"]
mod tests;

// ============================================================================
// Handler Interface
// ============================================================================

/// Failure reported by a [`MessageHandler`]
#[derive(Debug, Clone, thiserror::Error)]
#[error("Message handler failed: {message}")]
pub struct HandlerError {
    pub message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Application code processing delivered messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one delivery. Returning an error makes Pub/Sub redeliver it.
    async fn handle(&self, message: ReceivedMessage) -> Result<(), HandlerError>;
}

// ============================================================================
// Errors
// ============================================================================

/// Receiver errors with HTTP status code mapping
#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    /// Maps to `400 Bad Request`
    #[error("Invalid query string: {message}")]
    InvalidQuery { message: String },

    /// Maps to `401 Unauthorized`
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthenticationError),

    /// Maps to `422 Unprocessable Entity`
    #[error("Malformed push envelope: {message}")]
    MalformedEnvelope { message: String },

    /// Maps to `422 Unprocessable Entity`
    #[error("Invalid message data: {0}")]
    InvalidData(#[from] SerializationError),

    /// Maps to `500 Internal Server Error`
    #[error(transparent)]
    HandlerFailed(#[from] HandlerError),
}

impl ReceiverError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidQuery { .. } => StatusCode::BAD_REQUEST,
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::MalformedEnvelope { .. } | Self::InvalidData(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::HandlerFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<QueryRejection> for ReceiverError {
    fn from(rejection: QueryRejection) -> Self {
        Self::InvalidQuery {
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let message = match &self {
            Self::Authentication(e) => {
                warn!(error = %e, "Rejected push delivery");
                self.to_string()
            }
            Self::InvalidQuery { .. } | Self::MalformedEnvelope { .. } | Self::InvalidData(_) => {
                warn!(error = %self, "Malformed push delivery");
                self.to_string()
            }
            Self::HandlerFailed(e) => {
                error!(error = %e, "Message handler failed");
                "Message processing failed".to_string()
            }
        };

        let body = serde_json::json!({
            "error": message,
            "status": status.as_u16(),
            "timestamp": Utc::now().to_rfc3339(),
        });

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Push Envelope
// ============================================================================

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
    #[serde(default)]
    subscription: Option<String>,
}

/// Pub/Sub sends both camelCase and snake_case spellings of some fields
#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    attributes: Option<Metadata>,
    #[serde(default, rename = "messageId")]
    message_id: Option<String>,
    #[serde(default, rename = "message_id")]
    message_id_snake: Option<String>,
    #[serde(default, rename = "publishTime")]
    publish_time: Option<DateTime<Utc>>,
    #[serde(default, rename = "publish_time")]
    publish_time_snake: Option<DateTime<Utc>>,
}

/// Decode a push request body into a [`ReceivedMessage`].
///
/// Message data is base64; decoded data that is not JSON is kept as a JSON
/// string and absent data becomes `null`.
pub fn decode_push_envelope(body: &[u8]) -> Result<ReceivedMessage, ReceiverError> {
    let envelope: PushEnvelope =
        serde_json::from_slice(body).map_err(|e| ReceiverError::MalformedEnvelope {
            message: e.to_string(),
        })?;
    let message = envelope.message;

    let id = message
        .message_id
        .or(message.message_id_snake)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ReceiverError::MalformedEnvelope {
            message: "missing message id".to_string(),
        })?;

    let payload = match message.data.filter(|data| !data.is_empty()) {
        Some(data) => decode_data(&data)?,
        None => Value::Null,
    };

    Ok(ReceivedMessage {
        id: MessageId::new(id),
        subscription: envelope.subscription,
        payload,
        metadata: message.attributes.unwrap_or_default(),
        publish_time: message.publish_time.or(message.publish_time_snake),
    })
}

fn decode_data(data: &str) -> Result<Value, SerializationError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(data)
        .map_err(|e| SerializationError::InvalidBase64 {
            message: e.to_string(),
        })?;
    let text = String::from_utf8(bytes).map_err(|_| SerializationError::InvalidUtf8)?;

    Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)))
}

// ============================================================================
// Router
// ============================================================================

/// Shared state of the receiving endpoint
#[derive(Clone)]
pub struct ReceiverState {
    pub tokens: Arc<dyn VerificationTokens>,
    pub handler: Arc<dyn MessageHandler>,
}

impl ReceiverState {
    pub fn new(tokens: Arc<dyn VerificationTokens>, handler: Arc<dyn MessageHandler>) -> Self {
        Self { tokens, handler }
    }
}

impl fmt::Debug for ReceiverState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReceiverState").finish_non_exhaustive()
    }
}

/// Query parameters accepted by the endpoint
#[derive(Debug, Default, Deserialize)]
pub struct TokenQuery {
    #[serde(default)]
    pub token: Option<String>,
}

/// Router serving the endpoint at `path`
pub fn create_router(state: ReceiverState, path: &str) -> Router {
    let path = format!("/{}", path.trim_start_matches('/'));

    Router::new()
        .route(&path, post(receive_message))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router serving the endpoint at the configured processor path, verifying
/// tokens with the configured secret
pub fn router(config: &Config, handler: Arc<dyn MessageHandler>) -> Router {
    let tokens = Arc::new(Authenticator::from_config(config));
    create_router(ReceiverState::new(tokens, handler), config.processor_path())
}

fn request_token(query: TokenQuery, headers: &HeaderMap) -> Option<String> {
    query.token.filter(|token| !token.is_empty()).or_else(|| {
        headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .map(|token| token.trim().to_string())
            .filter(|token| !token.is_empty())
    })
}

/// Handle one push delivery
#[instrument(skip_all)]
pub async fn receive_message(
    State(state): State<ReceiverState>,
    query: Result<Query<TokenQuery>, QueryRejection>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ReceiverError> {
    let Query(query) = query?;
    let token = request_token(query, &headers).ok_or(AuthenticationError::MissingToken)?;
    if !state.tokens.verify(&token) {
        return Err(AuthenticationError::InvalidToken.into());
    }

    let message = decode_push_envelope(&body)?;
    info!(
        message_id = %message.id,
        subscription = message.subscription.as_deref().unwrap_or(""),
        "Received push delivery"
    );

    let message_id = message.id.clone();
    state.handler.handle(message).await?;
    debug!(message_id = %message_id, "Push delivery handled");

    Ok(StatusCode::NO_CONTENT)
}
