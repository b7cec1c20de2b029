//! Error types for configuration, authentication, and pub/sub operations.

use thiserror::Error;

/// Comprehensive error type for all pub/sub operations
///
/// Errors reported by the managed service are passed through to callers
/// without local retry. The one exception, a create call hitting an existing
/// resource, never surfaces here: clients report it as
/// [`CreateOutcome::AlreadyExists`](crate::client::CreateOutcome).
#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    #[error("Permission denied for operation: {operation}")]
    PermissionDenied { operation: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Request timed out: {message}")]
    Timeout { message: String },

    #[error("Provider error ({status}): {code} - {message}")]
    ProviderError {
        status: u16,
        code: String,
        message: String,
    },

    #[error("Batch publish returned {actual} message ids for {expected} messages")]
    BatchMismatch { expected: usize, actual: usize },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),

    #[error("Authentication error: {0}")]
    TokenError(#[from] AuthenticationError),
}

impl PubSubError {
    /// Check if error is transient and might succeed when the caller retries
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NotFound { .. } => false,
            Self::PermissionDenied { .. } => false,
            Self::AuthenticationFailed { .. } => false,
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::ProviderError { status, .. } => *status == 429 || *status >= 500,
            Self::BatchMismatch { .. } => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
            Self::TokenError(_) => false,
        }
    }
}

/// Errors during payload serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message data is not valid base64: {message}")]
    InvalidBase64 { message: String },

    #[error("Message data is not valid UTF-8")]
    InvalidUtf8,
}

/// Configuration errors
///
/// The four `*Missing` variants render the remediation text operators see
/// when a required setting has not been supplied.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(
        "Missing host for processing.\n\
         Please specify a processor hostname in form of `https://some-public-dns.example.com`"
    )]
    ProcessorHostMissing,

    #[error(
        "Missing GCP subscription prefix.\n\
         Please specify a subscription prefix in the form of `my-app`."
    )]
    SubPrefixMissing,

    #[error(
        "Missing GCP project ID.\n\
         Please specify a project ID in the cloudenvoy configurator."
    )]
    ProjectIdMissing,

    #[error(
        "Missing cloudenvoy secret.\n\
         Please specify a secret in the cloudenvoy initializer or add Rails secret_key_base \
         in your credentials"
    )]
    SecretMissing,

    #[error("Invalid processor host '{host}': {message}")]
    InvalidProcessorHost { host: String, message: String },

    #[error("Configuration loading failed: {message}")]
    Load { message: String },
}

impl From<config::ConfigError> for ConfigError {
    fn from(err: config::ConfigError) -> Self {
        Self::Load {
            message: err.to_string(),
        }
    }
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Verification token errors
#[derive(Debug, Error)]
pub enum AuthenticationError {
    #[error("Missing verification token")]
    MissingToken,

    #[error("Invalid verification token")]
    InvalidToken,

    #[error("Failed to sign verification token: {message}")]
    SigningFailed { message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
