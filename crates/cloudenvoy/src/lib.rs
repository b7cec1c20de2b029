//! # Cloudenvoy
//!
//! Publish messages to Google Cloud Pub/Sub and receive them back through an
//! authenticated push webhook.
//!
//! This library provides:
//! - Configuration with fail-fast validation and development/production modes
//! - Idempotent topic and push subscription upserts
//! - Single and batched publishing of JSON payloads with attributes
//! - Signed verification tokens for the webhook URL
//! - An axum endpoint decoding push deliveries for application handlers
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all operations
//! - [`config`] - Settings loading, validation and mode resolution
//! - [`message`] - Resource names, messages, topics and subscriptions
//! - [`authenticator`] - Verification token signing and checking
//! - [`credentials`] - Access tokens for production requests
//! - [`client`] - Pub/Sub client trait
//! - [`providers`] - Google REST and in-memory clients
//! - [`backend`] - Publishing and upsert operations
//! - [`receiver`] - Push delivery endpoint

pub mod authenticator;
pub mod backend;
pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod message;
pub mod providers;
pub mod receiver;

pub use authenticator::{Authenticator, Claims, VerificationTokens};
pub use backend::Backend;
pub use client::{CreateOutcome, PubSubClient};
pub use config::{
    Config, ConfigBuilder, CredentialStore, EnvCredentialStore, HostAllowlist, Mode,
    SecretValue, Settings, SharedHostAllowlist,
};
pub use credentials::{
    AccessToken, CachedTokenSource, MetadataServerTokenSource, StaticTokenSource, TokenSource,
};
pub use error::{
    AuthenticationError, ConfigError, PubSubError, SerializationError, ValidationError,
};
pub use message::{
    Message, MessageId, Metadata, ReceivedMessage, Subscription, SubscriptionName,
    SubscriptionOptions, Topic, TopicName,
};
pub use providers::{GoogleClient, GoogleClientOptions, InMemoryClient};
pub use receiver::{HandlerError, MessageHandler, ReceiverError};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
