//! Backend adapter over Google Cloud Pub/Sub.
//!
//! [`Backend`] publishes messages and keeps topics and push subscriptions in
//! place. Creating a topic or subscription is idempotent: when the resource
//! exists already the existing topic is adopted, and an existing
//! subscription has its delivery configuration updated.
//!
//! In development mode the client targets the local emulator and topics are
//! created automatically before subscribing.
//!
//! ## Example
//!
//! ```no_run
//! use cloudenvoy::{Backend, Config, Metadata};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(Config::load(None)?);
//! let backend = Backend::new(config);
//!
//! backend.upsert_subscription("user-events", "users", Default::default()).await?;
//! let message = backend
//!     .publish("user-events", &json!({ "id": 42 }), Metadata::new())
//!     .await?;
//! println!("published {}", message.id);
//! # Ok(())
//! # }
//! ```

use crate::authenticator::{Authenticator, Claims, VerificationTokens};
use crate::client::{CreateOutcome, PubSubClient};
use crate::config::Config;
use crate::error::{AuthenticationError, PubSubError, SerializationError};
use crate::message::{
    Message, Metadata, OutboundMessage, Subscription, SubscriptionName, SubscriptionOptions,
    Topic, TopicName,
};
use crate::providers::{GoogleClient, GoogleClientOptions};
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};

#[cfg(test)]
#[path = "backend_tests.rs"]
mod tests;

/// Publishing and subscription management against Pub/Sub
pub struct Backend {
    config: Arc<Config>,
    tokens: Arc<dyn VerificationTokens>,
    client: OnceCell<Arc<dyn PubSubClient>>,
}

impl Backend {
    /// Create a backend signing webhook tokens with the configured secret
    pub fn new(config: Arc<Config>) -> Self {
        let tokens = Arc::new(Authenticator::from_config(&config));
        Self::with_verification_tokens(config, tokens)
    }

    /// Create a backend using a custom token signer
    pub fn with_verification_tokens(
        config: Arc<Config>,
        tokens: Arc<dyn VerificationTokens>,
    ) -> Self {
        Self {
            config,
            tokens,
            client: OnceCell::new(),
        }
    }

    /// Use the given client instead of building one from the configuration
    pub fn with_client(mut self, client: Arc<dyn PubSubClient>) -> Self {
        self.client = OnceCell::new_with(Some(client));
        self
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn is_development(&self) -> bool {
        self.config.is_development()
    }

    /// Options the Pub/Sub client is built with.
    ///
    /// The emulator host is set only in development mode; the access token
    /// only outside of it.
    pub fn client_options(&self) -> GoogleClientOptions {
        let options = GoogleClientOptions::new(self.config.gcp_project_id())
            .with_timeout(self.config.request_timeout());

        if self.is_development() {
            return options.with_emulator_host(self.config.emulator_host());
        }

        match self.config.access_token() {
            Some(token) => options.with_access_token(token.clone()),
            None => options,
        }
    }

    /// The Pub/Sub client, built on first use and reused afterwards.
    ///
    /// Concurrent first calls build the client once.
    pub async fn client(&self) -> Result<Arc<dyn PubSubClient>, PubSubError> {
        let client = self
            .client
            .get_or_try_init(|| async {
                let client: Arc<dyn PubSubClient> =
                    Arc::new(GoogleClient::new(self.client_options())?);
                Ok::<_, PubSubError>(client)
            })
            .await?;

        Ok(Arc::clone(client))
    }

    /// Processor URL with a signed verification token as `token` parameter
    pub fn webhook_url(&self) -> Result<String, AuthenticationError> {
        let token = self.tokens.verification_token(&Claims::new())?;
        Ok(format!("{}?token={}", self.config.processor_url(), token))
    }

    /// Publish one message.
    ///
    /// The payload is serialized to JSON; the topic is not looked up first.
    /// Failures are returned as-is without retrying.
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn publish<T>(
        &self,
        topic: &str,
        payload: &T,
        metadata: Metadata,
    ) -> Result<Message, PubSubError>
    where
        T: Serialize + ?Sized,
    {
        let mut messages = self.publish_all(topic, vec![(payload, metadata)]).await?;
        messages.pop().ok_or(PubSubError::BatchMismatch {
            expected: 1,
            actual: 0,
        })
    }

    /// Publish several messages in one batch.
    ///
    /// Returns one [`Message`] per input pair, in input order.
    #[instrument(skip_all, fields(topic = %topic, count = messages.len()))]
    pub async fn publish_all<T>(
        &self,
        topic: &str,
        messages: Vec<(&T, Metadata)>,
    ) -> Result<Vec<Message>, PubSubError>
    where
        T: Serialize + ?Sized,
    {
        let topic = TopicName::new(topic.to_string())?;

        let mut payloads = Vec::with_capacity(messages.len());
        let mut outbound = Vec::with_capacity(messages.len());
        for (payload, metadata) in messages {
            let payload: Value = serde_json::to_value(payload).map_err(SerializationError::from)?;
            outbound.push(OutboundMessage::from_payload(&payload, metadata.clone())?);
            payloads.push((payload, metadata));
        }

        let ids = self.client().await?.publish(&topic, &outbound).await?;
        if ids.len() != payloads.len() {
            return Err(PubSubError::BatchMismatch {
                expected: payloads.len(),
                actual: ids.len(),
            });
        }

        debug!(count = ids.len(), "Messages published");

        Ok(ids
            .into_iter()
            .zip(payloads)
            .map(|(id, (payload, metadata))| Message {
                id,
                topic: topic.clone(),
                payload,
                metadata,
            })
            .collect())
    }

    /// Create a topic, or return it when it exists already
    #[instrument(skip_all, fields(topic = %topic))]
    pub async fn upsert_topic(&self, topic: &str) -> Result<Topic, PubSubError> {
        let topic = TopicName::new(topic.to_string())?;
        let client = self.client().await?;

        let handle = match client.create_topic(&topic).await? {
            CreateOutcome::Created(handle) => {
                info!(topic = %topic, "Topic created");
                handle
            }
            CreateOutcome::AlreadyExists => {
                debug!(topic = %topic, "Topic exists, fetching");
                client.get_topic(&topic).await?
            }
        };

        Ok(Topic::from_handle(handle)?)
    }

    /// Create a push subscription delivering to the webhook URL, or update an
    /// existing one.
    ///
    /// The webhook URL is always merged into `options` as the endpoint. On
    /// the update path every set option is assigned on the existing
    /// subscription. Changes the service refuses (e.g. a new filter) are
    /// returned as errors.
    #[instrument(skip_all, fields(topic = %topic, subscription = %name))]
    pub async fn upsert_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, PubSubError> {
        if self.is_development() {
            self.upsert_topic(topic).await?;
        }

        let topic = TopicName::new(topic.to_string())?;
        let name = SubscriptionName::new(name.to_string())?;
        let options = options.with_endpoint(self.webhook_url()?);
        let client = self.client().await?;

        let handle = match client.create_subscription(&topic, &name, &options).await? {
            CreateOutcome::Created(handle) => {
                info!(subscription = %name, "Subscription created");
                handle
            }
            CreateOutcome::AlreadyExists => {
                let mut existing = client.get_subscription(&name).await?;
                options.apply_to(&mut existing);
                let fields = options.updated_fields();
                info!(subscription = %name, fields = ?fields, "Subscription exists, updating");
                client.update_subscription(&existing, &fields).await?
            }
        };

        Ok(Subscription::from_handle(handle)?)
    }

    /// Upsert a subscription named `<gcp_sub_prefix>.<name>`
    pub async fn setup_subscription(
        &self,
        topic: &str,
        name: &str,
        options: SubscriptionOptions,
    ) -> Result<Subscription, PubSubError> {
        let name = self.config.subscription_name(name)?;
        self.upsert_subscription(topic, name.as_str(), options).await
    }
}

impl fmt::Debug for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backend")
            .field("config", &self.config)
            .field("client_initialized", &self.client.initialized())
            .finish()
    }
}
