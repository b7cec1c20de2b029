//! Client interface to the managed Pub/Sub service.
//!
//! [`PubSubClient`] is the seam between the backend adapter and the service.
//! The production implementation talks to Google Cloud Pub/Sub (or its local
//! emulator) over REST; an in-memory implementation backs tests and offline
//! development.

use crate::error::PubSubError;
use crate::message::{
    MessageId, OutboundMessage, SubscriptionHandle, SubscriptionName, SubscriptionOptions,
    TopicHandle, TopicName,
};
use async_trait::async_trait;

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Result of a create call against a resource that may already exist
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateOutcome<T> {
    /// The resource was created by this call
    Created(T),
    /// A resource with the same name exists already; nothing was changed
    AlreadyExists,
}

impl<T> CreateOutcome<T> {
    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created(_))
    }

    /// The created resource, if this call created one
    pub fn created(self) -> Option<T> {
        match self {
            Self::Created(resource) => Some(resource),
            Self::AlreadyExists => None,
        }
    }
}

/// Operations the backend adapter needs from the Pub/Sub service.
///
/// Conflicts on create are reported through [`CreateOutcome::AlreadyExists`];
/// every other failure is returned as a [`PubSubError`] and is not retried.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PubSubClient: Send + Sync {
    /// Create a topic
    async fn create_topic(&self, topic: &TopicName)
        -> Result<CreateOutcome<TopicHandle>, PubSubError>;

    /// Fetch an existing topic
    async fn get_topic(&self, topic: &TopicName) -> Result<TopicHandle, PubSubError>;

    /// Publish a batch of messages without looking the topic up first.
    ///
    /// Returns one id per message, in input order.
    async fn publish(
        &self,
        topic: &TopicName,
        messages: &[OutboundMessage],
    ) -> Result<Vec<MessageId>, PubSubError>;

    /// Create a subscription on a topic
    async fn create_subscription(
        &self,
        topic: &TopicName,
        name: &SubscriptionName,
        options: &SubscriptionOptions,
    ) -> Result<CreateOutcome<SubscriptionHandle>, PubSubError>;

    /// Fetch an existing subscription
    async fn get_subscription(
        &self,
        name: &SubscriptionName,
    ) -> Result<SubscriptionHandle, PubSubError>;

    /// Write the listed fields of `subscription` onto the existing
    /// subscription of the same name.
    ///
    /// `update_mask` holds backend field paths such as `pushConfig`.
    async fn update_subscription(
        &self,
        subscription: &SubscriptionHandle,
        update_mask: &[&'static str],
    ) -> Result<SubscriptionHandle, PubSubError>;
}
