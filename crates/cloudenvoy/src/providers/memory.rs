//! In-memory Pub/Sub client for testing and offline development.
//!
//! Behaves like the managed service for the operations the backend adapter
//! uses:
//! - creating an existing topic or subscription reports `AlreadyExists`
//! - publishing to or subscribing on a missing topic fails with `NotFound`
//! - updates are applied field by field following the update mask
//! - changing the filter of an existing subscription is rejected
//!
//! Published messages are kept per topic so tests can inspect them.

use crate::client::{CreateOutcome, PubSubClient};
use crate::error::PubSubError;
use crate::message::{
    Metadata, MessageId, OutboundMessage, SubscriptionHandle, SubscriptionName,
    SubscriptionOptions, TopicHandle, TopicName,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Project id used by [`InMemoryClient::default`]
pub const DEFAULT_PROJECT_ID: &str = "in-memory";

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// A message accepted by the in-memory client
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub id: MessageId,
    pub data: Bytes,
    pub attributes: Metadata,
}

#[derive(Default)]
struct Storage {
    topics: HashMap<TopicName, TopicHandle>,
    subscriptions: HashMap<SubscriptionName, SubscriptionHandle>,
    published: HashMap<TopicName, Vec<PublishedMessage>>,
    next_message_id: u64,
}

// ============================================================================
// In-Memory Client
// ============================================================================

/// Thread-safe in-process stand-in for the Pub/Sub service
#[derive(Clone)]
pub struct InMemoryClient {
    project_id: String,
    storage: Arc<RwLock<Storage>>,
}

impl Default for InMemoryClient {
    fn default() -> Self {
        Self::new(DEFAULT_PROJECT_ID)
    }
}

impl InMemoryClient {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            storage: Arc::new(RwLock::new(Storage::default())),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// Messages published to a topic, in publish order
    pub fn published_messages(&self, topic: &TopicName) -> Vec<PublishedMessage> {
        self.read()
            .map(|storage| storage.published.get(topic).cloned().unwrap_or_default())
            .unwrap_or_default()
    }

    /// Current state of a subscription, if it exists
    pub fn subscription(&self, name: &SubscriptionName) -> Option<SubscriptionHandle> {
        self.read()
            .ok()
            .and_then(|storage| storage.subscriptions.get(name).cloned())
    }

    pub fn has_topic(&self, topic: &TopicName) -> bool {
        self.read()
            .map(|storage| storage.topics.contains_key(topic))
            .unwrap_or(false)
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Storage>, PubSubError> {
        self.storage.read().map_err(|_| Self::poisoned())
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Storage>, PubSubError> {
        self.storage.write().map_err(|_| Self::poisoned())
    }

    fn poisoned() -> PubSubError {
        PubSubError::ProviderError {
            status: 500,
            code: "INTERNAL".to_string(),
            message: "in-memory storage lock poisoned".to_string(),
        }
    }

    fn invalid_argument(message: String) -> PubSubError {
        PubSubError::ProviderError {
            status: 400,
            code: "INVALID_ARGUMENT".to_string(),
            message,
        }
    }
}

#[async_trait]
impl PubSubClient for InMemoryClient {
    async fn create_topic(
        &self,
        topic: &TopicName,
    ) -> Result<CreateOutcome<TopicHandle>, PubSubError> {
        let mut storage = self.write()?;
        if storage.topics.contains_key(topic) {
            return Ok(CreateOutcome::AlreadyExists);
        }

        let handle = TopicHandle {
            name: topic.resource_path(&self.project_id),
            ..Default::default()
        };
        storage.topics.insert(topic.clone(), handle.clone());
        debug!(topic = %topic, "Created in-memory topic");

        Ok(CreateOutcome::Created(handle))
    }

    async fn get_topic(&self, topic: &TopicName) -> Result<TopicHandle, PubSubError> {
        self.read()?
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| PubSubError::NotFound {
                resource: topic.resource_path(&self.project_id),
            })
    }

    async fn publish(
        &self,
        topic: &TopicName,
        messages: &[OutboundMessage],
    ) -> Result<Vec<MessageId>, PubSubError> {
        let mut storage = self.write()?;
        if !storage.topics.contains_key(topic) {
            return Err(PubSubError::NotFound {
                resource: topic.resource_path(&self.project_id),
            });
        }

        let mut ids = Vec::with_capacity(messages.len());
        let mut accepted = Vec::with_capacity(messages.len());
        for message in messages {
            storage.next_message_id += 1;
            let id = MessageId::new(storage.next_message_id.to_string());
            accepted.push(PublishedMessage {
                id: id.clone(),
                data: message.data.clone(),
                attributes: message.attributes.clone(),
            });
            ids.push(id);
        }

        storage
            .published
            .entry(topic.clone())
            .or_default()
            .extend(accepted);

        Ok(ids)
    }

    async fn create_subscription(
        &self,
        topic: &TopicName,
        name: &SubscriptionName,
        options: &SubscriptionOptions,
    ) -> Result<CreateOutcome<SubscriptionHandle>, PubSubError> {
        let mut storage = self.write()?;
        if storage.subscriptions.contains_key(name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if !storage.topics.contains_key(topic) {
            return Err(PubSubError::NotFound {
                resource: topic.resource_path(&self.project_id),
            });
        }

        let mut handle = SubscriptionHandle {
            name: name.resource_path(&self.project_id),
            topic: topic.resource_path(&self.project_id),
            ..Default::default()
        };
        options.apply_to(&mut handle);
        storage.subscriptions.insert(name.clone(), handle.clone());
        debug!(subscription = %name, topic = %topic, "Created in-memory subscription");

        Ok(CreateOutcome::Created(handle))
    }

    async fn get_subscription(
        &self,
        name: &SubscriptionName,
    ) -> Result<SubscriptionHandle, PubSubError> {
        self.read()?
            .subscriptions
            .get(name)
            .cloned()
            .ok_or_else(|| PubSubError::NotFound {
                resource: name.resource_path(&self.project_id),
            })
    }

    async fn update_subscription(
        &self,
        subscription: &SubscriptionHandle,
        update_mask: &[&'static str],
    ) -> Result<SubscriptionHandle, PubSubError> {
        let name = SubscriptionName::from_resource(&subscription.name)?;
        let mut storage = self.write()?;
        let existing = storage
            .subscriptions
            .get_mut(&name)
            .ok_or_else(|| PubSubError::NotFound {
                resource: name.resource_path(&self.project_id),
            })?;

        let mut updated = existing.clone();
        for field in update_mask {
            match *field {
                "pushConfig" => updated.push_config = subscription.push_config.clone(),
                "ackDeadlineSeconds" => {
                    updated.ack_deadline_seconds = subscription.ack_deadline_seconds
                }
                "retainAckedMessages" => {
                    updated.retain_acked_messages = subscription.retain_acked_messages
                }
                "messageRetentionDuration" => {
                    updated.message_retention_duration =
                        subscription.message_retention_duration.clone()
                }
                "labels" => updated.labels = subscription.labels.clone(),
                "filter" => {
                    if existing.filter != subscription.filter {
                        return Err(Self::invalid_argument(format!(
                            "filter of subscription {} cannot be changed",
                            name
                        )));
                    }
                }
                other => {
                    return Err(Self::invalid_argument(format!(
                        "unknown field in update mask: {}",
                        other
                    )))
                }
            }
        }

        *existing = updated.clone();
        debug!(subscription = %name, fields = ?update_mask, "Updated in-memory subscription");

        Ok(updated)
    }
}
