//! Message, topic, and subscription types including validated resource names.

use crate::error::{SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Message attributes sent alongside the payload.
///
/// Pub/Sub attributes are plain strings; a `BTreeMap` keeps the wire order
/// stable.
pub type Metadata = BTreeMap<String, String>;

// ============================================================================
// Resource Names
// ============================================================================

/// Validate a Pub/Sub resource id (topic or subscription short name).
///
/// Pub/Sub ids are 3-255 characters, start with a letter, contain only
/// letters, digits and `-_.~+%`, and must not start with `goog`.
fn validate_resource_id(field: &str, name: &str) -> Result<(), ValidationError> {
    if name.len() < 3 || name.len() > 255 {
        return Err(ValidationError::OutOfRange {
            field: field.to_string(),
            message: "must be 3-255 characters".to_string(),
        });
    }

    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "must start with a letter".to_string(),
        });
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '~' | '+' | '%'))
    {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "only ASCII alphanumeric characters and -_.~+% allowed".to_string(),
        });
    }

    if name.to_ascii_lowercase().starts_with("goog") {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            message: "must not start with 'goog'".to_string(),
        });
    }

    Ok(())
}

/// Extract the short id from a resource path such as
/// `projects/my-project/topics/my-topic`. Plain ids are returned unchanged.
fn short_resource_id<'a>(path: &'a str, collection: &str) -> &'a str {
    let marker = format!("/{}/", collection);
    match path.rfind(&marker) {
        Some(idx) => &path[idx + marker.len()..],
        None => path,
    }
}

/// Validated topic name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicName(String);

impl TopicName {
    /// Create new topic name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        validate_resource_id("topic_name", &name)?;
        Ok(Self(name))
    }

    /// Create a topic name from a full resource path (`projects/p/topics/t`)
    pub fn from_resource(path: &str) -> Result<Self, ValidationError> {
        Self::new(short_resource_id(path, "topics").to_string())
    }

    /// Full resource path of the topic within a project
    pub fn resource_path(&self, project_id: &str) -> String {
        format!("projects/{}/topics/{}", project_id, self.0)
    }

    /// Get topic name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TopicName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TopicName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Validated subscription name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionName(String);

impl SubscriptionName {
    /// Create new subscription name with validation
    pub fn new(name: String) -> Result<Self, ValidationError> {
        validate_resource_id("subscription_name", &name)?;
        Ok(Self(name))
    }

    /// Create subscription name with prefix, joined by a dot
    pub fn with_prefix(prefix: &str, base_name: &str) -> Result<Self, ValidationError> {
        Self::new(format!("{}.{}", prefix, base_name))
    }

    /// Create a subscription name from a full resource path
    /// (`projects/p/subscriptions/s`)
    pub fn from_resource(path: &str) -> Result<Self, ValidationError> {
        Self::new(short_resource_id(path, "subscriptions").to_string())
    }

    /// Full resource path of the subscription within a project
    pub fn resource_path(&self, project_id: &str) -> String {
        format!("projects/{}/subscriptions/{}", project_id, self.0)
    }

    /// Get subscription name as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubscriptionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for SubscriptionName {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s.to_string())
    }
}

/// Identifier assigned to a message by the backend on publish
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Wrap a backend-assigned message id
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

// ============================================================================
// Backend Handles
// ============================================================================

/// Topic resource as described by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicHandle {
    /// Resource path (`projects/p/topics/t`) or plain id
    pub name: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

/// Push delivery configuration of a subscription
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub push_endpoint: Option<String>,
}

/// Subscription resource as described by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionHandle {
    /// Resource path (`projects/p/subscriptions/s`) or plain id
    pub name: String,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub push_config: PushConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack_deadline_seconds: Option<u32>,
    #[serde(default)]
    pub retain_acked_messages: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_retention_duration: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl SubscriptionHandle {
    /// Push endpoint messages are delivered to, if any
    pub fn endpoint(&self) -> Option<&str> {
        self.push_config.push_endpoint.as_deref()
    }
}

// ============================================================================
// Subscription Options
// ============================================================================

/// Delivery configuration applied when creating or updating a subscription
///
/// Every option that is set is treated as an individual attribute: on the
/// update path each one is assigned on the existing subscription.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubscriptionOptions {
    /// Push endpoint receiving deliveries
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Seconds the backend waits for an acknowledgement
    #[serde(default)]
    pub ack_deadline_seconds: Option<u32>,
    /// Keep acknowledged messages for replay
    #[serde(default)]
    pub retain_acked_messages: Option<bool>,
    /// Retention window in protobuf duration form, e.g. `604800s`
    #[serde(default)]
    pub message_retention_duration: Option<String>,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    /// Delivery filter; immutable once the subscription exists
    #[serde(default)]
    pub filter: Option<String>,
}

impl SubscriptionOptions {
    /// Create empty options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the push endpoint
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the acknowledgement deadline
    pub fn with_ack_deadline_seconds(mut self, seconds: u32) -> Self {
        self.ack_deadline_seconds = Some(seconds);
        self
    }

    /// Retain acknowledged messages
    pub fn with_retain_acked_messages(mut self, retain: bool) -> Self {
        self.retain_acked_messages = Some(retain);
        self
    }

    /// Set the message retention duration (e.g. `86400s`)
    pub fn with_message_retention_duration(mut self, duration: impl Into<String>) -> Self {
        self.message_retention_duration = Some(duration.into());
        self
    }

    /// Add a label
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value.into());
        self
    }

    /// Set the delivery filter
    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    /// Backend field paths of every set option, in declaration order.
    ///
    /// This is the update mask sent when an existing subscription is updated.
    pub fn updated_fields(&self) -> Vec<&'static str> {
        let mut fields = Vec::new();
        if self.endpoint.is_some() {
            fields.push("pushConfig");
        }
        if self.ack_deadline_seconds.is_some() {
            fields.push("ackDeadlineSeconds");
        }
        if self.retain_acked_messages.is_some() {
            fields.push("retainAckedMessages");
        }
        if self.message_retention_duration.is_some() {
            fields.push("messageRetentionDuration");
        }
        if self.labels.is_some() {
            fields.push("labels");
        }
        if self.filter.is_some() {
            fields.push("filter");
        }
        fields
    }

    /// Assign every set option on a subscription resource
    pub fn apply_to(&self, handle: &mut SubscriptionHandle) {
        if let Some(endpoint) = &self.endpoint {
            handle.push_config.push_endpoint = Some(endpoint.clone());
        }
        if let Some(seconds) = self.ack_deadline_seconds {
            handle.ack_deadline_seconds = Some(seconds);
        }
        if let Some(retain) = self.retain_acked_messages {
            handle.retain_acked_messages = retain;
        }
        if let Some(duration) = &self.message_retention_duration {
            handle.message_retention_duration = Some(duration.clone());
        }
        if let Some(labels) = &self.labels {
            handle.labels = labels.clone();
        }
        if let Some(filter) = &self.filter {
            handle.filter = Some(filter.clone());
        }
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// A message as it goes over the wire: serialized payload plus attributes
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub data: Bytes,
    pub attributes: Metadata,
}

impl OutboundMessage {
    /// Serialize a payload to its canonical JSON text form
    pub fn from_payload(payload: &Value, attributes: Metadata) -> Result<Self, SerializationError> {
        let data = serde_json::to_vec(payload)?;
        Ok(Self {
            data: Bytes::from(data),
            attributes,
        })
    }
}

/// A published message
///
/// Only ever produced as the result of a publish operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub topic: TopicName,
    pub payload: Value,
    pub metadata: Metadata,
}

/// A topic known to the backend
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub name: TopicName,
    pub original: TopicHandle,
}

impl Topic {
    /// Wrap a backend topic resource
    pub fn from_handle(original: TopicHandle) -> Result<Self, ValidationError> {
        let name = TopicName::from_resource(&original.name)?;
        Ok(Self { name, original })
    }
}

/// A subscription delivering a topic's messages to the webhook
#[derive(Debug, Clone, PartialEq)]
pub struct Subscription {
    pub name: SubscriptionName,
    pub original: SubscriptionHandle,
}

impl Subscription {
    /// Wrap a backend subscription resource
    pub fn from_handle(original: SubscriptionHandle) -> Result<Self, ValidationError> {
        let name = SubscriptionName::from_resource(&original.name)?;
        Ok(Self { name, original })
    }
}

/// A message delivered to the webhook by the backend
#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedMessage {
    pub id: MessageId,
    /// Subscription the delivery came through, as reported by the backend
    pub subscription: Option<String>,
    pub payload: Value,
    pub metadata: Metadata,
    pub publish_time: Option<DateTime<Utc>>,
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
