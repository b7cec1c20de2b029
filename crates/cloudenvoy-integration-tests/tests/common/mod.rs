//! Common test utilities for cloudenvoy integration tests
//!
//! This module provides:
//! - Configuration fixtures for development and production mode
//! - A recording message handler
//! - Builders for push delivery requests

use axum::{body::Body, http::Request};
use base64::Engine;
use cloudenvoy::{Config, HandlerError, MessageHandler, ReceivedMessage};
use std::sync::{Arc, Mutex};

pub const PROJECT_ID: &str = "my-project";
pub const SECRET: &str = "some-secret";

// ============================================================================
// Configuration
// ============================================================================

/// Development configuration talking to an emulator at `emulator_host`
#[allow(dead_code)]
pub fn development_config(emulator_host: &str) -> Arc<Config> {
    Arc::new(
        Config::builder()
            .environment("development")
            .processor_host("https://app.example.com")
            .gcp_project_id(PROJECT_ID)
            .gcp_sub_prefix("my-app")
            .secret(SECRET)
            .emulator_host(emulator_host)
            .build()
            .unwrap(),
    )
}

/// Production configuration with default settings
#[allow(dead_code)]
pub fn production_config() -> Arc<Config> {
    Arc::new(
        Config::builder()
            .environment("production")
            .processor_host("https://app.example.com")
            .gcp_project_id(PROJECT_ID)
            .gcp_sub_prefix("my-app")
            .secret(SECRET)
            .build()
            .unwrap(),
    )
}

// ============================================================================
// Recording Handler
// ============================================================================

/// Message handler recording deliveries, optionally failing each one
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct RecordingHandler {
    received: Arc<Mutex<Vec<ReceivedMessage>>>,
    fail: bool,
}

impl RecordingHandler {
    #[allow(dead_code)]
    pub fn new() -> Self {
        Self::default()
    }

    #[allow(dead_code)]
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    #[allow(dead_code)]
    pub fn received(&self) -> Vec<ReceivedMessage> {
        self.received.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl MessageHandler for RecordingHandler {
    async fn handle(&self, message: ReceivedMessage) -> Result<(), HandlerError> {
        self.received.lock().unwrap().push(message);
        if self.fail {
            return Err(HandlerError::new("handler failed"));
        }
        Ok(())
    }
}

// ============================================================================
// Push Requests
// ============================================================================

/// Push envelope as Pub/Sub sends it
#[allow(dead_code)]
pub fn push_envelope(id: &str, data: &str, attributes: serde_json::Value) -> serde_json::Value {
    serde_json::json!({
        "message": {
            "data": base64::engine::general_purpose::STANDARD.encode(data),
            "attributes": attributes,
            "messageId": id,
            "publishTime": "2024-05-01T10:00:00.000Z"
        },
        "subscription": "projects/my-project/subscriptions/my-app.users"
    })
}

/// POST request delivering `body` to `uri`
#[allow(dead_code)]
pub fn push_request(uri: &str, body: &serde_json::Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}
