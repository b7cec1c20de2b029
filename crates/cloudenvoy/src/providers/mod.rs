//! Pub/Sub client implementations.
//!
//! This module contains concrete implementations of the `PubSubClient`
//! trait: the Google Cloud Pub/Sub REST client (which also serves the local
//! emulator) and an in-memory client.

pub mod google;
pub mod memory;

pub use google::{
    GoogleClient, GoogleClientOptions, GoogleError, MAX_BATCH_BYTES, MAX_BATCH_MESSAGES,
    PRODUCTION_BASE_URL,
};
pub use memory::{InMemoryClient, PublishedMessage};
