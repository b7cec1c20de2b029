//! # Cloudenvoy CLI
//!
//! Command-line interface for managing Pub/Sub resources and publishing
//! messages with cloudenvoy.
//!
//! This module provides CLI commands for:
//! - Printing the webhook URL subscriptions push to
//! - Upserting topics and subscriptions, one at a time or from a manifest
//! - Publishing JSON messages
//! - Validating configuration and verification tokens
//!
//! Configuration comes from `CLOUDENVOY_*` environment variables and an
//! optional file given with `--config`.

use clap::{Parser, Subcommand};
use cloudenvoy::{
    Authenticator, AuthenticationError, Backend, Config, ConfigError, Metadata, PubSubError,
    SubscriptionOptions,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;

// ============================================================================
// CLI Structure
// ============================================================================

/// Cloudenvoy CLI - Pub/Sub publishing and push subscriptions
#[derive(Debug, Parser)]
#[command(name = "cloudenvoy")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish to Google Cloud Pub/Sub and manage push subscriptions")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "CLOUDENVOY_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "warn")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Print the webhook URL, including its verification token
    WebhookUrl,

    /// Create a topic unless it exists
    UpsertTopic {
        /// Topic name
        topic: String,
    },

    /// Create or update a push subscription delivering to the webhook URL
    UpsertSubscription {
        /// Topic to subscribe to
        topic: String,

        /// Subscription name, prefixed with the configured subscription prefix
        name: String,

        /// Acknowledgement deadline in seconds
        #[arg(long)]
        ack_deadline: Option<u32>,

        /// Retain acknowledged messages
        #[arg(long)]
        retain_acked: bool,

        /// Message retention duration, e.g. `604800s`
        #[arg(long)]
        retention: Option<String>,

        /// Use the name as given, without the subscription prefix
        #[arg(long)]
        no_prefix: bool,
    },

    /// Publish a JSON payload to a topic
    Publish {
        /// Topic name
        topic: String,

        /// JSON payload
        payload: String,

        /// Message attribute as key=value (repeatable)
        #[arg(short, long = "metadata", value_parser = parse_key_value)]
        metadata: Vec<(String, String)>,
    },

    /// Upsert every topic and subscription listed in a YAML manifest
    Setup {
        /// Manifest file
        manifest: PathBuf,
    },

    /// Validate configuration
    Config {
        /// Show resolved configuration
        #[arg(short, long)]
        show: bool,
    },

    /// Check a verification token against the configured secret
    VerifyToken {
        /// Token to check
        token: String,
    },
}

/// Parse a `key=value` pair
fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;

    if key.is_empty() {
        return Err("attribute key must not be empty".to_string());
    }

    Ok((key.to_string(), value.to_string()))
}

// ============================================================================
// Errors
// ============================================================================

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Pub/Sub error: {0}")]
    PubSub(#[from] PubSubError),

    #[error("Token error: {0}")]
    Authentication(#[from] AuthenticationError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("Invalid manifest {path}: {message}")]
    Manifest { path: PathBuf, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::PubSub(_) => 2,
            Self::Authentication(_) => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Manifest { .. } => 5,
            Self::Io(_) => 6,
        }
    }
}

// ============================================================================
// Setup Manifest
// ============================================================================

/// Topics and subscriptions to put in place with `cloudenvoy setup`
///
/// ```yaml
/// topics:
///   - user-events
/// subscriptions:
///   - topic: user-events
///     name: users
///     options:
///       ack_deadline_seconds: 30
///       retain_acked_messages: true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SetupManifest {
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub subscriptions: Vec<SubscriptionEntry>,
}

/// A subscription in a [`SetupManifest`]
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SubscriptionEntry {
    pub topic: String,
    /// Name without the subscription prefix
    pub name: String,
    #[serde(default)]
    pub options: SubscriptionOptions,
}

impl SetupManifest {
    /// Read a manifest from a YAML file
    pub fn load(path: &Path) -> Result<Self, CliError> {
        let content = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&content).map_err(|e| CliError::Manifest {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

// ============================================================================
// Configuration Summary
// ============================================================================

/// Resolved configuration as shown by `cloudenvoy config --show`
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSummary {
    pub mode: String,
    pub environment: String,
    pub processor_url: String,
    pub gcp_project_id: String,
    pub gcp_sub_prefix: String,
    pub emulator_host: Option<String>,
    pub request_timeout_seconds: u64,
    pub secret: String,
}

impl ConfigSummary {
    pub fn from_config(config: &Config) -> Self {
        Self {
            mode: config.mode().to_string(),
            environment: config.environment().to_string(),
            processor_url: config.processor_url(),
            gcp_project_id: config.gcp_project_id().to_string(),
            gcp_sub_prefix: config.gcp_sub_prefix().to_string(),
            emulator_host: config
                .is_development()
                .then(|| config.emulator_host().to_string()),
            request_timeout_seconds: config.request_timeout().as_secs(),
            secret: "[REDACTED]".to_string(),
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    run(Cli::parse()).await
}

/// Execute a parsed command line
pub async fn run(cli: Cli) -> Result<(), CliError> {
    initialize_logging(&cli)?;

    let config = Arc::new(Config::load(cli.config.as_deref())?);
    debug!(mode = %config.mode(), "Configuration loaded");

    match cli.command {
        Commands::WebhookUrl => execute_webhook_url_command(&config),
        Commands::UpsertTopic { topic } => execute_upsert_topic_command(&config, &topic).await,
        Commands::UpsertSubscription {
            topic,
            name,
            ack_deadline,
            retain_acked,
            retention,
            no_prefix,
        } => {
            let options = subscription_options(ack_deadline, retain_acked, retention);
            execute_upsert_subscription_command(&config, &topic, &name, options, no_prefix).await
        }
        Commands::Publish {
            topic,
            payload,
            metadata,
        } => execute_publish_command(&config, &topic, &payload, metadata).await,
        Commands::Setup { manifest } => execute_setup_command(&config, &manifest).await,
        Commands::Config { show } => execute_config_command(&config, show),
        Commands::VerifyToken { token } => execute_verify_token_command(&config, &token),
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Initialize logging based on CLI arguments.
///
/// `RUST_LOG` takes precedence over `--log-level`. Logs go to stderr so
/// command output stays clean.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    if let Err(e) = result {
        debug!(error = %e, "Logging already initialized");
    }

    Ok(())
}

/// Build subscription options from command-line flags
pub fn subscription_options(
    ack_deadline: Option<u32>,
    retain_acked: bool,
    retention: Option<String>,
) -> SubscriptionOptions {
    let mut options = SubscriptionOptions::new();
    if let Some(seconds) = ack_deadline {
        options = options.with_ack_deadline_seconds(seconds);
    }
    if retain_acked {
        options = options.with_retain_acked_messages(true);
    }
    if let Some(duration) = retention {
        options = options.with_message_retention_duration(duration);
    }
    options
}

/// Parse the payload argument as JSON
pub fn parse_payload(payload: &str) -> Result<serde_json::Value, CliError> {
    serde_json::from_str(payload).map_err(|e| CliError::InvalidArgument {
        arg: "payload".to_string(),
        message: e.to_string(),
    })
}

fn execute_webhook_url_command(config: &Arc<Config>) -> Result<(), CliError> {
    let backend = Backend::new(Arc::clone(config));
    println!("{}", backend.webhook_url()?);
    Ok(())
}

async fn execute_upsert_topic_command(config: &Arc<Config>, topic: &str) -> Result<(), CliError> {
    let backend = Backend::new(Arc::clone(config));
    let topic = backend.upsert_topic(topic).await?;

    info!(topic = %topic.name, "Topic ready");
    println!("{}", topic.original.name);
    Ok(())
}

async fn execute_upsert_subscription_command(
    config: &Arc<Config>,
    topic: &str,
    name: &str,
    options: SubscriptionOptions,
    no_prefix: bool,
) -> Result<(), CliError> {
    let backend = Backend::new(Arc::clone(config));
    let subscription = if no_prefix {
        backend.upsert_subscription(topic, name, options).await?
    } else {
        backend.setup_subscription(topic, name, options).await?
    };

    info!(subscription = %subscription.name, "Subscription ready");
    println!("{}", subscription.original.name);
    Ok(())
}

async fn execute_publish_command(
    config: &Arc<Config>,
    topic: &str,
    payload: &str,
    metadata: Vec<(String, String)>,
) -> Result<(), CliError> {
    let payload = parse_payload(payload)?;
    let metadata: Metadata = metadata.into_iter().collect();

    let backend = Backend::new(Arc::clone(config));
    let message = backend.publish(topic, &payload, metadata).await?;

    println!("{}", message.id);
    Ok(())
}

async fn execute_setup_command(config: &Arc<Config>, manifest: &Path) -> Result<(), CliError> {
    let manifest = SetupManifest::load(manifest)?;
    let backend = Backend::new(Arc::clone(config));

    for topic in &manifest.topics {
        let topic = backend.upsert_topic(topic).await?;
        println!("topic {}", topic.name);
    }

    for entry in manifest.subscriptions {
        let subscription = backend
            .setup_subscription(&entry.topic, &entry.name, entry.options)
            .await?;
        println!("subscription {}", subscription.name);
    }

    Ok(())
}

fn execute_config_command(config: &Config, show: bool) -> Result<(), CliError> {
    if !show {
        println!("Configuration is valid ({} mode)", config.mode());
        return Ok(());
    }

    let summary = serde_yaml::to_string(&ConfigSummary::from_config(config)).map_err(|e| {
        CliError::InvalidArgument {
            arg: "show".to_string(),
            message: e.to_string(),
        }
    })?;
    print!("{}", summary);
    Ok(())
}

fn execute_verify_token_command(config: &Config, token: &str) -> Result<(), CliError> {
    Authenticator::from_config(config).verify_strict(token)?;
    println!("valid");
    Ok(())
}
