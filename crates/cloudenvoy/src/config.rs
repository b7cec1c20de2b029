//! Configuration for publishing and receiving messages.
//!
//! Settings are gathered from an optional configuration file and
//! `CLOUDENVOY_*` environment variables into [`Settings`], refined through
//! [`ConfigBuilder`], and validated once by [`ConfigBuilder::build`]. The
//! resulting [`Config`] is immutable and meant to be shared as `Arc<Config>`.
//!
//! ```no_run
//! use cloudenvoy::Config;
//!
//! # fn example() -> Result<(), cloudenvoy::ConfigError> {
//! let config = Config::builder()
//!     .processor_host("https://app.example.com")
//!     .gcp_project_id("my-project")
//!     .gcp_sub_prefix("my-app")
//!     .secret("some-secret")
//!     .build()?;
//!
//! assert_eq!(config.processor_url(), "https://app.example.com/cloudenvoy/receive");
//! # Ok(())
//! # }
//! ```

use crate::error::{ConfigError, ValidationError};
use crate::message::SubscriptionName;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, info};
use zeroize::Zeroizing;

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

/// Default application path used for receiving pushed messages
pub const DEFAULT_PROCESSOR_PATH: &str = "/cloudenvoy/receive";

/// Default address of the local Pub/Sub emulator
pub const DEFAULT_EMULATOR_HOST: &str = "localhost:8085";

/// Default timeout applied to requests against the backend
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Environment variables consulted, in order, to resolve the environment name
pub const ENVIRONMENT_VARIABLES: [&str; 3] = ["CLOUDENVOY_ENV", "RAILS_ENV", "RACK_ENV"];

/// Environment variable read by [`EnvCredentialStore`]
pub const SECRET_KEY_BASE_VARIABLE: &str = "SECRET_KEY_BASE";

const DEFAULT_ENVIRONMENT: &str = "development";

// ============================================================================
// Mode and Environment
// ============================================================================

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Send messages to the local Pub/Sub emulator
    Development,
    /// Send messages to Google Cloud Pub/Sub
    Production,
}

impl Mode {
    /// Derive the mode from an environment name
    pub fn for_environment(environment: &str) -> Self {
        if environment == DEFAULT_ENVIRONMENT {
            Self::Development
        } else {
            Self::Production
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Development => write!(f, "development"),
            Self::Production => write!(f, "production"),
        }
    }
}

impl FromStr for Mode {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "development" => Ok(Self::Development),
            "production" => Ok(Self::Production),
            other => Err(ValidationError::InvalidFormat {
                field: "mode".to_string(),
                message: format!("expected 'development' or 'production', got '{}'", other),
            }),
        }
    }
}

/// Resolve the environment name through a variable lookup.
///
/// The first non-empty value among [`ENVIRONMENT_VARIABLES`] wins; the
/// default is `"development"`.
pub fn environment_from<F>(lookup: F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    ENVIRONMENT_VARIABLES
        .iter()
        .copied()
        .filter_map(|name| lookup(name))
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_ENVIRONMENT.to_string())
}

/// Resolve the environment name from the process environment
pub fn environment() -> String {
    environment_from(|name| std::env::var(name).ok())
}

// ============================================================================
// Secrets
// ============================================================================

/// Secure container for secret values
///
/// The value is zeroed on drop and never shows up in `Debug` output.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue {
    inner: Zeroizing<String>,
}

impl SecretValue {
    /// Create secret value from string
    pub fn from_string(value: String) -> Self {
        Self {
            inner: Zeroizing::new(value),
        }
    }

    /// Get secret as string (only for immediate use)
    pub fn expose_secret(&self) -> &str {
        &self.inner
    }

    /// Get secret as bytes
    pub fn expose_bytes(&self) -> &[u8] {
        self.inner.as_bytes()
    }

    /// Check if secret is empty
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

impl From<&str> for SecretValue {
    fn from(value: &str) -> Self {
        Self::from_string(value.to_string())
    }
}

impl From<String> for SecretValue {
    fn from(value: String) -> Self {
        Self::from_string(value)
    }
}

impl fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretValue")
            .field("value", &"[REDACTED]")
            .finish()
    }
}

/// Application credential store consulted when no secret is configured
pub trait CredentialStore: Send + Sync {
    /// The application's base signing secret, if it has one
    fn secret_key_base(&self) -> Option<SecretValue>;
}

/// Credential store backed by the `SECRET_KEY_BASE` environment variable
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvCredentialStore;

impl CredentialStore for EnvCredentialStore {
    fn secret_key_base(&self) -> Option<SecretValue> {
        std::env::var(SECRET_KEY_BASE_VARIABLE)
            .ok()
            .filter(|value| !value.is_empty())
            .map(SecretValue::from_string)
    }
}

// ============================================================================
// Host Allowlist
// ============================================================================

/// Host allowlist of the web application receiving pushed messages
///
/// When the allowlist is in use (non-empty), the processor host is added to
/// it so pushed deliveries are not rejected by host filtering.
pub trait HostAllowlist: Send + Sync {
    /// Hosts currently allowed
    fn hosts(&self) -> Vec<String>;

    /// Allow an additional host
    fn allow(&self, host: &str);
}

/// Thread-safe in-process host allowlist
#[derive(Debug, Clone, Default)]
pub struct SharedHostAllowlist {
    hosts: Arc<RwLock<Vec<String>>>,
}

impl SharedHostAllowlist {
    /// Create an allowlist seeded with hosts
    pub fn new<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            hosts: Arc::new(RwLock::new(hosts.into_iter().map(Into::into).collect())),
        }
    }

    /// Check whether a host is allowed
    pub fn contains(&self, host: &str) -> bool {
        self.hosts().iter().any(|h| h == host)
    }
}

impl HostAllowlist for SharedHostAllowlist {
    fn hosts(&self) -> Vec<String> {
        match self.hosts.read() {
            Ok(hosts) => hosts.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn allow(&self, host: &str) {
        let mut hosts = match self.hosts.write() {
            Ok(hosts) => hosts,
            Err(poisoned) => poisoned.into_inner(),
        };
        if !hosts.iter().any(|h| h == host) {
            hosts.push(host.to_string());
        }
    }
}

/// Strip the `http://` or `https://` scheme from a host URL
fn bare_host(host: &str) -> &str {
    host.strip_prefix("https://")
        .or_else(|| host.strip_prefix("http://"))
        .unwrap_or(host)
}

// ============================================================================
// Settings
// ============================================================================

/// Raw settings as read from configuration sources
///
/// Every field is optional here; required values are enforced by
/// [`ConfigBuilder::build`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub processor_host: Option<String>,
    #[serde(default)]
    pub processor_path: Option<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub gcp_project_id: Option<String>,
    #[serde(default)]
    pub gcp_sub_prefix: Option<String>,
    #[serde(default)]
    pub emulator_host: Option<String>,
    /// OAuth2 access token used against Google Cloud in production mode.
    /// When unset, the workload's service account token is fetched from the
    /// metadata server and refreshed before it expires.
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub request_timeout_seconds: Option<u64>,
}

impl Settings {
    /// Load settings from an optional file and `CLOUDENVOY_*` variables.
    ///
    /// Environment variables override file values. The file format is
    /// inferred from its extension (YAML, TOML or JSON); a file given
    /// explicitly must exist.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading cloudenvoy configuration file");
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config = builder
            .add_source(config::Environment::with_prefix("CLOUDENVOY"))
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

// ============================================================================
// Config Builder
// ============================================================================

/// Builder collecting configuration values before validation
#[derive(Default)]
pub struct ConfigBuilder {
    settings: Settings,
    environment: Option<String>,
    credential_store: Option<Arc<dyn CredentialStore>>,
    host_allowlist: Option<Arc<dyn HostAllowlist>>,
}

impl ConfigBuilder {
    /// Create an empty builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from previously loaded settings
    pub fn from_settings(settings: Settings) -> Self {
        Self {
            settings,
            ..Self::default()
        }
    }

    /// Force the operating mode instead of deriving it from the environment
    pub fn mode(mut self, mode: Mode) -> Self {
        self.settings.mode = Some(mode);
        self
    }

    /// Use an explicit environment name instead of reading the process
    /// environment
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = Some(environment.into());
        self
    }

    /// Public host pushed messages are delivered to, e.g.
    /// `https://app.example.com`
    pub fn processor_host(mut self, host: impl Into<String>) -> Self {
        self.settings.processor_host = Some(host.into());
        self
    }

    /// Path on the processor host receiving pushed messages
    pub fn processor_path(mut self, path: impl Into<String>) -> Self {
        self.settings.processor_path = Some(path.into());
        self
    }

    /// Secret used to sign verification tokens
    pub fn secret(mut self, secret: impl Into<String>) -> Self {
        self.settings.secret = Some(secret.into());
        self
    }

    pub fn gcp_project_id(mut self, project_id: impl Into<String>) -> Self {
        self.settings.gcp_project_id = Some(project_id.into());
        self
    }

    /// Prefix used when naming subscriptions
    pub fn gcp_sub_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.settings.gcp_sub_prefix = Some(prefix.into());
        self
    }

    /// Address of the local emulator, used in development mode
    pub fn emulator_host(mut self, host: impl Into<String>) -> Self {
        self.settings.emulator_host = Some(host.into());
        self
    }

    pub fn access_token(mut self, token: impl Into<String>) -> Self {
        self.settings.access_token = Some(token.into());
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.settings.request_timeout_seconds = Some(timeout.as_secs());
        self
    }

    /// Credential store providing a fallback secret
    pub fn credential_store(mut self, store: Arc<dyn CredentialStore>) -> Self {
        self.credential_store = Some(store);
        self
    }

    /// Host allowlist the processor host is registered into
    pub fn host_allowlist(mut self, allowlist: Arc<dyn HostAllowlist>) -> Self {
        self.host_allowlist = Some(allowlist);
        self
    }

    /// Validate the collected values and produce a [`Config`].
    ///
    /// Required values are checked in this order: processor host, project
    /// id, subscription prefix, secret. The first missing one is reported.
    pub fn build(self) -> Result<Config, ConfigError> {
        let settings = self.settings;

        let processor_host = settings
            .processor_host
            .filter(|host| !host.is_empty())
            .ok_or(ConfigError::ProcessorHostMissing)?;
        validate_processor_host(&processor_host)?;

        let gcp_project_id = settings
            .gcp_project_id
            .filter(|id| !id.is_empty())
            .ok_or(ConfigError::ProjectIdMissing)?;

        let gcp_sub_prefix = settings
            .gcp_sub_prefix
            .filter(|prefix| !prefix.is_empty())
            .ok_or(ConfigError::SubPrefixMissing)?;

        let secret = match settings.secret.filter(|s| !s.is_empty()) {
            Some(secret) => SecretValue::from_string(secret),
            None => self
                .credential_store
                .as_ref()
                .and_then(|store| store.secret_key_base())
                .filter(|secret| !secret.is_empty())
                .ok_or(ConfigError::SecretMissing)?,
        };

        let environment = self.environment.unwrap_or_else(environment);
        let mode = settings
            .mode
            .unwrap_or_else(|| Mode::for_environment(&environment));

        if let Some(allowlist) = &self.host_allowlist {
            if !allowlist.hosts().is_empty() {
                let host = bare_host(&processor_host);
                debug!(host = %host, "Adding processor host to host allowlist");
                allowlist.allow(host);
            }
        }

        let config = Config {
            mode,
            environment,
            processor_host,
            processor_path: settings
                .processor_path
                .filter(|path| !path.is_empty())
                .unwrap_or_else(|| DEFAULT_PROCESSOR_PATH.to_string()),
            secret,
            gcp_project_id,
            gcp_sub_prefix,
            emulator_host: settings
                .emulator_host
                .filter(|host| !host.is_empty())
                .unwrap_or_else(|| DEFAULT_EMULATOR_HOST.to_string()),
            access_token: settings
                .access_token
                .filter(|token| !token.is_empty())
                .map(SecretValue::from_string),
            request_timeout: settings
                .request_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_REQUEST_TIMEOUT),
        };

        info!(
            mode = %config.mode,
            environment = %config.environment,
            project_id = %config.gcp_project_id,
            "Cloudenvoy configuration loaded"
        );

        Ok(config)
    }
}

fn validate_processor_host(host: &str) -> Result<(), ConfigError> {
    let url = url::Url::parse(host).map_err(|e| ConfigError::InvalidProcessorHost {
        host: host.to_string(),
        message: e.to_string(),
    })?;

    if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
        return Err(ConfigError::InvalidProcessorHost {
            host: host.to_string(),
            message: "expected an absolute http(s) URL such as `https://app.example.com`"
                .to_string(),
        });
    }

    Ok(())
}

// ============================================================================
// Config
// ============================================================================

/// Validated cloudenvoy configuration
#[derive(Debug, Clone)]
pub struct Config {
    mode: Mode,
    environment: String,
    processor_host: String,
    processor_path: String,
    secret: SecretValue,
    gcp_project_id: String,
    gcp_sub_prefix: String,
    emulator_host: String,
    access_token: Option<SecretValue>,
    request_timeout: Duration,
}

impl Config {
    /// Create a new configuration builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Build a configuration from `CLOUDENVOY_*` variables and an optional
    /// file, falling back to `SECRET_KEY_BASE` for the secret
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        ConfigBuilder::from_settings(Settings::load(path)?)
            .credential_store(Arc::new(EnvCredentialStore))
            .build()
    }

    /// Operating mode, resolved once when the configuration was built
    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn is_development(&self) -> bool {
        self.mode == Mode::Development
    }

    /// Environment name the mode was derived from
    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn processor_host(&self) -> &str {
        &self.processor_host
    }

    pub fn processor_path(&self) -> &str {
        &self.processor_path
    }

    /// Full URL pushed messages are delivered to
    pub fn processor_url(&self) -> String {
        format!(
            "{}/{}",
            self.processor_host.trim_end_matches('/'),
            self.processor_path.trim_start_matches('/')
        )
    }

    /// Secret used to sign verification tokens
    pub fn secret(&self) -> &SecretValue {
        &self.secret
    }

    pub fn gcp_project_id(&self) -> &str {
        &self.gcp_project_id
    }

    pub fn gcp_sub_prefix(&self) -> &str {
        &self.gcp_sub_prefix
    }

    pub fn emulator_host(&self) -> &str {
        &self.emulator_host
    }

    pub fn access_token(&self) -> Option<&SecretValue> {
        self.access_token.as_ref()
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Subscription name qualified with the configured prefix
    pub fn subscription_name(&self, name: &str) -> Result<SubscriptionName, ValidationError> {
        SubscriptionName::with_prefix(&self.gcp_sub_prefix, name)
    }
}
