//! Verification tokens authenticating webhook deliveries.
//!
//! The webhook URL registered on every subscription carries a token signed
//! with the configured secret. Deliveries presenting a token that does not
//! verify against the same secret are rejected before any handler runs.
//!
//! Tokens are HS256 JSON Web Tokens. They carry no expiry so that a
//! subscription endpoint stays valid for as long as the secret does.

use crate::config::{Config, SecretValue};
use crate::error::AuthenticationError;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};
use std::fmt;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "authenticator_tests.rs"]
mod tests;

/// Claims carried by a verification token
pub type Claims = Map<String, Value>;

/// Interface for signing and verifying webhook tokens.
///
/// The backend adapter only needs to sign; the receiver only needs to
/// verify. Tests substitute fixed-token implementations.
#[cfg_attr(test, mockall::automock)]
pub trait VerificationTokens: Send + Sync {
    /// Sign a set of claims into a token string
    ///
    /// # Errors
    ///
    /// Returns `AuthenticationError::SigningFailed` if the claims cannot be
    /// encoded.
    fn verification_token(&self, claims: &Claims) -> Result<String, AuthenticationError>;

    /// Check whether a token was signed with this authenticator's secret
    fn verify(&self, token: &str) -> bool;
}

/// HS256 token signer and verifier
#[derive(Clone)]
pub struct Authenticator {
    secret: SecretValue,
}

impl Authenticator {
    pub fn new(secret: SecretValue) -> Self {
        Self { secret }
    }

    /// Create an authenticator using the configured secret
    pub fn from_config(config: &Config) -> Self {
        Self::new(config.secret().clone())
    }

    /// Token with no claims, as appended to the webhook URL
    pub fn bare_token(&self) -> Result<String, AuthenticationError> {
        self.verification_token(&Claims::new())
    }

    /// Verify a token, failing with [`AuthenticationError`] when it is
    /// missing or invalid
    pub fn verify_strict(&self, token: &str) -> Result<(), AuthenticationError> {
        if token.is_empty() {
            return Err(AuthenticationError::MissingToken);
        }

        decode::<Claims>(token, &self.decoding_key(), &Self::validation())
            .map(|_| ())
            .map_err(|e| {
                debug!(error = %e, "Verification token rejected");
                AuthenticationError::InvalidToken
            })
    }

    fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(self.secret.expose_bytes())
    }

    fn validation() -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.required_spec_claims.clear();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation
    }
}

impl VerificationTokens for Authenticator {
    fn verification_token(&self, claims: &Claims) -> Result<String, AuthenticationError> {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(self.secret.expose_bytes()),
        )
        .map_err(|e| {
            warn!(error = %e, "Failed to sign verification token");
            AuthenticationError::SigningFailed {
                message: e.to_string(),
            }
        })
    }

    fn verify(&self, token: &str) -> bool {
        self.verify_strict(token).is_ok()
    }
}

impl fmt::Debug for Authenticator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Authenticator")
            .field("algorithm", &"HS256")
            .field("secret", &"<REDACTED>")
            .finish()
    }
}
