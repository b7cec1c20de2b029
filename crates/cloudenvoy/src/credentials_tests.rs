//! Tests for access token sources.

use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Source issuing `token-1`, `token-2`, ... each valid for `lifetime`
struct CountingSource {
    calls: AtomicUsize,
    lifetime: Duration,
}

impl CountingSource {
    fn new(lifetime: Duration) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            lifetime,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TokenSource for CountingSource {
    async fn access_token(&self) -> Result<AccessToken, PubSubError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(AccessToken::expiring_at(
            SecretValue::from_string(format!("token-{}", call)),
            Utc::now() + self.lifetime,
        ))
    }
}

mod access_token {
    use super::*;

    #[test]
    fn test_token_without_expiry_never_expires() {
        let token = AccessToken::new(SecretValue::from("ya29.token"));
        assert!(!token.is_expired());
        assert!(!token.expires_soon(Duration::days(365)));
        assert_eq!(token.expires_at(), None);
    }

    #[test]
    fn test_expiry_with_margin() {
        let token = AccessToken::expiring_at(
            SecretValue::from("ya29.token"),
            Utc::now() + Duration::minutes(2),
        );
        assert!(!token.is_expired());
        assert!(token.expires_soon(Duration::minutes(5)));
        assert!(!token.expires_soon(Duration::seconds(30)));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AccessToken::new(SecretValue::from("ya29.secret-token"));
        assert!(!format!("{:?}", token).contains("ya29.secret-token"));
    }
}

mod caching {
    use super::*;

    /// Verify a token that stays valid is fetched only once.
    #[tokio::test]
    async fn test_valid_token_is_reused() {
        let inner = Arc::new(CountingSource::new(Duration::hours(1)));
        let cache = CachedTokenSource::new(inner.clone());

        let first = cache.access_token().await.unwrap();
        let second = cache.access_token().await.unwrap();

        assert_eq!(first.secret().expose_secret(), "token-1");
        assert_eq!(second.secret().expose_secret(), "token-1");
        assert_eq!(inner.calls(), 1);
    }

    /// Verify an expired token is fetched again.
    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let inner = Arc::new(CountingSource::new(Duration::seconds(-1)));
        let cache = CachedTokenSource::new(inner.clone()).with_refresh_margin(Duration::zero());

        let first = cache.access_token().await.unwrap();
        let second = cache.access_token().await.unwrap();

        assert_eq!(first.secret().expose_secret(), "token-1");
        assert_eq!(second.secret().expose_secret(), "token-2");
        assert_eq!(inner.calls(), 2);
    }

    /// Verify a token inside the refresh margin is replaced before it expires.
    #[tokio::test]
    async fn test_token_refreshed_before_expiry() {
        let inner = Arc::new(CountingSource::new(Duration::minutes(2)));
        let cache = CachedTokenSource::new(inner.clone());

        cache.access_token().await.unwrap();
        let second = cache.access_token().await.unwrap();

        assert_eq!(second.secret().expose_secret(), "token-2");
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let inner = Arc::new(CountingSource::new(Duration::hours(1)));
        let cache = CachedTokenSource::new(inner.clone());

        cache.access_token().await.unwrap();
        cache.invalidate().await;
        let token = cache.access_token().await.unwrap();

        assert_eq!(token.secret().expose_secret(), "token-2");
    }

    #[tokio::test]
    async fn test_inner_failure_propagates() {
        let mut inner = MockTokenSource::new();
        inner.expect_access_token().times(1).returning(|| {
            Err(PubSubError::AuthenticationFailed {
                message: "no credentials".to_string(),
            })
        });
        let cache = CachedTokenSource::new(Arc::new(inner));

        assert!(matches!(
            cache.access_token().await,
            Err(PubSubError::AuthenticationFailed { .. })
        ));
    }
}

mod sources {
    use super::*;

    #[tokio::test]
    async fn test_static_source() {
        let source = StaticTokenSource::new(SecretValue::from("ya29.token"));
        let token = source.access_token().await.unwrap();

        assert_eq!(token.secret().expose_secret(), "ya29.token");
        assert!(token.expires_at().is_none());
    }

    #[tokio::test]
    async fn test_metadata_server_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(TOKEN_PATH))
            .and(header("Metadata-Flavor", "Google"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "ya29.metadata",
                "expires_in": 3599,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let source = MetadataServerTokenSource::with_base_url(HttpClient::new(), server.uri());
        let token = source.access_token().await.unwrap();

        assert_eq!(token.secret().expose_secret(), "ya29.metadata");
        let expires_at = token.expires_at().unwrap();
        assert!(expires_at > Utc::now() + Duration::minutes(59));
        assert!(expires_at <= Utc::now() + Duration::seconds(3600));
    }

    #[tokio::test]
    async fn test_metadata_server_refusal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let source = MetadataServerTokenSource::with_base_url(HttpClient::new(), server.uri());

        assert!(matches!(
            source.access_token().await,
            Err(PubSubError::AuthenticationFailed { .. })
        ));
    }
}
