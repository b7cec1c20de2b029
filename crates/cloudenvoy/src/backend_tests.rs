//! Tests for the backend adapter.

use super::*;
use crate::authenticator::MockVerificationTokens;
use crate::client::MockPubSubClient;
use crate::message::{MessageId, PushConfig, SubscriptionHandle, TopicHandle};
use crate::providers::InMemoryClient;
use serde_json::json;

const WEBHOOK_URL: &str = "https://app.example.com/cloudenvoy/receive?token=123";

fn config(environment: &str) -> Arc<Config> {
    Arc::new(
        Config::builder()
            .environment(environment)
            .processor_host("https://app.example.com")
            .gcp_project_id("my-project")
            .gcp_sub_prefix("my-app")
            .secret("some-secret")
            .build()
            .unwrap(),
    )
}

fn fixed_tokens() -> Arc<dyn VerificationTokens> {
    let mut tokens = MockVerificationTokens::new();
    tokens
        .expect_verification_token()
        .returning(|_| Ok("123".to_string()));
    tokens.expect_verify().returning(|token| token == "123");
    Arc::new(tokens)
}

fn backend(environment: &str, client: impl PubSubClient + 'static) -> Backend {
    Backend::with_verification_tokens(config(environment), fixed_tokens())
        .with_client(Arc::new(client))
}

fn attributes(pairs: &[(&str, &str)]) -> Metadata {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

mod configuration {
    use super::*;

    #[test]
    fn test_development_mode() {
        let dev = Backend::new(config("development"));
        assert!(dev.is_development());

        let prod = Backend::new(config("production"));
        assert!(!prod.is_development());
        assert_eq!(prod.config().gcp_project_id(), "my-project");
    }

    /// Verify the emulator host is passed to the client only in development.
    #[test]
    fn test_client_options_emulator_host() {
        let dev = Backend::new(config("development")).client_options();
        assert_eq!(dev.project_id, "my-project");
        assert_eq!(dev.emulator_host.as_deref(), Some("localhost:8085"));

        let prod = Backend::new(config("production")).client_options();
        assert_eq!(prod.project_id, "my-project");
        assert!(prod.emulator_host.is_none());
    }

    #[test]
    fn test_access_token_only_outside_development() {
        let build = |environment: &str| {
            Arc::new(
                Config::builder()
                    .environment(environment)
                    .processor_host("https://app.example.com")
                    .gcp_project_id("my-project")
                    .gcp_sub_prefix("my-app")
                    .secret("some-secret")
                    .access_token("ya29.token")
                    .build()
                    .unwrap(),
            )
        };

        let prod = Backend::new(build("production")).client_options();
        assert_eq!(
            prod.access_token.as_ref().map(|t| t.expose_secret()),
            Some("ya29.token")
        );

        let dev = Backend::new(build("development")).client_options();
        assert!(dev.access_token.is_none());
    }

    /// Verify the client is built once, including under concurrent first use.
    #[tokio::test]
    async fn test_client_is_memoized() {
        let backend = Backend::new(config("development"));

        let (first, second) = tokio::join!(backend.client(), backend.client());
        let (first, second) = (first.unwrap(), second.unwrap());
        let third = backend.client().await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(&first, &third));
    }

    #[tokio::test]
    async fn test_injected_client_is_used() {
        let client: Arc<dyn PubSubClient> = Arc::new(InMemoryClient::new("my-project"));
        let backend = Backend::new(config("production")).with_client(Arc::clone(&client));

        assert!(Arc::ptr_eq(&backend.client().await.unwrap(), &client));
    }
}

mod webhook {
    use super::*;

    #[test]
    fn test_webhook_url_appends_token() {
        let backend = Backend::with_verification_tokens(config("production"), fixed_tokens());
        assert_eq!(backend.webhook_url().unwrap(), WEBHOOK_URL);
    }

    /// Verify the default signer produces a token the receiver accepts.
    #[test]
    fn test_webhook_token_verifies() {
        let config = config("production");
        let backend = Backend::new(Arc::clone(&config));

        let url = backend.webhook_url().unwrap();
        let token = url
            .strip_prefix("https://app.example.com/cloudenvoy/receive?token=")
            .unwrap();

        assert!(Authenticator::from_config(&config).verify(token));
    }

    #[test]
    fn test_signing_failure_propagates() {
        let mut tokens = MockVerificationTokens::new();
        tokens.expect_verification_token().returning(|_| {
            Err(AuthenticationError::SigningFailed {
                message: "boom".to_string(),
            })
        });
        let backend = Backend::with_verification_tokens(config("production"), Arc::new(tokens));

        assert!(matches!(
            backend.webhook_url(),
            Err(AuthenticationError::SigningFailed { .. })
        ));
    }
}

mod publishing {
    use super::*;

    #[tokio::test]
    async fn test_publish_returns_message() {
        let mut client = MockPubSubClient::new();
        client
            .expect_publish()
            .withf(|topic, messages| {
                topic.as_str() == "some-topic"
                    && messages.len() == 1
                    && messages[0].data.as_ref() == br#"{"foo":"bar"}"#
                    && messages[0].attributes.get("some").map(String::as_str) == Some("attribute")
            })
            .times(1)
            .returning(|_, _| Ok(vec![MessageId::new("123")]));

        let message = backend("production", client)
            .publish(
                "some-topic",
                &json!({"foo": "bar"}),
                attributes(&[("some", "attribute")]),
            )
            .await
            .unwrap();

        assert_eq!(message.id.as_str(), "123");
        assert_eq!(message.topic.as_str(), "some-topic");
        assert_eq!(message.payload, json!({"foo": "bar"}));
        assert_eq!(message.metadata, attributes(&[("some", "attribute")]));
    }

    #[derive(Serialize)]
    struct UserCreated {
        id: u64,
        email: String,
    }

    #[tokio::test]
    async fn test_publish_serializes_typed_payload() {
        let client = InMemoryClient::new("my-project");
        let topic = TopicName::new("user-events".to_string()).unwrap();
        client.create_topic(&topic).await.unwrap();

        let message = backend("production", client.clone())
            .publish(
                "user-events",
                &UserCreated {
                    id: 42,
                    email: "jane@example.com".to_string(),
                },
                Metadata::new(),
            )
            .await
            .unwrap();

        assert_eq!(
            message.payload,
            json!({"id": 42, "email": "jane@example.com"})
        );
        let published = client.published_messages(&topic);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].id, message.id);
    }

    /// Verify one message per input pair, in input order.
    #[tokio::test]
    async fn test_publish_all_preserves_order() {
        let mut client = MockPubSubClient::new();
        client
            .expect_publish()
            .times(1)
            .returning(|_, messages| {
                Ok((0..messages.len())
                    .map(|i| MessageId::new(format!("id-{}", i)))
                    .collect())
            });

        let payloads = [json!({"n": 0}), json!({"n": 1}), json!({"n": 2})];
        let pairs: Vec<(&Value, Metadata)> = payloads
            .iter()
            .enumerate()
            .map(|(i, payload)| (payload, attributes(&[("index", i.to_string().as_str())])))
            .collect();

        let messages = backend("production", client)
            .publish_all("some-topic", pairs)
            .await
            .unwrap();

        assert_eq!(messages.len(), 3);
        for (i, message) in messages.iter().enumerate() {
            assert_eq!(message.id.as_str(), format!("id-{}", i));
            assert_eq!(message.payload, json!({ "n": i }));
            assert_eq!(message.metadata.get("index"), Some(&i.to_string()));
            assert_eq!(message.topic.as_str(), "some-topic");
        }
    }

    #[tokio::test]
    async fn test_publish_all_rejects_id_count_mismatch() {
        let mut client = MockPubSubClient::new();
        client
            .expect_publish()
            .returning(|_, _| Ok(vec![MessageId::new("1")]));

        let payloads = [json!({"n": 0}), json!({"n": 1})];
        let result = backend("production", client)
            .publish_all(
                "some-topic",
                payloads.iter().map(|p| (p, Metadata::new())).collect(),
            )
            .await;

        assert!(matches!(
            result,
            Err(PubSubError::BatchMismatch {
                expected: 2,
                actual: 1
            })
        ));
    }

    /// Verify service failures reach the caller untouched and without retry.
    #[tokio::test]
    async fn test_publish_failure_propagates() {
        let mut client = MockPubSubClient::new();
        client.expect_publish().times(1).returning(|_, _| {
            Err(PubSubError::PermissionDenied {
                operation: "publish".to_string(),
            })
        });

        let result = backend("production", client)
            .publish("some-topic", &json!({}), Metadata::new())
            .await;

        assert!(matches!(result, Err(PubSubError::PermissionDenied { .. })));
    }

    #[tokio::test]
    async fn test_invalid_topic_name_rejected() {
        let client = MockPubSubClient::new();
        let result = backend("production", client)
            .publish("goog-topic", &json!({}), Metadata::new())
            .await;

        assert!(matches!(result, Err(PubSubError::ValidationError(_))));
    }
}

mod topics {
    use super::*;

    /// Verify a second upsert succeeds and returns the same topic.
    #[tokio::test]
    async fn test_upsert_topic_is_idempotent() {
        let backend = backend("production", InMemoryClient::new("my-project"));

        let first = backend.upsert_topic("some-topic").await.unwrap();
        let second = backend.upsert_topic("some-topic").await.unwrap();

        assert_eq!(first.name.as_str(), "some-topic");
        assert_eq!(first.name, second.name);
        assert_eq!(first.original, second.original);
    }

    #[tokio::test]
    async fn test_existing_topic_is_fetched() {
        let mut client = MockPubSubClient::new();
        client
            .expect_create_topic()
            .times(1)
            .returning(|_| Ok(CreateOutcome::AlreadyExists));
        client.expect_get_topic().times(1).returning(|_| {
            Ok(TopicHandle {
                name: "projects/my-project/topics/some-topic".to_string(),
                ..Default::default()
            })
        });

        let topic = backend("production", client)
            .upsert_topic("some-topic")
            .await
            .unwrap();

        assert_eq!(topic.name.as_str(), "some-topic");
        assert_eq!(topic.original.name, "projects/my-project/topics/some-topic");
    }

    #[tokio::test]
    async fn test_create_failure_propagates() {
        let mut client = MockPubSubClient::new();
        client.expect_create_topic().returning(|_| {
            Err(PubSubError::ConnectionFailed {
                message: "connection refused".to_string(),
            })
        });
        client.expect_get_topic().never();

        let result = backend("production", client).upsert_topic("some-topic").await;
        assert!(matches!(result, Err(PubSubError::ConnectionFailed { .. })));
    }
}

mod subscriptions {
    use super::*;

    /// Verify an existing subscription gets every option plus the endpoint
    /// assigned, and the fetched subscription is returned.
    #[tokio::test]
    async fn test_existing_subscription_is_updated() {
        let mut client = MockPubSubClient::new();
        client.expect_create_topic().never();
        client
            .expect_create_subscription()
            .withf(|topic, name, options| {
                topic.as_str() == "some-topic"
                    && name.as_str() == "some.name"
                    && options.endpoint.as_deref() == Some(WEBHOOK_URL)
                    && options.retain_acked_messages == Some(true)
            })
            .times(1)
            .returning(|_, _, _| Ok(CreateOutcome::AlreadyExists));
        client
            .expect_get_subscription()
            .withf(|name| name.as_str() == "some.name")
            .times(1)
            .returning(|_| {
                Ok(SubscriptionHandle {
                    name: "some.sub".to_string(),
                    topic: "projects/my-project/topics/some-topic".to_string(),
                    push_config: PushConfig {
                        push_endpoint: Some("https://old.example.com/receive".to_string()),
                    },
                    ..Default::default()
                })
            });
        client
            .expect_update_subscription()
            .withf(|subscription, mask| {
                subscription.retain_acked_messages
                    && subscription.endpoint() == Some(WEBHOOK_URL)
                    && mask.to_vec() == vec!["pushConfig", "retainAckedMessages"]
            })
            .times(1)
            .returning(|subscription, _| Ok(SubscriptionHandle::clone(subscription)));

        let subscription = backend("production", client)
            .upsert_subscription(
                "some-topic",
                "some.name",
                SubscriptionOptions::new().with_retain_acked_messages(true),
            )
            .await
            .unwrap();

        assert_eq!(subscription.name.as_str(), "some.sub");
        assert!(subscription.original.retain_acked_messages);
        assert_eq!(subscription.original.endpoint(), Some(WEBHOOK_URL));
    }

    #[tokio::test]
    async fn test_new_subscription_is_created() {
        let mut client = MockPubSubClient::new();
        client
            .expect_create_subscription()
            .times(1)
            .returning(|topic, name, options| {
                let mut handle = SubscriptionHandle {
                    name: name.resource_path("my-project"),
                    topic: topic.resource_path("my-project"),
                    ..Default::default()
                };
                options.apply_to(&mut handle);
                Ok(CreateOutcome::Created(handle))
            });
        client.expect_get_subscription().never();
        client.expect_update_subscription().never();

        let subscription = backend("production", client)
            .upsert_subscription("some-topic", "some.name", SubscriptionOptions::new())
            .await
            .unwrap();

        assert_eq!(subscription.name.as_str(), "some.name");
        assert_eq!(subscription.original.endpoint(), Some(WEBHOOK_URL));
    }

    /// Verify development mode creates the topic before subscribing.
    #[tokio::test]
    async fn test_development_mode_creates_topic_first() {
        let mut seq = mockall::Sequence::new();
        let mut client = MockPubSubClient::new();
        client
            .expect_create_topic()
            .withf(|topic| topic.as_str() == "some-topic")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|topic| {
                Ok(CreateOutcome::Created(TopicHandle {
                    name: topic.resource_path("my-project"),
                    ..Default::default()
                }))
            });
        client
            .expect_create_subscription()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, name, _| {
                Ok(CreateOutcome::Created(SubscriptionHandle {
                    name: name.resource_path("my-project"),
                    ..Default::default()
                }))
            });

        backend("development", client)
            .upsert_subscription("some-topic", "some.name", SubscriptionOptions::new())
            .await
            .unwrap();
    }

    /// Verify a repeated upsert succeeds and converges on the same delivery
    /// configuration.
    #[tokio::test]
    async fn test_upsert_subscription_is_idempotent() {
        let client = InMemoryClient::new("my-project");
        let backend = backend("development", client.clone());
        let options = SubscriptionOptions::new()
            .with_ack_deadline_seconds(30)
            .with_retain_acked_messages(true);

        let first = backend
            .upsert_subscription("some-topic", "some.name", options.clone())
            .await
            .unwrap();
        let second = backend
            .upsert_subscription("some-topic", "some.name", options)
            .await
            .unwrap();

        assert_eq!(first.name, second.name);
        assert_eq!(first.original, second.original);
        assert_eq!(second.original.endpoint(), Some(WEBHOOK_URL));
        assert_eq!(second.original.ack_deadline_seconds, Some(30));
        assert!(second.original.retain_acked_messages);
    }

    /// Verify the service's refusal to change an immutable property reaches
    /// the caller.
    #[tokio::test]
    async fn test_immutable_change_is_propagated() {
        let backend = backend("development", InMemoryClient::new("my-project"));

        backend
            .upsert_subscription(
                "some-topic",
                "some.name",
                SubscriptionOptions::new().with_filter("attributes.kind = \"a\""),
            )
            .await
            .unwrap();

        let result = backend
            .upsert_subscription(
                "some-topic",
                "some.name",
                SubscriptionOptions::new().with_filter("attributes.kind = \"b\""),
            )
            .await;

        assert!(matches!(
            result,
            Err(PubSubError::ProviderError { status: 400, .. })
        ));
    }

    #[tokio::test]
    async fn test_production_mode_requires_existing_topic() {
        let backend = backend("production", InMemoryClient::new("my-project"));

        let result = backend
            .upsert_subscription("some-topic", "some.name", SubscriptionOptions::new())
            .await;

        assert!(matches!(result, Err(PubSubError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_setup_subscription_prefixes_name() {
        let client = InMemoryClient::new("my-project");
        let subscription = backend("development", client.clone())
            .setup_subscription("user-events", "users", SubscriptionOptions::new())
            .await
            .unwrap();

        assert_eq!(subscription.name.as_str(), "my-app.users");
        let name = SubscriptionName::new("my-app.users".to_string()).unwrap();
        assert!(client.subscription(&name).is_some());
    }
}
