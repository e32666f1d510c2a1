//! End-to-end coverage of the refresh-token rotation protocol's two
//! defining behaviors: the single-flight invariant under concurrent callers,
//! and graceful handling of a token another context already exchanged.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;

use auth_session_engine::auth_core::AuthCoreStore;
use auth_session_engine::config::Config;
use auth_session_engine::environment::AuthCoreEnvironment;
use auth_session_engine::error::{ErrorContext, ErrorRecord};
use auth_session_engine::events::EventBus;
use auth_session_engine::idp::RefreshResult;
use auth_session_engine::mocks::MockIdpClient;
use auth_session_engine::model::{AuthMethod, TokenSet, User};
use auth_session_engine::notifier::NotifierMessage;
use auth_session_engine::persistence::{SessionPersistence, VolatileSessionStore};

fn sample_user() -> User {
    User {
        id: "u1".to_string(),
        email: "a@b.com".to_string(),
        name: None,
        email_verified: true,
        created_at: chrono::Utc::now(),
        last_login_at: None,
        metadata: None,
    }
}

fn authenticated_store(idp: Arc<MockIdpClient>) -> Arc<AuthCoreStore<MockIdpClient>> {
    let persistence: Arc<dyn SessionPersistence> = Arc::new(VolatileSessionStore::new());
    let config = Arc::new(ArcSwap::from_pointee(Config::builder("https://idp.example.com", "client-1", "example.com").build()));
    let publish: Arc<dyn Fn(NotifierMessage) + Send + Sync> = Arc::new(|_message| {});
    let env = AuthCoreEnvironment {
        idp,
        persistence,
        publish,
        events: Arc::new(EventBus::new()),
        config,
    };
    let store = AuthCoreStore::new(env);
    store.update_tokens(
        sample_user(),
        TokenSet {
            access_token: "initial-access-token".to_string(),
            refresh_token: Some("initial-refresh-token".to_string()),
            expires_at: Some(chrono::Utc::now().timestamp_millis() + 3_600_000),
            refreshed_at: Some(chrono::Utc::now().timestamp_millis()),
            secondary_token: None,
            secondary_expires_at: None,
        },
        AuthMethod::EmailCode,
    );
    store
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_refresh_calls_dispatch_exactly_one_idp_request() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_refresh_delay(Duration::from_millis(50));
    let store = authenticated_store(Arc::clone(&idp));

    let store_a = Arc::clone(&store);
    let store_b = Arc::clone(&store);
    let (result_a, result_b) = tokio::join!(store_a.refresh_tokens(), store_b.refresh_tokens());

    result_a.expect("first caller observes success");
    result_b.expect("second caller observes the same outcome");
    assert_eq!(idp.refresh_call_count(), 1, "single-flight must not issue a second /refresh request");

    let snapshot = store.snapshot();
    assert_eq!(snapshot.access_token.as_deref(), Some("mock-rotated-access-token-1"));
}

#[tokio::test]
async fn sequential_refresh_calls_each_dispatch_their_own_request() {
    let idp = Arc::new(MockIdpClient::new());
    let store = authenticated_store(Arc::clone(&idp));

    store.refresh_tokens().await.expect("first refresh succeeds");
    store.refresh_tokens().await.expect("second refresh succeeds");

    assert_eq!(idp.refresh_call_count(), 2);
    assert_eq!(store.snapshot().access_token.as_deref(), Some("mock-rotated-access-token-2"));
}

#[tokio::test]
async fn a_refresh_token_already_exchanged_by_another_context_clears_locally_without_erroring() {
    let idp = Arc::new(MockIdpClient::new());
    idp.push_refresh_result(Err(ErrorRecord::classify(
        "invalid_grant: refresh token already exchanged",
        ErrorContext::default(),
        None,
    )));
    let store = authenticated_store(Arc::clone(&idp));

    store.refresh_tokens().await.expect("already-exchanged is not surfaced as an error");

    let snapshot = store.snapshot();
    assert!(snapshot.refresh_token.is_none(), "the stale refresh token must be cleared");
    assert_eq!(
        snapshot.access_token.as_deref(),
        Some("initial-access-token"),
        "the still-valid access token is left in place"
    );
}

#[tokio::test]
async fn a_hard_refresh_failure_is_surfaced_to_the_caller() {
    let idp = Arc::new(MockIdpClient::new());
    idp.push_refresh_result(Err(ErrorRecord::classify("invalid_token: malformed", ErrorContext::default(), None)));
    let store = authenticated_store(Arc::clone(&idp));

    let err = store.refresh_tokens().await.expect_err("a hard failure must propagate");
    assert_eq!(err.kind, auth_session_engine::error::ErrorKind::InvalidInput);
}

#[tokio::test]
async fn a_successful_rotation_keeps_the_refresh_token_when_the_idp_does_not_reissue_one() {
    let idp = Arc::new(MockIdpClient::new());
    idp.push_refresh_result(Ok(RefreshResult {
        access_token: "rotated-without-new-refresh-token".to_string(),
        refresh_token: None,
        expires_in: Some(3600),
        secondary_token: None,
        secondary_expires_at: None,
    }));
    let store = authenticated_store(Arc::clone(&idp));

    store.refresh_tokens().await.expect("rotation succeeds");
    let snapshot = store.snapshot();
    assert_eq!(snapshot.access_token.as_deref(), Some("rotated-without-new-refresh-token"));
    assert_eq!(
        snapshot.refresh_token.as_deref(),
        Some("initial-refresh-token"),
        "refresh token is retained when the idp omits one from the response"
    );
}
