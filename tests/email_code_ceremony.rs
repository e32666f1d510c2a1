//! End-to-end coverage of the email-code sign-in ceremony, driven entirely
//! through `CompositionFacade` the way an embedding UI would.

use std::sync::Arc;

use auth_session_engine::auth_core::CoreState;
use auth_session_engine::ceremony::SignInState;
use auth_session_engine::config::{Config, SignInMode};
use auth_session_engine::facade::CompositionFacade;
use auth_session_engine::mocks::MockIdpClient;
use auth_session_engine::notifier::BroadcastNotifier;
use auth_session_engine::persistence::VolatileSessionStore;

fn test_config(mode: SignInMode) -> Config {
    Config::builder("https://idp.example.com", "client-1", "example.com")
        .with_sign_in_mode(mode)
        .build()
}

#[tokio::test]
async fn new_user_completes_registration_via_email_code() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("new@example.com", false, false, false, 0);
    idp.set_verify_email_code_success("new@example.com", "123456");

    let facade = CompositionFacade::new(
        test_config(SignInMode::LoginOrRegister),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.set_email("new@example.com");
    facade.check_user("new@example.com").await.expect("check_user succeeds");
    assert_eq!(facade.snapshot().sign_in_state, SignInState::EmailVerification);

    facade.send_email_code("new@example.com", true).await.expect("send succeeds");
    assert_eq!(facade.snapshot().sign_in_state, SignInState::PinEntry);
    assert!(facade.snapshot().email_code_sent);

    facade.set_email_code("123456");
    facade.verify_email_code("new@example.com", "123456").await.expect("verify succeeds");

    let snapshot = facade.snapshot();
    assert_eq!(snapshot.sign_in_state, SignInState::SignedIn);
    assert_eq!(snapshot.state, CoreState::Authenticated);
    assert_eq!(snapshot.access_token.as_deref(), Some("mock-access-token"));
    assert_eq!(snapshot.user.expect("user adopted").email, "new@example.com");
}

#[tokio::test]
async fn existing_user_with_valid_pin_skips_straight_to_pin_entry() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("returning@example.com", true, false, true, 4);
    idp.set_verify_email_code_success("returning@example.com", "000111");

    let facade = CompositionFacade::new(
        test_config(SignInMode::LoginOrRegister),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("returning@example.com").await.expect("check_user succeeds");
    let snapshot = facade.snapshot();
    assert_eq!(snapshot.sign_in_state, SignInState::PinEntry);
    assert!(snapshot.has_valid_pin);
    assert_eq!(snapshot.pin_remaining_minutes, 4);

    facade
        .verify_email_code("returning@example.com", "000111")
        .await
        .expect("verify succeeds");
    assert_eq!(facade.snapshot().sign_in_state, SignInState::SignedIn);
}

#[tokio::test]
async fn login_only_mode_rejects_an_unknown_email_with_no_adoption() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("ghost@example.com", false, false, false, 0);

    let facade = CompositionFacade::new(
        test_config(SignInMode::LoginOnly),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("ghost@example.com").await.expect("check_user itself does not error");
    let snapshot = facade.snapshot();
    assert_eq!(snapshot.sign_in_state, SignInState::GeneralError);
    assert!(snapshot.ui_error.is_some());
    assert_eq!(snapshot.state, CoreState::Unauthenticated);
}

#[tokio::test]
async fn an_invalid_code_is_rejected_without_signing_in() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("new@example.com", false, false, false, 0);
    idp.set_verify_email_code_success("new@example.com", "123456");

    let facade = CompositionFacade::new(
        test_config(SignInMode::LoginOrRegister),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("new@example.com").await.expect("check_user succeeds");
    facade.send_email_code("new@example.com", true).await.expect("send succeeds");

    let err = facade
        .verify_email_code("new@example.com", "000000")
        .await
        .expect_err("wrong code must fail");
    assert_eq!(err.kind, auth_session_engine::error::ErrorKind::InvalidCode);
    assert_eq!(facade.snapshot().state, CoreState::Unauthenticated);
}
