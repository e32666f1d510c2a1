//! End-to-end coverage of the WebAuthn passkey sign-in ceremony: a
//! successful authentication and a user-cancelled one, both driven through
//! `CompositionFacade`.

use std::sync::Arc;

use auth_session_engine::auth_core::CoreState;
use auth_session_engine::ceremony::SignInState;
use auth_session_engine::config::Config;
use auth_session_engine::facade::CompositionFacade;
use auth_session_engine::mocks::MockIdpClient;
use auth_session_engine::notifier::BroadcastNotifier;
use auth_session_engine::persistence::VolatileSessionStore;

fn test_config() -> Config {
    Config::builder("https://idp.example.com", "client-1", "example.com").build()
}

#[tokio::test]
async fn existing_user_with_a_passkey_signs_in_via_webauthn() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("has-passkey@example.com", true, true, false, 0);

    let facade = CompositionFacade::new(
        test_config(),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("has-passkey@example.com").await.expect("check_user succeeds");
    assert_eq!(facade.snapshot().sign_in_state, SignInState::PasskeyPrompt);

    let challenge = facade
        .start_passkey_auth("has-passkey@example.com")
        .await
        .expect("challenge issued");
    assert!(!challenge.challenge_id.is_empty());

    facade
        .complete_passkey_auth("has-passkey@example.com", &challenge.challenge_id, serde_json::json!({"mock": true}))
        .await
        .expect("assertion verified");

    let snapshot = facade.snapshot();
    assert_eq!(snapshot.sign_in_state, SignInState::SignedIn);
    assert_eq!(snapshot.state, CoreState::Authenticated);
    assert_eq!(snapshot.access_token.as_deref(), Some("mock-passkey-access-token"));
}

#[tokio::test]
async fn cancelling_the_webauthn_prompt_returns_to_email_entry_without_an_error() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("has-passkey@example.com", true, true, false, 0);
    idp.fail_next_webauthn_verify("NotAllowedError: the operation was cancelled by the user");

    let facade = CompositionFacade::new(
        test_config(),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("has-passkey@example.com").await.expect("check_user succeeds");
    let challenge = facade
        .start_passkey_auth("has-passkey@example.com")
        .await
        .expect("challenge issued");

    let err = facade
        .complete_passkey_auth("has-passkey@example.com", &challenge.challenge_id, serde_json::json!({"mock": true}))
        .await
        .expect_err("cancellation surfaces as an error to the caller");
    assert_eq!(err.kind, auth_session_engine::error::ErrorKind::AuthCancelled);

    let snapshot = facade.snapshot();
    assert_eq!(snapshot.sign_in_state, SignInState::EmailEntry, "cancellation routes back to email entry");
    assert!(snapshot.ui_error.is_none(), "cancellation must not surface a ui_error");
    assert_eq!(snapshot.state, CoreState::Unauthenticated);
}

#[tokio::test]
async fn a_credential_not_found_failure_falls_back_to_pin_entry() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("has-passkey@example.com", true, true, false, 0);
    idp.fail_next_webauthn_verify("no credential found for this account");

    let facade = CompositionFacade::new(
        test_config(),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("has-passkey@example.com").await.expect("check_user succeeds");
    let challenge = facade
        .start_passkey_auth("has-passkey@example.com")
        .await
        .expect("challenge issued");

    let _ = facade
        .complete_passkey_auth("has-passkey@example.com", &challenge.challenge_id, serde_json::json!({"mock": true}))
        .await;

    assert_eq!(facade.snapshot().sign_in_state, SignInState::PinEntry);
}

#[tokio::test]
async fn a_signed_in_user_can_enroll_an_additional_passkey() {
    let idp = Arc::new(MockIdpClient::new());
    idp.set_check_user_exists("new@example.com", false, false, false, 0);
    idp.set_verify_email_code_success("new@example.com", "123456");

    let facade = CompositionFacade::new(
        test_config(),
        idp,
        Arc::new(VolatileSessionStore::new()),
        Arc::new(BroadcastNotifier::new(1)),
    );

    facade.check_user("new@example.com").await.expect("check_user succeeds");
    facade.send_email_code("new@example.com", true).await.expect("send succeeds");
    facade.verify_email_code("new@example.com", "123456").await.expect("verify succeeds");
    assert_eq!(facade.snapshot().sign_in_state, SignInState::SignedIn);

    let options = facade.register_passkey().await.expect("registration options issued");
    assert_eq!(facade.snapshot().sign_in_state, SignInState::PasskeyRegistration);
    assert!(!options.challenge_id.is_empty());

    let credential_id = facade
        .complete_passkey_registration(serde_json::json!({"mock": "attestation"}))
        .await
        .expect("registration completes");
    assert!(!credential_id.is_empty());
    assert_eq!(facade.snapshot().sign_in_state, SignInState::SignedIn);
}
