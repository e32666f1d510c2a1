//! In-memory fakes for the engine's collaborator traits, gated behind the
//! `test-utils` feature.
//!
//! Only [`MockIdpClient`] is provided here: [`crate::persistence::VolatileSessionStore`]
//! and [`crate::persistence::InMemoryKvStore`] already serve as in-memory
//! fakes for persistence, and [`crate::notifier::BroadcastNotifier`] already
//! is the in-process notifier, so none of those need a second, test-only
//! implementation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use crate::error::{ErrorContext, ErrorRecord};
use crate::idp::{AuthResult, HealthStatus, IdpClient, RefreshResult, SendResult, WebAuthnChallengeResponse, WebAuthnRegistrationOptions};
use crate::model::{DiscoveryResult, TokenSet, User};

fn sample_user(email: &str) -> User {
    let normalized = User::normalize_email(email);
    User {
        id: format!("user-{normalized}"),
        email: normalized,
        name: None,
        email_verified: true,
        created_at: chrono::Utc::now(),
        last_login_at: None,
        metadata: None,
    }
}

fn sample_tokens(access_token: impl Into<String>) -> TokenSet {
    let now = chrono::Utc::now().timestamp_millis();
    TokenSet {
        access_token: access_token.into(),
        refresh_token: Some("mock-refresh-token".to_string()),
        expires_at: Some(now + 3_600_000),
        refreshed_at: Some(now),
        secondary_token: None,
        secondary_expires_at: None,
    }
}

fn unknown_error(method: &str) -> ErrorRecord {
    ErrorRecord::classify(
        "no fixture configured for this call",
        ErrorContext {
            method: Some(method.to_string()),
            email: None,
        },
        None,
    )
}

#[derive(Default)]
struct Scripted {
    check_user: HashMap<String, DiscoveryResult>,
    email_codes: HashMap<(String, String), AuthResult>,
    refresh_results: std::collections::VecDeque<std::result::Result<RefreshResult, ErrorRecord>>,
    refresh_delay: Option<Duration>,
    refresh_calls: u32,
    sign_out_calls: u32,
    webauthn_verify_error: Option<ErrorRecord>,
}

/// Scriptable in-memory [`IdpClient`].
///
/// Every method consults a table of canned responses configured through
/// the `set_*` methods. A call with no matching fixture returns a
/// classified `unknown` failure rather than succeeding silently, so a test
/// that forgets to script a dependency fails loudly instead of passing by
/// accident.
pub struct MockIdpClient {
    inner: Arc<StdMutex<Scripted>>,
}

impl Default for MockIdpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockIdpClient {
    /// Construct an empty mock with no fixtures configured.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(StdMutex::new(Scripted::default())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Scripted> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Script the response of `check_user(email)`. `has_valid_pin` and
    /// `pin_remaining_minutes` are reflected as a `last_pin_expiry`
    /// `pin_remaining_minutes` minutes in the future when `has_valid_pin`
    /// is `true`.
    pub fn set_check_user_exists(&self, email: &str, exists: bool, has_passkey: bool, has_valid_pin: bool, pin_remaining_minutes: i64) {
        let now = chrono::Utc::now();
        let result = DiscoveryResult {
            exists,
            has_passkey,
            user_id: exists.then(|| format!("user-{}", User::normalize_email(email))),
            email_verified: exists.then_some(true),
            last_pin_sent_at: has_valid_pin.then_some(now),
            last_pin_expiry: has_valid_pin.then(|| now + chrono::Duration::minutes(pin_remaining_minutes)),
        };
        self.lock().check_user.insert(User::normalize_email(email), result);
    }

    /// Script `verify_email_code(email, code)` to succeed, issuing a fresh
    /// token set for a sample user.
    pub fn set_verify_email_code_success(&self, email: &str, code: &str) {
        let result = AuthResult {
            user: sample_user(email),
            tokens: sample_tokens("mock-access-token"),
        };
        self.lock().email_codes.insert((User::normalize_email(email), code.to_string()), result);
    }

    /// Queue the next `refresh_token` outcome. Calls past the end of the
    /// queue repeat the last queued outcome.
    pub fn push_refresh_result(&self, outcome: std::result::Result<RefreshResult, ErrorRecord>) {
        self.lock().refresh_results.push_back(outcome);
    }

    /// Delay every `refresh_token` call by `delay`, to give concurrent
    /// callers a window in which to race the single-flight gate.
    pub fn set_refresh_delay(&self, delay: Duration) {
        self.lock().refresh_delay = Some(delay);
    }

    /// Number of `refresh_token` calls actually dispatched to this mock.
    /// Used to assert the single-flight invariant: concurrent
    /// `refresh_tokens` callers must drive this to at most 1 per round.
    #[must_use]
    pub fn refresh_call_count(&self) -> u32 {
        self.lock().refresh_calls
    }

    /// Number of `sign_out` calls dispatched to this mock.
    #[must_use]
    pub fn sign_out_call_count(&self) -> u32 {
        self.lock().sign_out_calls
    }

    /// Make the next `webauthn_verify` call fail, classified from `message`
    /// (e.g. `"NotAllowedError: cancelled by user"` for a cancellation).
    pub fn fail_next_webauthn_verify(&self, message: &str) {
        let error = ErrorRecord::classify(
            message,
            ErrorContext {
                method: Some("webauthn_verify".to_string()),
                email: None,
            },
            None,
        );
        self.lock().webauthn_verify_error = Some(error);
    }
}

impl IdpClient for MockIdpClient {
    async fn check_user(&self, email: &str) -> std::result::Result<DiscoveryResult, ErrorRecord> {
        let normalized = User::normalize_email(email);
        let fixture = self.lock().check_user.get(&normalized).cloned();
        Ok(fixture.unwrap_or(DiscoveryResult {
            exists: false,
            has_passkey: false,
            user_id: None,
            email_verified: None,
            last_pin_sent_at: None,
            last_pin_expiry: None,
        }))
    }

    async fn send_email_code(&self, _email: &str, _create_if_missing: bool) -> std::result::Result<SendResult, ErrorRecord> {
        Ok(SendResult {
            sent: true,
            expires_at: chrono::Utc::now().timestamp_millis() + 600_000,
        })
    }

    async fn verify_email_code(&self, email: &str, code: &str) -> std::result::Result<AuthResult, ErrorRecord> {
        let key = (User::normalize_email(email), code.to_string());
        self.lock()
            .email_codes
            .get(&key)
            .cloned()
            .ok_or_else(|| {
                ErrorRecord::classify(
                    "invalid code",
                    ErrorContext {
                        method: Some("verify_email_code".to_string()),
                        email: Some(email.to_string()),
                    },
                    None,
                )
            })
    }

    async fn webauthn_challenge(&self, _email: &str) -> std::result::Result<WebAuthnChallengeResponse, ErrorRecord> {
        Ok(WebAuthnChallengeResponse {
            challenge_id: "mock-challenge-id".to_string(),
            challenge: "mock-challenge-bytes".to_string(),
            rp_id: "example.com".to_string(),
            allow_credentials: vec!["mock-credential-id".to_string()],
            timeout: 60_000,
            user_verification: "preferred".to_string(),
        })
    }

    async fn webauthn_verify(&self, email: &str, _challenge_id: &str, _assertion: serde_json::Value) -> std::result::Result<AuthResult, ErrorRecord> {
        if let Some(error) = self.lock().webauthn_verify_error.take() {
            return Err(error);
        }
        Ok(AuthResult {
            user: sample_user(email),
            tokens: sample_tokens("mock-passkey-access-token"),
        })
    }

    async fn webauthn_register_options(&self, _access_token: &str) -> std::result::Result<WebAuthnRegistrationOptions, ErrorRecord> {
        Ok(WebAuthnRegistrationOptions {
            challenge_id: "mock-registration-challenge-id".to_string(),
            challenge: "mock-registration-challenge-bytes".to_string(),
            rp_id: "example.com".to_string(),
        })
    }

    async fn webauthn_register_finish(&self, _access_token: &str, _attestation: serde_json::Value) -> std::result::Result<String, ErrorRecord> {
        Ok("mock-new-credential-id".to_string())
    }

    async fn refresh_token(&self, _refresh_token: &str) -> std::result::Result<RefreshResult, ErrorRecord> {
        let delay = {
            let mut scripted = self.lock();
            scripted.refresh_calls += 1;
            scripted.refresh_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut scripted = self.lock();
        let outcome = if scripted.refresh_results.len() > 1 {
            scripted.refresh_results.pop_front()
        } else {
            scripted.refresh_results.front().cloned()
        };
        let refresh_calls = scripted.refresh_calls;
        outcome.unwrap_or_else(|| {
            Ok(RefreshResult {
                access_token: format!("mock-rotated-access-token-{refresh_calls}"),
                refresh_token: Some(format!("mock-rotated-refresh-token-{refresh_calls}")),
                expires_in: Some(3600),
                secondary_token: None,
                secondary_expires_at: None,
            })
        })
    }

    async fn sign_out(&self, _access_token: &str, _refresh_token: Option<&str>) -> std::result::Result<(), ErrorRecord> {
        self.lock().sign_out_calls += 1;
        Ok(())
    }

    async fn send_magic_link(&self, _email: &str, _redirect_url: Option<&str>) -> std::result::Result<SendResult, ErrorRecord> {
        Ok(SendResult {
            sent: true,
            expires_at: chrono::Utc::now().timestamp_millis() + 900_000,
        })
    }

    async fn verify_magic_link(&self, _token: &str) -> std::result::Result<AuthResult, ErrorRecord> {
        Ok(AuthResult {
            user: sample_user("magic-link-user@example.com"),
            tokens: sample_tokens("mock-magic-link-access-token"),
        })
    }

    async fn health(&self) -> std::result::Result<HealthStatus, ErrorRecord> {
        Ok(HealthStatus::Healthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn check_user_defaults_to_unknown_account() {
        let idp = MockIdpClient::new();
        let result = idp.check_user("nobody@example.com").await.expect("mock never errors on check_user");
        assert!(!result.exists);
    }

    #[tokio::test]
    async fn verify_email_code_rejects_unscripted_code() {
        let idp = MockIdpClient::new();
        idp.set_verify_email_code_success("a@b.com", "123456");
        let err = idp.verify_email_code("a@b.com", "000000").await.unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::InvalidCode);
    }

    #[tokio::test]
    async fn refresh_call_count_tracks_dispatched_requests() {
        let idp = MockIdpClient::new();
        assert_eq!(idp.refresh_call_count(), 0);
        idp.refresh_token("rt").await.expect("default fixture succeeds");
        idp.refresh_token("rt").await.expect("default fixture succeeds");
        assert_eq!(idp.refresh_call_count(), 2);
    }

    #[test]
    fn unknown_error_is_classified_unknown() {
        let err = unknown_error("some_method");
        assert_eq!(err.kind, crate::error::ErrorKind::Unknown);
    }
}
