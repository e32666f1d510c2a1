//! Sign-In Ceremony Store.
//!
//! Drives the UI-facing state machine of a single sign-in attempt. The
//! ceremony never holds tokens: every path that succeeds hands its
//! [`crate::idp::AuthResult`] back to the caller (the Composition Facade),
//! which is the only thing that talks to the Auth Core Store.

use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::watch;
use tracing::instrument;

use crate::config::{Config, SignInMode};
use crate::environment::CeremonyEnvironment;
use crate::error::{ErrorContext, ErrorKind, ErrorRecord};
use crate::events::EventPayload;
use crate::idp::{AuthResult, IdpClient, WebAuthnChallengeResponse, WebAuthnRegistrationOptions};
use crate::model::User;

/// The closed set of states a sign-in ceremony ever occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInState {
    /// Waiting for the user to submit an email address.
    EmailEntry,
    /// `check_user` resolved; routing to the right next state.
    UserChecked,
    /// Offering a passkey ceremony to a user with enrolled credentials.
    PasskeyPrompt,
    /// Waiting for a one-time email code.
    PinEntry,
    /// Enrolling a new passkey for an already-authenticated user.
    PasskeyRegistration,
    /// Driving first-time email verification for an unknown, registrable
    /// email.
    EmailVerification,
    /// Terminal success.
    SignedIn,
    /// Terminal failure; only [`CeremonyAction::Reset`] recovers from here.
    GeneralError,
}

/// Why a passkey ceremony failed, as distinguished by the transition table
/// (§4.8): cancellation routes back to email entry with no error surfaced,
/// a missing credential falls back to the email-code path, anything else
/// is a hard failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PasskeyFailureReason {
    /// The platform authenticator ceremony was dismissed or backed out of.
    UserCancelled,
    /// The account has no credential matching what the platform offered.
    CredentialNotFound,
    /// Any other WebAuthn or transport failure.
    Other,
}

fn classify_passkey_failure(err: &ErrorRecord) -> PasskeyFailureReason {
    if err.kind == ErrorKind::AuthCancelled {
        return PasskeyFailureReason::UserCancelled;
    }
    let lower = err.message.to_lowercase();
    if lower.contains("credential") && (lower.contains("not found") || lower.contains("no credential")) {
        return PasskeyFailureReason::CredentialNotFound;
    }
    PasskeyFailureReason::Other
}

/// The closed event alphabet the ceremony's transition function accepts.
#[derive(Debug, Clone, PartialEq)]
pub enum CeremonyAction {
    /// The user submitted (or is editing) an email address.
    EmailEntered {
        /// The submitted address, not yet normalized.
        email: String,
    },
    /// `check_user` resolved.
    UserChecked {
        /// Whether an account exists for the email.
        exists: bool,
        /// Whether the account has an enrolled passkey.
        has_passkey: bool,
        /// Whether a previously-sent code is still valid.
        has_valid_pin: bool,
        /// Minutes remaining on that code, if any.
        pin_remaining_minutes: i64,
    },
    /// An email code (or magic link) was sent.
    EmailSent,
    /// The platform reports a usable authenticator is present.
    PasskeyAvailable,
    /// The user submitted an email code.
    EmailCodeEntered {
        /// The submitted code.
        code: String,
    },
    /// The user chose the passkey path.
    PasskeySelected,
    /// A WebAuthn authentication ceremony succeeded.
    PasskeySuccess,
    /// A WebAuthn authentication ceremony failed.
    PasskeyFailed {
        /// Why it failed.
        reason: PasskeyFailureReason,
    },
    /// An email code was verified.
    PinVerified,
    /// An already-authenticated user asked to enroll a passkey.
    RegisterPasskey,
    /// A passkey enrollment ceremony succeeded.
    PasskeyRegistered {
        /// The newly enrolled credential's opaque identifier.
        credential_id: String,
    },
    /// The email is unknown and registrable; routing into enrollment.
    EmailVerificationRequired,
    /// A magic link (or email code, for terminology parity with
    /// `EmailVerification`) was verified.
    EmailVerified,
    /// Return to `EmailEntry`, clearing in-progress fields but keeping the
    /// submitted email.
    Reset,
    /// A non-retryable failure occurred; moves the ceremony to
    /// `GeneralError` from any state.
    Error {
        /// The classified failure.
        error: ErrorRecord,
    },
}

/// Observable Ceremony fields.
#[derive(Debug, Clone, PartialEq)]
pub struct CeremonyState {
    /// Current state in the closed set.
    pub sign_in_state: SignInState,
    /// The email address currently being used, normalized on submit.
    pub email: String,
    /// Optional display name collected during registration.
    pub full_name: Option<String>,
    /// The email code as currently typed.
    pub email_code: String,
    /// Whether an email code has been sent for the current attempt.
    pub email_code_sent: bool,
    /// Result of the last `check_user`, if any.
    pub user_exists: Option<bool>,
    /// Whether the checked account has an enrolled passkey.
    pub has_passkeys: bool,
    /// Whether the checked account has a still-valid email code.
    pub has_valid_pin: bool,
    /// Minutes remaining on that code.
    pub pin_remaining_minutes: i64,
    /// The last classified failure surfaced to the UI.
    pub ui_error: Option<ErrorRecord>,
    /// Whether a ceremony operation is in flight.
    pub loading: bool,
    /// Whether the platform reports a usable authenticator for conditional
    /// UI / autofill passkey prompts. Set by [`CeremonyAction::PasskeyAvailable`];
    /// never drives a state transition on its own.
    pub platform_authenticator_available: bool,
}

impl Default for CeremonyState {
    fn default() -> Self {
        Self {
            sign_in_state: SignInState::EmailEntry,
            email: String::new(),
            full_name: None,
            email_code: String::new(),
            email_code_sent: false,
            user_exists: None,
            has_passkeys: false,
            has_valid_pin: false,
            pin_remaining_minutes: 0,
            ui_error: None,
            loading: false,
            platform_authenticator_available: false,
        }
    }
}

/// Apply `action` to `state`, following the transition table of §4.8. This
/// is a pure function deliberately kept free of IdP calls or timestamps:
/// the orchestration methods on [`CeremonyStore`] are responsible for
/// calling out to the IdP and turning its response into the right action.
fn apply_transition(state: &mut CeremonyState, action: &CeremonyAction, config: &Config) {
    if matches!(action, CeremonyAction::Reset) {
        *state = CeremonyState {
            email: state.email.clone(),
            ..CeremonyState::default()
        };
        return;
    }

    if let CeremonyAction::Error { error } = action {
        if !error.retryable {
            state.ui_error = Some(error.clone());
            state.sign_in_state = SignInState::GeneralError;
            return;
        }
    }

    if matches!(action, CeremonyAction::PasskeyAvailable) {
        state.platform_authenticator_available = true;
        return;
    }

    state.sign_in_state = match (state.sign_in_state, action) {
        (SignInState::EmailEntry, CeremonyAction::EmailEntered { email }) => {
            state.email = email.clone();
            SignInState::EmailEntry
        }
        (
            SignInState::EmailEntry,
            CeremonyAction::UserChecked {
                exists,
                has_passkey,
                has_valid_pin,
                pin_remaining_minutes,
            },
        ) => {
            state.user_exists = Some(*exists);
            state.has_passkeys = *has_passkey;
            state.has_valid_pin = *has_valid_pin;
            state.pin_remaining_minutes = *pin_remaining_minutes;
            match (*exists, *has_passkey, *has_valid_pin) {
                (true, true, _) => SignInState::PasskeyPrompt,
                (true, false, true) => SignInState::PinEntry,
                (true, false, false) => SignInState::EmailVerification,
                (false, _, _) => match config.sign_in_mode {
                    SignInMode::LoginOnly => {
                        state.ui_error = Some(ErrorRecord::classify(
                            "user not found",
                            ErrorContext {
                                method: Some("check_user".to_string()),
                                email: Some(state.email.clone()),
                            },
                            None,
                        ));
                        SignInState::GeneralError
                    }
                    SignInMode::LoginOrRegister => SignInState::EmailVerification,
                },
            }
        }
        (SignInState::EmailVerification, CeremonyAction::EmailSent) => {
            state.email_code_sent = true;
            SignInState::PinEntry
        }
        (SignInState::PinEntry, CeremonyAction::EmailCodeEntered { code }) => {
            state.email_code = code.clone();
            SignInState::PinEntry
        }
        (SignInState::PinEntry, CeremonyAction::PinVerified) => SignInState::SignedIn,
        (SignInState::EmailEntry | SignInState::EmailVerification | SignInState::PinEntry, CeremonyAction::EmailVerified) => {
            SignInState::SignedIn
        }
        (SignInState::PasskeyPrompt, CeremonyAction::PasskeySuccess) => SignInState::SignedIn,
        (SignInState::PasskeyPrompt, CeremonyAction::PasskeyFailed { reason }) => match reason {
            PasskeyFailureReason::UserCancelled => {
                state.ui_error = None;
                SignInState::EmailEntry
            }
            PasskeyFailureReason::CredentialNotFound => SignInState::PinEntry,
            PasskeyFailureReason::Other => SignInState::GeneralError,
        },
        (SignInState::SignedIn, CeremonyAction::RegisterPasskey) => SignInState::PasskeyRegistration,
        (SignInState::PasskeyRegistration, CeremonyAction::PasskeyRegistered { .. }) => SignInState::SignedIn,
        (current, _) => current,
    };
}

/// Drives a single sign-in ceremony: the transition table plus the IdP
/// calls that feed it.
pub struct CeremonyStore<Idp: IdpClient> {
    state: StdMutex<CeremonyState>,
    env: CeremonyEnvironment<Idp>,
    watch_tx: watch::Sender<CeremonyState>,
}

impl<Idp: IdpClient> CeremonyStore<Idp> {
    /// Construct a store in the `EmailEntry` state.
    #[must_use]
    pub fn new(env: CeremonyEnvironment<Idp>) -> Arc<Self> {
        let (watch_tx, _rx) = watch::channel(CeremonyState::default());
        Arc::new(Self {
            state: StdMutex::new(CeremonyState::default()),
            env,
            watch_tx,
        })
    }

    /// Subscribe to state updates.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<CeremonyState> {
        self.watch_tx.subscribe()
    }

    /// Current observable state.
    #[must_use]
    pub fn snapshot(&self) -> CeremonyState {
        self.lock_state().clone()
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, CeremonyState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn apply(&self, action: CeremonyAction) -> CeremonyState {
        let mut state = self.lock_state();
        let config = self.env.config.load();
        apply_transition(&mut state, &action, &config);
        let snapshot = state.clone();
        drop(state);
        let _ = self.watch_tx.send(snapshot.clone());
        snapshot
    }

    fn mutate(&self, f: impl FnOnce(&mut CeremonyState)) -> CeremonyState {
        let mut state = self.lock_state();
        f(&mut state);
        let snapshot = state.clone();
        drop(state);
        let _ = self.watch_tx.send(snapshot.clone());
        snapshot
    }

    /// Set the in-progress email address without triggering a lookup.
    pub fn set_email(&self, email: impl Into<String>) -> CeremonyState {
        let email = email.into();
        self.mutate(|state| state.email = email.clone())
    }

    /// Set the display name collected during registration.
    pub fn set_full_name(&self, name: Option<String>) -> CeremonyState {
        self.mutate(|state| state.full_name = name.clone())
    }

    /// Set the in-progress email code.
    pub fn set_email_code(&self, code: impl Into<String>) -> CeremonyState {
        let code = code.into();
        self.mutate(|state| state.email_code = code.clone())
    }

    /// Set the loading flag the UI surfaces during an in-flight operation.
    pub fn set_loading(&self, loading: bool) -> CeremonyState {
        self.mutate(|state| state.loading = loading)
    }

    /// Mark whether an email code has been sent for the current attempt.
    pub fn set_email_code_sent(&self, sent: bool) -> CeremonyState {
        self.mutate(|state| state.email_code_sent = sent)
    }

    /// Record that the platform reports a usable authenticator, enabling
    /// conditional UI / autofill passkey prompts. Never drives a state
    /// transition on its own.
    pub fn mark_passkey_available(&self) -> CeremonyState {
        self.apply(CeremonyAction::PasskeyAvailable)
    }

    /// Clear a surfaced `ui_error` without resetting the rest of the
    /// ceremony.
    pub fn dismiss_ui_error(&self) -> CeremonyState {
        self.mutate(|state| state.ui_error = None)
    }

    /// Return to `EmailEntry`, keeping the submitted email.
    pub fn reset(&self) -> CeremonyState {
        self.apply(CeremonyAction::Reset)
    }

    /// Drop the cached discovery entry for `email`. Callers invalidate
    /// eagerly right after any operation that could change the user's
    /// existence or credential set, per the Discovery Cache's contract.
    pub fn invalidate_discovery(&self, email: &str) {
        self.env.discovery.invalidate(&User::normalize_email(email));
    }

    /// Drop every cached discovery entry, used when the signed-out user's
    /// email is not known to the caller.
    pub fn clear_discovery(&self) {
        self.env.discovery.clear_all();
    }

    /// Look up `email`, consulting the Discovery Cache first.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure; the ceremony moves to
    /// `GeneralError` for non-retryable failures per the transition table.
    #[instrument(skip(self))]
    pub async fn check_user(&self, email: &str) -> Result<(), ErrorRecord> {
        self.apply(CeremonyAction::EmailEntered { email: email.to_string() });
        self.env.events.emit(&EventPayload::SignInStarted { email: email.to_string() });

        let normalized = User::normalize_email(email);
        if let Some(cached) = self.env.discovery.get(&normalized) {
            self.dispatch_user_checked(&cached);
            return Ok(());
        }

        match self.env.idp.check_user(email).await {
            Ok(result) => {
                self.env.discovery.set(&normalized, result.clone());
                self.dispatch_user_checked(&result);
                Ok(())
            }
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                self.env.events.emit(&EventPayload::SignInError { error: err.clone() });
                Err(err)
            }
        }
    }

    fn dispatch_user_checked(&self, result: &crate::model::DiscoveryResult) {
        let now = chrono::Utc::now();
        self.apply(CeremonyAction::UserChecked {
            exists: result.exists,
            has_passkey: result.has_passkey,
            has_valid_pin: result.has_valid_pin(now),
            pin_remaining_minutes: result.pin_remaining_minutes(now),
        });
    }

    /// Request a one-time email code.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn send_email_code(&self, email: &str, create_if_missing: bool) -> Result<(), ErrorRecord> {
        match self.env.idp.send_email_code(email, create_if_missing).await {
            Ok(_) => {
                self.apply(CeremonyAction::EmailSent);
                Ok(())
            }
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Verify a previously-sent email code. On success, returns the
    /// session for the caller to hand to the Auth Core Store.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn verify_email_code(&self, email: &str, code: &str) -> Result<AuthResult, ErrorRecord> {
        self.apply(CeremonyAction::EmailCodeEntered { code: code.to_string() });
        match self.env.idp.verify_email_code(email, code).await {
            Ok(result) => {
                self.env.discovery.invalidate(&User::normalize_email(email));
                self.apply(CeremonyAction::PinVerified);
                self.env.events.emit(&EventPayload::SignInSuccess { user: result.user.clone() });
                Ok(result)
            }
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                self.env.events.emit(&EventPayload::SignInError { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Begin a WebAuthn authentication ceremony.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn begin_passkey_auth(&self, email: &str) -> Result<WebAuthnChallengeResponse, ErrorRecord> {
        self.apply(CeremonyAction::PasskeySelected);
        match self.env.idp.webauthn_challenge(email).await {
            Ok(challenge) => Ok(challenge),
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Complete a WebAuthn authentication ceremony with the platform's
    /// assertion.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn complete_passkey_auth(
        &self,
        email: &str,
        challenge_id: &str,
        assertion: serde_json::Value,
    ) -> Result<AuthResult, ErrorRecord> {
        let credential_id = assertion
            .get("id")
            .and_then(serde_json::Value::as_str)
            .unwrap_or_default()
            .to_string();
        match self.env.idp.webauthn_verify(email, challenge_id, assertion).await {
            Ok(result) => {
                self.apply(CeremonyAction::PasskeySuccess);
                self.env.events.emit(&EventPayload::SignInSuccess { user: result.user.clone() });
                self.env.events.emit(&EventPayload::PasskeyUsed { credential_id });
                Ok(result)
            }
            Err(err) => {
                let reason = classify_passkey_failure(&err);
                self.apply(CeremonyAction::PasskeyFailed { reason });
                if reason != PasskeyFailureReason::UserCancelled {
                    self.env.events.emit(&EventPayload::SignInError { error: err.clone() });
                }
                Err(err)
            }
        }
    }

    /// Begin enrolling a passkey for the already-authenticated user.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure. Invalid in any state but
    /// `SignedIn`: callers should check [`CeremonyState::sign_in_state`]
    /// first, per the invariant that registration is reachable only from
    /// `SignedIn`.
    pub async fn begin_passkey_registration(&self, access_token: &str) -> Result<WebAuthnRegistrationOptions, ErrorRecord> {
        self.apply(CeremonyAction::RegisterPasskey);
        self.env.events.emit(&EventPayload::RegistrationStarted);
        match self.env.idp.webauthn_register_options(access_token).await {
            Ok(options) => Ok(options),
            Err(err) => {
                self.env.events.emit(&EventPayload::RegistrationError { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Finish enrolling a passkey with the platform's attestation.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn complete_passkey_registration(
        &self,
        access_token: &str,
        attestation: serde_json::Value,
    ) -> Result<String, ErrorRecord> {
        match self.env.idp.webauthn_register_finish(access_token, attestation).await {
            Ok(credential_id) => {
                let email = self.snapshot().email;
                if !email.is_empty() {
                    self.env.discovery.invalidate(&User::normalize_email(&email));
                }
                self.apply(CeremonyAction::PasskeyRegistered {
                    credential_id: credential_id.clone(),
                });
                self.env.events.emit(&EventPayload::PasskeyCreated {
                    credential_id: credential_id.clone(),
                });
                self.env.events.emit(&EventPayload::RegistrationSuccess {
                    credential_id: credential_id.clone(),
                });
                Ok(credential_id)
            }
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                self.env.events.emit(&EventPayload::RegistrationError { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Send a magic link.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn send_magic_link(&self, email: &str, redirect_url: Option<&str>) -> Result<(), ErrorRecord> {
        match self.env.idp.send_magic_link(email, redirect_url).await {
            Ok(_) => {
                self.apply(CeremonyAction::EmailSent);
                Ok(())
            }
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                Err(err)
            }
        }
    }

    /// Verify a magic link token, typically on the page load it redirects
    /// to rather than mid-ceremony.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn verify_magic_link(&self, token: &str) -> Result<AuthResult, ErrorRecord> {
        match self.env.idp.verify_magic_link(token).await {
            Ok(result) => {
                self.apply(CeremonyAction::EmailVerified);
                self.env.events.emit(&EventPayload::SignInSuccess { user: result.user.clone() });
                Ok(result)
            }
            Err(err) => {
                self.apply(CeremonyAction::Error { error: err.clone() });
                self.env.events.emit(&EventPayload::SignInError { error: err.clone() });
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mode: SignInMode) -> Config {
        Config::builder("https://idp.example.com", "client-1", "example.com")
            .with_sign_in_mode(mode)
            .build()
    }

    #[test]
    fn existing_user_with_passkey_routes_to_passkey_prompt() {
        let mut state = CeremonyState::default();
        apply_transition(
            &mut state,
            &CeremonyAction::UserChecked {
                exists: true,
                has_passkey: true,
                has_valid_pin: false,
                pin_remaining_minutes: 0,
            },
            &config(SignInMode::LoginOrRegister),
        );
        assert_eq!(state.sign_in_state, SignInState::PasskeyPrompt);
    }

    #[test]
    fn existing_user_without_passkey_but_valid_pin_routes_to_pin_entry() {
        let mut state = CeremonyState::default();
        apply_transition(
            &mut state,
            &CeremonyAction::UserChecked {
                exists: true,
                has_passkey: false,
                has_valid_pin: true,
                pin_remaining_minutes: 4,
            },
            &config(SignInMode::LoginOrRegister),
        );
        assert_eq!(state.sign_in_state, SignInState::PinEntry);
    }

    #[test]
    fn unknown_email_in_login_only_mode_is_a_general_error() {
        let mut state = CeremonyState::default();
        apply_transition(
            &mut state,
            &CeremonyAction::UserChecked {
                exists: false,
                has_passkey: false,
                has_valid_pin: false,
                pin_remaining_minutes: 0,
            },
            &config(SignInMode::LoginOnly),
        );
        assert_eq!(state.sign_in_state, SignInState::GeneralError);
        assert!(state.ui_error.is_some());
    }

    #[test]
    fn unknown_email_in_login_or_register_mode_routes_to_email_verification() {
        let mut state = CeremonyState::default();
        apply_transition(
            &mut state,
            &CeremonyAction::UserChecked {
                exists: false,
                has_passkey: false,
                has_valid_pin: false,
                pin_remaining_minutes: 0,
            },
            &config(SignInMode::LoginOrRegister),
        );
        assert_eq!(state.sign_in_state, SignInState::EmailVerification);
    }

    #[test]
    fn passkey_cancellation_returns_to_email_entry_without_an_error() {
        let mut state = CeremonyState::default();
        state.sign_in_state = SignInState::PasskeyPrompt;
        apply_transition(
            &mut state,
            &CeremonyAction::PasskeyFailed {
                reason: PasskeyFailureReason::UserCancelled,
            },
            &config(SignInMode::LoginOrRegister),
        );
        assert_eq!(state.sign_in_state, SignInState::EmailEntry);
        assert!(state.ui_error.is_none());
    }

    #[test]
    fn passkey_credential_not_found_falls_back_to_pin_entry() {
        let mut state = CeremonyState::default();
        state.sign_in_state = SignInState::PasskeyPrompt;
        apply_transition(
            &mut state,
            &CeremonyAction::PasskeyFailed {
                reason: PasskeyFailureReason::CredentialNotFound,
            },
            &config(SignInMode::LoginOrRegister),
        );
        assert_eq!(state.sign_in_state, SignInState::PinEntry);
    }

    #[test]
    fn passkey_registration_is_reachable_only_from_signed_in() {
        let mut state = CeremonyState::default();
        state.sign_in_state = SignInState::EmailEntry;
        apply_transition(&mut state, &CeremonyAction::RegisterPasskey, &config(SignInMode::LoginOrRegister));
        assert_eq!(state.sign_in_state, SignInState::EmailEntry, "no-op outside SignedIn");

        state.sign_in_state = SignInState::SignedIn;
        apply_transition(&mut state, &CeremonyAction::RegisterPasskey, &config(SignInMode::LoginOrRegister));
        assert_eq!(state.sign_in_state, SignInState::PasskeyRegistration);
    }

    #[test]
    fn reset_clears_in_progress_fields_but_keeps_email() {
        let mut state = CeremonyState::default();
        state.email = "a@b.com".to_string();
        state.email_code = "123456".to_string();
        state.sign_in_state = SignInState::GeneralError;
        state.ui_error = Some(ErrorRecord::classify("boom", ErrorContext::default(), None));

        apply_transition(&mut state, &CeremonyAction::Reset, &config(SignInMode::LoginOrRegister));

        assert_eq!(state.sign_in_state, SignInState::EmailEntry);
        assert_eq!(state.email, "a@b.com");
        assert!(state.email_code.is_empty());
        assert!(state.ui_error.is_none());
    }

    #[test]
    fn any_state_moves_to_general_error_on_non_retryable_failure() {
        let mut state = CeremonyState::default();
        state.sign_in_state = SignInState::PinEntry;
        let error = ErrorRecord::classify("user not found", ErrorContext::default(), None);
        assert!(!error.retryable);
        apply_transition(&mut state, &CeremonyAction::Error { error }, &config(SignInMode::LoginOrRegister));
        assert_eq!(state.sign_in_state, SignInState::GeneralError);
    }

    #[test]
    fn transition_is_deterministic_for_a_fixed_action_sequence() {
        let actions = [
            CeremonyAction::EmailEntered { email: "a@b.com".to_string() },
            CeremonyAction::UserChecked {
                exists: true,
                has_passkey: false,
                has_valid_pin: false,
                pin_remaining_minutes: 0,
            },
            CeremonyAction::EmailSent,
            CeremonyAction::EmailCodeEntered { code: "000000".to_string() },
            CeremonyAction::PinVerified,
        ];
        let run = || {
            let mut state = CeremonyState::default();
            for action in &actions {
                apply_transition(&mut state, action, &config(SignInMode::LoginOrRegister));
            }
            state.sign_in_state
        };
        assert_eq!(run(), SignInState::SignedIn);
        assert_eq!(run(), run(), "identical action sequences must reach the same state");
    }
}
