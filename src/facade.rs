//! Composition Facade.
//!
//! The only surface a UI layer touches: a single merged observable
//! projection plus an action surface that forwards to the Auth Core Store
//! and Sign-In Ceremony Store it privately owns. Neither store is exported
//! from this crate; callers interact with the facade and the `tokio::sync`
//! primitives it exposes for subscribing to the merged state.

use std::sync::{Arc, Mutex as StdMutex};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::auth_core::{AuthCoreSnapshot, AuthCoreStore, CoreState};
use crate::ceremony::{CeremonyState, CeremonyStore, SignInState};
use crate::config::Config;
use crate::discovery::DiscoveryCache;
use crate::environment::{AuthCoreEnvironment, CeremonyEnvironment};
use crate::error::{EngineError, ErrorRecord, Result};
use crate::events::EventBus;
use crate::idp::{AuthResult, IdpClient, WebAuthnChallengeResponse, WebAuthnRegistrationOptions};
use crate::model::{AuthMethod, User};
use crate::notifier::{Notifier, NotifierMessage, NotifierSubscription};
use crate::persistence::SessionPersistence;

/// Merged observable projection surfaced to the UI layer (§4.9).
///
/// Every field here is read-only from the UI's perspective except through
/// the facade's named setters; there is no field-level write access.
#[derive(Debug, Clone, PartialEq)]
pub struct FacadeSnapshot {
    /// `Unauthenticated` or `Authenticated`, from the Auth Core.
    pub state: CoreState,
    /// Current sign-in ceremony state.
    pub sign_in_state: SignInState,
    /// The signed-in user, when authenticated.
    pub user: Option<User>,
    /// Current bearer token.
    pub access_token: Option<String>,
    /// Current rotating refresh token.
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token`, epoch milliseconds.
    pub expires_at: Option<i64>,
    /// When the token set was last rotated.
    pub refreshed_at: Option<i64>,
    /// Secondary-service token, if any.
    pub secondary_token: Option<String>,
    /// Expiry of the secondary token.
    pub secondary_expires_at: Option<i64>,
    /// The Auth Core's last classified failure, kept for diagnostics even
    /// when never surfaced to the UI.
    pub api_error: Option<ErrorRecord>,
    /// The ceremony's last classified failure, surfaced to the UI.
    pub ui_error: Option<ErrorRecord>,
    /// Whether the signed-in user has at least one registered passkey.
    pub passkeys_enabled: bool,
    /// The email address currently being used in the ceremony.
    pub email: String,
    /// Whether a ceremony operation is in flight.
    pub loading: bool,
    /// Whether an email code has been sent for the current attempt.
    pub email_code_sent: bool,
    /// Display name collected during registration.
    pub full_name: Option<String>,
    /// The email code as currently typed.
    pub email_code: String,
    /// Result of the last `check_user`, if any.
    pub user_exists: Option<bool>,
    /// Whether the checked account has an enrolled passkey.
    pub has_passkeys: bool,
    /// Whether the checked account has a still-valid email code.
    pub has_valid_pin: bool,
    /// Minutes remaining on that code.
    pub pin_remaining_minutes: i64,
    /// Whether conditional UI / autofill passkey prompting is active,
    /// toggled by [`CompositionFacade::set_conditional_auth_active`].
    pub conditional_auth_active: bool,
    /// Whether the platform reports a usable authenticator.
    pub platform_authenticator_available: bool,
}

fn merge(core: &AuthCoreSnapshot, ceremony: &CeremonyState, conditional_auth_active: bool) -> FacadeSnapshot {
    FacadeSnapshot {
        state: core.state,
        sign_in_state: ceremony.sign_in_state,
        user: core.user.clone(),
        access_token: core.access_token.clone(),
        refresh_token: core.refresh_token.clone(),
        expires_at: core.expires_at,
        refreshed_at: core.refreshed_at,
        secondary_token: core.secondary_token.clone(),
        secondary_expires_at: core.secondary_expires_at,
        api_error: core.api_error.clone(),
        ui_error: ceremony.ui_error.clone(),
        passkeys_enabled: core.passkeys_enabled,
        email: ceremony.email.clone(),
        loading: ceremony.loading,
        email_code_sent: ceremony.email_code_sent,
        full_name: ceremony.full_name.clone(),
        email_code: ceremony.email_code.clone(),
        user_exists: ceremony.user_exists,
        has_passkeys: ceremony.has_passkeys,
        has_valid_pin: ceremony.has_valid_pin,
        pin_remaining_minutes: ceremony.pin_remaining_minutes,
        conditional_auth_active,
        platform_authenticator_available: ceremony.platform_authenticator_available,
    }
}

/// The only surface a UI layer is meant to hold onto.
///
/// Owns an `AuthCoreStore` and a `CeremonyStore`, a shared swappable
/// `Config`, and three background tasks that keep a merged `watch` channel
/// current: one forwarding Auth Core snapshots, one forwarding Ceremony
/// snapshots, and one draining the Cross-Context Notifier into the Auth
/// Core's external-update handlers. The tasks are aborted when the facade
/// is dropped.
pub struct CompositionFacade<Idp: IdpClient + 'static, N: Notifier + 'static> {
    auth_core: Arc<AuthCoreStore<Idp>>,
    ceremony: Arc<CeremonyStore<Idp>>,
    config: Arc<ArcSwap<Config>>,
    notifier: Arc<N>,
    events: Arc<EventBus>,
    conditional_auth_active: Arc<StdMutex<bool>>,
    watch_tx: watch::Sender<FacadeSnapshot>,
    background: Vec<JoinHandle<()>>,
}

impl<Idp: IdpClient + 'static, N: Notifier + 'static> Drop for CompositionFacade<Idp, N> {
    fn drop(&mut self) {
        for handle in &self.background {
            handle.abort();
        }
    }
}

impl<Idp: IdpClient + 'static, N: Notifier + 'static> CompositionFacade<Idp, N> {
    /// Assemble a facade from its collaborators: the starting `Config`, a
    /// typed IdP client, a session persistence adapter, and a Cross-Context
    /// Notifier. Restores a persisted session on construction if one is
    /// present and not expired.
    #[must_use]
    pub fn new(config: Config, idp: Arc<Idp>, persistence: Arc<dyn SessionPersistence>, notifier: Arc<N>) -> Arc<Self> {
        let events = Arc::new(EventBus::new());
        let discovery = Arc::new(DiscoveryCache::new(config.discovery_cache_ttl));
        let config_swap = Arc::new(ArcSwap::from_pointee(config));

        let notifier_for_publish = Arc::clone(&notifier);
        let publish: Arc<dyn Fn(NotifierMessage) + Send + Sync> = Arc::new(move |message| notifier_for_publish.publish(message));

        let auth_core_env = AuthCoreEnvironment {
            idp: Arc::clone(&idp),
            persistence,
            publish,
            events: Arc::clone(&events),
            config: Arc::clone(&config_swap),
        };
        let auth_core = AuthCoreStore::new(auth_core_env);

        let ceremony_env = CeremonyEnvironment {
            idp,
            events: Arc::clone(&events),
            discovery,
            config: Arc::clone(&config_swap),
        };
        let ceremony = CeremonyStore::new(ceremony_env);

        let conditional_auth_active = Arc::new(StdMutex::new(false));
        let initial = merge(&auth_core.snapshot(), &ceremony.snapshot(), false);
        let (watch_tx, _rx) = watch::channel(initial);

        let mut background = Vec::with_capacity(3);
        background.push(spawn_core_forwarder(Arc::clone(&auth_core), Arc::clone(&ceremony), Arc::clone(&conditional_auth_active), watch_tx.clone()));
        background.push(spawn_ceremony_forwarder(Arc::clone(&auth_core), Arc::clone(&ceremony), Arc::clone(&conditional_auth_active), watch_tx.clone()));
        background.push(spawn_notifier_drain(Arc::clone(&auth_core), notifier.subscribe()));

        Arc::new(Self {
            auth_core,
            ceremony,
            config: config_swap,
            notifier,
            events,
            conditional_auth_active,
            watch_tx,
            background,
        })
    }

    /// Subscribe to the merged projection.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<FacadeSnapshot> {
        self.watch_tx.subscribe()
    }

    /// Current merged projection.
    #[must_use]
    pub fn snapshot(&self) -> FacadeSnapshot {
        let conditional_auth_active = *self.conditional_auth_active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        merge(&self.auth_core.snapshot(), &self.ceremony.snapshot(), conditional_auth_active)
    }

    fn publish(&self) {
        let conditional_auth_active = *self.conditional_auth_active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let _ = self.watch_tx.send(merge(&self.auth_core.snapshot(), &self.ceremony.snapshot(), conditional_auth_active));
    }

    /// Subscribe directly to engine lifecycle events (sign-in, sign-out,
    /// refresh, passkey/registration events), shared by both stores.
    #[must_use]
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    /// Set the in-progress email address.
    pub fn set_email(&self, email: impl Into<String>) {
        self.ceremony.set_email(email);
        self.publish();
    }

    /// Set the display name collected during registration.
    pub fn set_full_name(&self, name: Option<String>) {
        self.ceremony.set_full_name(name);
        self.publish();
    }

    /// Set the in-progress email code.
    pub fn set_email_code(&self, code: impl Into<String>) {
        self.ceremony.set_email_code(code);
        self.publish();
    }

    /// Set the ceremony's loading flag.
    pub fn set_loading(&self, loading: bool) {
        self.ceremony.set_loading(loading);
        self.publish();
    }

    /// Mark whether an email code has been sent.
    pub fn set_email_code_sent(&self, sent: bool) {
        self.ceremony.set_email_code_sent(sent);
        self.publish();
    }

    /// Toggle conditional UI / autofill passkey prompting. Purely a UI-side
    /// flag the facade tracks on behalf of the embedder; it does not drive
    /// any ceremony transition.
    pub fn set_conditional_auth_active(&self, active: bool) {
        *self.conditional_auth_active.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = active;
        self.publish();
    }

    /// Record that the platform reports a usable authenticator.
    pub fn mark_passkey_available(&self) {
        self.ceremony.mark_passkey_available();
        self.publish();
    }

    /// Look up `email` and route the ceremony to the right next state.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn check_user(&self, email: &str) -> std::result::Result<(), ErrorRecord> {
        let result = self.ceremony.check_user(email).await;
        self.publish();
        result
    }

    /// Request a one-time email code.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn send_email_code(&self, email: &str, create_if_missing: bool) -> std::result::Result<(), ErrorRecord> {
        let result = self.ceremony.send_email_code(email, create_if_missing).await;
        self.publish();
        result
    }

    /// Verify a previously-sent email code and adopt the resulting session
    /// into the Auth Core Store.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn verify_email_code(&self, email: &str, code: &str) -> std::result::Result<(), ErrorRecord> {
        let result = self.ceremony.verify_email_code(email, code).await;
        self.adopt_auth_result(result, AuthMethod::EmailCode)
    }

    /// Begin a WebAuthn authentication ceremony.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn start_passkey_auth(&self, email: &str) -> std::result::Result<WebAuthnChallengeResponse, ErrorRecord> {
        let result = self.ceremony.begin_passkey_auth(email).await;
        self.publish();
        result
    }

    /// Complete a WebAuthn authentication ceremony and adopt the resulting
    /// session into the Auth Core Store.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn complete_passkey_auth(&self, email: &str, challenge_id: &str, assertion: serde_json::Value) -> std::result::Result<(), ErrorRecord> {
        let result = self.ceremony.complete_passkey_auth(email, challenge_id, assertion).await;
        self.adopt_auth_result(result, AuthMethod::Passkey)
    }

    /// Begin enrolling a passkey for the already-authenticated user, using
    /// the Auth Core's current access token.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure, or surfaces whatever the
    /// underlying ceremony call returns if called outside `SignedIn`.
    pub async fn register_passkey(&self) -> std::result::Result<WebAuthnRegistrationOptions, ErrorRecord> {
        let access_token = self.auth_core.snapshot().access_token.unwrap_or_default();
        let result = self.ceremony.begin_passkey_registration(&access_token).await;
        self.publish();
        result
    }

    /// Finish enrolling a passkey with the platform's attestation, using
    /// the Auth Core's current access token.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn complete_passkey_registration(&self, attestation: serde_json::Value) -> std::result::Result<String, ErrorRecord> {
        let access_token = self.auth_core.snapshot().access_token.unwrap_or_default();
        let result = self.ceremony.complete_passkey_registration(&access_token, attestation).await;
        self.publish();
        result
    }

    /// Send a magic link.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn send_magic_link(&self, email: &str, redirect_url: Option<&str>) -> std::result::Result<(), ErrorRecord> {
        let result = self.ceremony.send_magic_link(email, redirect_url).await;
        self.publish();
        result
    }

    /// Verify a magic link token and adopt the resulting session into the
    /// Auth Core Store.
    ///
    /// # Errors
    ///
    /// Returns the classified IdP failure.
    pub async fn verify_magic_link(&self, token: &str) -> std::result::Result<(), ErrorRecord> {
        let result = self.ceremony.verify_magic_link(token).await;
        self.adopt_auth_result(result, AuthMethod::MagicLink)
    }

    fn adopt_auth_result(&self, result: std::result::Result<AuthResult, ErrorRecord>, auth_method: AuthMethod) -> std::result::Result<(), ErrorRecord> {
        match result {
            Ok(auth_result) => {
                self.auth_core.update_tokens(auth_result.user, auth_result.tokens, auth_method);
                self.publish();
                Ok(())
            }
            Err(err) => {
                self.publish();
                Err(err)
            }
        }
    }

    /// Sign out of both stores.
    pub async fn sign_out(&self) {
        let email = self.auth_core.snapshot().user.map(|user| user.email);
        self.auth_core.sign_out().await;
        self.ceremony.reset();
        match email {
            Some(email) => self.ceremony.invalidate_discovery(&email),
            None => self.ceremony.clear_discovery(),
        }
        self.publish();
    }

    /// Reset the ceremony to `EmailEntry`, keeping the submitted email.
    pub fn reset(&self) {
        self.ceremony.reset();
        self.publish();
    }

    /// Clear a surfaced `ui_error`.
    pub fn dismiss_ui_error(&self) {
        self.ceremony.dismiss_ui_error();
        self.publish();
    }

    /// Update the mutable subset of `Config` (branding, feature flags,
    /// `sign_in_mode`) on a live engine.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ConfigImmutable`] if `patch` differs from the
    /// current config on `api_base_url`, `client_id`, or `domain`; those
    /// fields require constructing a new facade.
    pub fn update_config(&self, patch: Config) -> Result<()> {
        let current = self.config.load();
        if patch.api_base_url != current.api_base_url || patch.client_id != current.client_id || patch.domain != current.domain {
            return Err(EngineError::ConfigImmutable);
        }
        self.config.store(Arc::new(patch));
        Ok(())
    }

    /// Current configuration snapshot.
    #[must_use]
    pub fn config(&self) -> Config {
        (**self.config.load()).clone()
    }

    /// The Cross-Context Notifier this facade publishes through and drains
    /// incoming messages from, for hosts that need to construct a second
    /// facade sharing the same origin.
    #[must_use]
    pub fn notifier(&self) -> Arc<N> {
        Arc::clone(&self.notifier)
    }
}

fn spawn_core_forwarder<Idp: IdpClient + 'static>(
    auth_core: Arc<AuthCoreStore<Idp>>,
    ceremony: Arc<CeremonyStore<Idp>>,
    conditional_auth_active: Arc<StdMutex<bool>>,
    watch_tx: watch::Sender<FacadeSnapshot>,
) -> JoinHandle<()> {
    let mut rx = auth_core.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let core_snapshot = rx.borrow_and_update().clone();
            let conditional = *conditional_auth_active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = watch_tx.send(merge(&core_snapshot, &ceremony.snapshot(), conditional));
        }
    })
}

fn spawn_ceremony_forwarder<Idp: IdpClient + 'static>(
    auth_core: Arc<AuthCoreStore<Idp>>,
    ceremony: Arc<CeremonyStore<Idp>>,
    conditional_auth_active: Arc<StdMutex<bool>>,
    watch_tx: watch::Sender<FacadeSnapshot>,
) -> JoinHandle<()> {
    let mut rx = ceremony.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let ceremony_snapshot = rx.borrow_and_update().clone();
            let conditional = *conditional_auth_active.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let _ = watch_tx.send(merge(&auth_core.snapshot(), &ceremony_snapshot, conditional));
        }
    })
}

fn spawn_notifier_drain<Idp: IdpClient + 'static, S: NotifierSubscription + 'static>(auth_core: Arc<AuthCoreStore<Idp>>, mut subscription: S) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(message) = subscription.recv().await {
            match message {
                NotifierMessage::SessionUpdated { record, .. } => auth_core.apply_external_update(record),
                NotifierMessage::SessionCleared { .. } => auth_core.apply_external_clear(),
            }
        }
    })
}
