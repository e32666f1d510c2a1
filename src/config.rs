//! Engine configuration.
//!
//! Configuration is provided by the embedding application, not hardcoded.
//! `Config` is built once via [`ConfigBuilder`] and handed to
//! [`crate::facade::CompositionFacade::new`]; the fields that are safe to
//! change on a live engine are updated through
//! [`crate::facade::CompositionFacade::update_config`] instead of mutating
//! this struct directly.

use std::time::Duration;

/// How the sign-in ceremony treats an email with no existing account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignInMode {
    /// Unknown emails are rejected with `user_not_found`.
    LoginOnly,
    /// Unknown emails are routed into email-code enrollment.
    LoginOrRegister,
}

/// Session persistence durability class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageClass {
    /// Survives process restarts (backed by a host-provided `KvStore`).
    Durable,
    /// Process-lifetime only.
    Volatile,
}

/// Storage-related configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Durability class.
    pub storage_type: StorageClass,
    /// Idle timeout for a persisted session, if the host wants one enforced
    /// on top of the load-time expiry check.
    pub session_timeout: Option<Duration>,
    /// Whether the last-user hint persists across restarts regardless of
    /// `storage_type`.
    pub persistent_sessions: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: StorageClass::Volatile,
            session_timeout: None,
            persistent_sessions: true,
        }
    }
}

/// Top-level engine configuration.
///
/// `api_base_url`, `client_id`, and `domain` are immutable once the engine
/// is constructed; attempting to change them via `update_config` on a live
/// store returns [`crate::error::EngineError::ConfigImmutable`].
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Root URL of the upstream IdP.
    pub api_base_url: String,
    /// Client identifier registered with the IdP.
    pub client_id: String,
    /// Relying-party identifier used for WebAuthn (`domain`).
    pub domain: String,
    /// Whether passkey ceremonies are offered.
    pub enable_passkeys: bool,
    /// Whether magic-link ceremonies are offered.
    pub enable_magic_links: bool,
    /// How an unrecognized email is handled.
    pub sign_in_mode: SignInMode,
    /// Optional path prefix for app-scoped endpoints (e.g. `"acme"` turns
    /// `/auth/verify-email-code` into `/acme/verify-email-code`).
    pub app_code: Option<String>,
    /// How many seconds before `expires_at` the scheduler should rotate the
    /// access token. Clamped to a minimum of 60 seconds (see invariant I2
    /// of the refresh protocol).
    ///
    /// Default: 300 seconds.
    pub refresh_before: Duration,
    /// Session persistence configuration.
    pub storage: StorageConfig,
    /// Opaque branding blob passed through to the UI untouched.
    pub branding: Option<serde_json::Value>,
    /// How long a `check_user` result stays valid in the Discovery Cache.
    /// Must stay below the IdP's own email-code validity window.
    ///
    /// Default: 2 minutes.
    pub discovery_cache_ttl: Duration,
}

impl Config {
    /// The refresh scheduler will never rotate less than this many seconds
    /// before the previous rotation, regardless of `refresh_before`
    /// (invariant I2).
    pub const MIN_REFRESH_INTERVAL: Duration = Duration::from_secs(60);

    /// Begin building a [`Config`] for the given required fields.
    #[must_use]
    pub fn builder(api_base_url: impl Into<String>, client_id: impl Into<String>, domain: impl Into<String>) -> ConfigBuilder {
        ConfigBuilder::new(api_base_url, client_id, domain)
    }
}

/// Builder for [`Config`].
///
/// # Examples
///
/// ```
/// use auth_session_engine::config::{Config, SignInMode};
///
/// let config = Config::builder("https://idp.example.com", "client-1", "example.com")
///     .with_sign_in_mode(SignInMode::LoginOrRegister)
///     .build();
/// assert_eq!(config.sign_in_mode, SignInMode::LoginOrRegister);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    api_base_url: String,
    client_id: String,
    domain: String,
    enable_passkeys: bool,
    enable_magic_links: bool,
    sign_in_mode: SignInMode,
    app_code: Option<String>,
    refresh_before: Duration,
    storage: StorageConfig,
    branding: Option<serde_json::Value>,
    discovery_cache_ttl: Duration,
}

impl ConfigBuilder {
    /// Start a builder with the three required fields and the documented
    /// defaults for everything else.
    #[must_use]
    pub fn new(api_base_url: impl Into<String>, client_id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            api_base_url: api_base_url.into(),
            client_id: client_id.into(),
            domain: domain.into(),
            enable_passkeys: true,
            enable_magic_links: true,
            sign_in_mode: SignInMode::LoginOrRegister,
            app_code: None,
            refresh_before: Duration::from_secs(300),
            storage: StorageConfig::default(),
            branding: None,
            discovery_cache_ttl: Duration::from_secs(120),
        }
    }

    /// Enable or disable passkey ceremonies.
    #[must_use]
    pub const fn with_passkeys(mut self, enabled: bool) -> Self {
        self.enable_passkeys = enabled;
        self
    }

    /// Enable or disable magic-link ceremonies.
    #[must_use]
    pub const fn with_magic_links(mut self, enabled: bool) -> Self {
        self.enable_magic_links = enabled;
        self
    }

    /// Set how unrecognized emails are handled.
    ///
    /// - ✅ `LoginOrRegister` gives a smoother first-run experience: an
    ///   unknown email walks straight into enrollment.
    /// - ⚠️ `LoginOnly` is the right choice when accounts are provisioned
    ///   out-of-band and a "no such user" response should never imply an
    ///   invitation to register.
    #[must_use]
    pub const fn with_sign_in_mode(mut self, mode: SignInMode) -> Self {
        self.sign_in_mode = mode;
        self
    }

    /// Set the app-scoped endpoint path prefix.
    #[must_use]
    pub fn with_app_code(mut self, app_code: impl Into<String>) -> Self {
        self.app_code = Some(app_code.into());
        self
    }

    /// Set how early to rotate the access token before `expires_at`.
    /// Clamped to [`Config::MIN_REFRESH_INTERVAL`] at build time.
    #[must_use]
    pub const fn with_refresh_before(mut self, duration: Duration) -> Self {
        self.refresh_before = duration;
        self
    }

    /// Set the storage configuration.
    #[must_use]
    pub fn with_storage(mut self, storage: StorageConfig) -> Self {
        self.storage = storage;
        self
    }

    /// Set an opaque branding blob.
    #[must_use]
    pub fn with_branding(mut self, branding: serde_json::Value) -> Self {
        self.branding = Some(branding);
        self
    }

    /// Set the Discovery Cache TTL.
    #[must_use]
    pub const fn with_discovery_cache_ttl(mut self, ttl: Duration) -> Self {
        self.discovery_cache_ttl = ttl;
        self
    }

    /// Build the final [`Config`].
    #[must_use]
    pub fn build(self) -> Config {
        let refresh_before = self.refresh_before.max(Config::MIN_REFRESH_INTERVAL);
        Config {
            api_base_url: self.api_base_url,
            client_id: self.client_id,
            domain: self.domain,
            enable_passkeys: self.enable_passkeys,
            enable_magic_links: self.enable_magic_links,
            sign_in_mode: self.sign_in_mode,
            app_code: self.app_code,
            refresh_before,
            storage: self.storage,
            branding: self.branding,
            discovery_cache_ttl: self.discovery_cache_ttl,
        }
    }
}
