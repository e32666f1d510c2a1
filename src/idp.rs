//! IdP Client.
//!
//! Typed access to the upstream identity provider's HTTP API. Each method
//! validates its inputs, sends a request, decodes the response, and maps
//! transport or IdP error bodies into the classified error taxonomy
//! ([`crate::error::ErrorRecord`]) before surfacing them to callers.
//!
//! # Implementation Notes
//!
//! - Use `reqwest` for the transport and `serde` for the wire types. The
//!   wire contract is `camelCase` on the JSON boundary (§6); every method
//!   here converts to and from the engine's `snake_case` domain types at
//!   that boundary rather than leaking wire shapes into the rest of the
//!   crate.
//! - Every method that could change a user's existence or credential set
//!   (`verify_email_code`, `webauthn_register_finish`) MUST invalidate the
//!   caller's Discovery Cache entry for that email on success.

use serde::{Deserialize, Serialize};

use crate::error::{ErrorContext, ErrorRecord};
use crate::model::{DiscoveryResult, TokenSet, User};

/// Result of a successful authentication exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthResult {
    /// The authenticated user.
    pub user: User,
    /// The issued token set.
    pub tokens: TokenSet,
}

/// Outcome of sending an email code or magic link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResult {
    /// Whether the IdP reports the message was sent.
    pub sent: bool,
    /// When the sent code or link expires, as epoch milliseconds.
    pub expires_at: i64,
}

/// A WebAuthn challenge issued by the IdP for an authentication ceremony.
#[derive(Debug, Clone, PartialEq)]
pub struct WebAuthnChallengeResponse {
    /// Opaque challenge identifier.
    pub challenge_id: String,
    /// Opaque challenge bytes (base64).
    pub challenge: String,
    /// Relying-party identifier the credential must match.
    pub rp_id: String,
    /// Credential IDs the client may offer, base64-encoded.
    pub allow_credentials: Vec<String>,
    /// Ceremony timeout in milliseconds.
    pub timeout: u32,
    /// User-verification requirement string as the IdP defines it.
    pub user_verification: String,
}

/// Options for starting a passkey registration ceremony.
#[derive(Debug, Clone, PartialEq)]
pub struct WebAuthnRegistrationOptions {
    /// Opaque challenge identifier.
    pub challenge_id: String,
    /// Opaque challenge bytes (base64).
    pub challenge: String,
    /// Relying-party identifier.
    pub rp_id: String,
}

/// New token material returned by a refresh.
#[derive(Debug, Clone, PartialEq)]
pub struct RefreshResult {
    /// New access token.
    pub access_token: String,
    /// New refresh token, if the IdP rotated it. `None` means the existing
    /// refresh token remains valid (invariant I4).
    pub refresh_token: Option<String>,
    /// Seconds until `access_token` expires, if reported.
    pub expires_in: Option<i64>,
    /// New secondary-service token, if any.
    pub secondary_token: Option<String>,
    /// Expiry of `secondary_token`, as epoch milliseconds.
    pub secondary_expires_at: Option<i64>,
}

/// IdP health report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Fully operational.
    Healthy,
    /// Partially operational.
    Degraded,
    /// Not operational.
    Unhealthy,
}

/// Typed access to every endpoint of the upstream contract.
///
/// Implementations are `Send + Sync` so a single client can be shared
/// across contexts behind an `Arc`.
pub trait IdpClient: Send + Sync {
    /// Look up whether an account exists for `email` and what credentials
    /// it has enrolled.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ErrorRecord`] on transport or IdP failure.
    #[allow(async_fn_in_trait)]
    async fn check_user(&self, email: &str) -> Result<DiscoveryResult, ErrorRecord>;

    /// Request a one-time email code for `email`.
    ///
    /// # Errors
    ///
    /// A [`crate::error::ErrorKind::RateLimited`] result carries
    /// `retry_after` when the IdP reports one; callers MUST honor it.
    #[allow(async_fn_in_trait)]
    async fn send_email_code(&self, email: &str, create_if_missing: bool) -> Result<SendResult, ErrorRecord>;

    /// Verify a previously-sent email code.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ErrorKind::InvalidCode`] for a wrong or
    /// expired code.
    #[allow(async_fn_in_trait)]
    async fn verify_email_code(&self, email: &str, code: &str) -> Result<AuthResult, ErrorRecord>;

    /// Request a WebAuthn authentication challenge for `email`.
    ///
    /// # Errors
    ///
    /// Returns a classified error if the account has no enrolled
    /// credentials or the IdP fails to issue a challenge.
    #[allow(async_fn_in_trait)]
    async fn webauthn_challenge(&self, email: &str) -> Result<WebAuthnChallengeResponse, ErrorRecord>;

    /// Verify a WebAuthn authentication assertion.
    ///
    /// # Errors
    ///
    /// Returns [`crate::error::ErrorKind::AuthCancelled`] if the assertion
    /// indicates the user backed out, [`crate::error::ErrorKind::AuthFailed`]
    /// for any other verification failure.
    #[allow(async_fn_in_trait)]
    async fn webauthn_verify(
        &self,
        email: &str,
        challenge_id: &str,
        assertion: serde_json::Value,
    ) -> Result<AuthResult, ErrorRecord>;

    /// Request registration options for enrolling a new passkey. Requires
    /// an authenticated access token.
    ///
    /// # Errors
    ///
    /// Returns a classified error on transport or IdP failure.
    #[allow(async_fn_in_trait)]
    async fn webauthn_register_options(
        &self,
        access_token: &str,
    ) -> Result<WebAuthnRegistrationOptions, ErrorRecord>;

    /// Finish a passkey registration ceremony.
    ///
    /// On success, callers MUST invalidate the Discovery Cache entry for
    /// the owning email.
    ///
    /// # Errors
    ///
    /// Returns a classified error on transport or attestation failure.
    #[allow(async_fn_in_trait)]
    async fn webauthn_register_finish(
        &self,
        access_token: &str,
        attestation: serde_json::Value,
    ) -> Result<String, ErrorRecord>;

    /// Exchange a refresh token for new token material.
    ///
    /// # Errors
    ///
    /// Returns a classified error; callers implement the retry/rotation
    /// policy described by the refresh protocol, not this method.
    #[allow(async_fn_in_trait)]
    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResult, ErrorRecord>;

    /// Best-effort sign-out. Callers clear local state regardless of the
    /// outcome.
    ///
    /// # Errors
    ///
    /// Returns a classified error; callers are expected to ignore it.
    #[allow(async_fn_in_trait)]
    async fn sign_out(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), ErrorRecord>;

    /// Send a magic link to `email`.
    ///
    /// # Errors
    ///
    /// Returns a classified error on transport or IdP failure.
    #[allow(async_fn_in_trait)]
    async fn send_magic_link(&self, email: &str, redirect_url: Option<&str>) -> Result<SendResult, ErrorRecord>;

    /// Verify a magic link token.
    ///
    /// # Errors
    ///
    /// Returns a classified error on transport or IdP failure.
    #[allow(async_fn_in_trait)]
    async fn verify_magic_link(&self, token: &str) -> Result<AuthResult, ErrorRecord>;

    /// Check IdP health.
    ///
    /// # Errors
    ///
    /// Returns a classified error on transport failure.
    #[allow(async_fn_in_trait)]
    async fn health(&self) -> Result<HealthStatus, ErrorRecord>;
}

/// Validate an email address against the external contract's shape rule:
/// non-empty, at most 254 characters, contains exactly one `@` with
/// non-empty local and domain parts.
///
/// # Errors
///
/// Returns an [`ErrorRecord`] of kind
/// [`crate::error::ErrorKind::InvalidInput`] when the shape rule is
/// violated.
pub fn validate_email(email: &str) -> Result<(), ErrorRecord> {
    let invalid = || {
        ErrorRecord::classify(
            "invalid email address",
            ErrorContext {
                method: Some("validate_email".to_string()),
                email: Some(email.to_string()),
            },
            None,
        )
    };
    if email.is_empty() || email.len() > 254 {
        return Err(invalid());
    }
    let Some((local, domain)) = email.split_once('@') else {
        return Err(invalid());
    };
    if local.is_empty() || domain.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    Ok(())
}

// --- Wire-level DTOs (§6, camelCase on the boundary only) -----------------

#[derive(Serialize)]
struct CheckUserRequest<'a> {
    email: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckUserResponse {
    exists: bool,
    has_passkey: bool,
    user_id: Option<String>,
    email_verified: Option<bool>,
    last_pin_sent_at: Option<chrono::DateTime<chrono::Utc>>,
    last_pin_expiry: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<CheckUserResponse> for DiscoveryResult {
    fn from(wire: CheckUserResponse) -> Self {
        Self {
            exists: wire.exists,
            has_passkey: wire.has_passkey,
            user_id: wire.user_id,
            email_verified: wire.email_verified,
            last_pin_sent_at: wire.last_pin_sent_at,
            last_pin_expiry: wire.last_pin_expiry,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SendEmailCodeRequest<'a> {
    email: &'a str,
    create_if_missing: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendResponse {
    sent: bool,
    expires_at: i64,
}

impl From<SendResponse> for SendResult {
    fn from(wire: SendResponse) -> Self {
        Self {
            sent: wire.sent,
            expires_at: wire.expires_at,
        }
    }
}

#[derive(Serialize)]
struct VerifyEmailCodeRequest<'a> {
    email: &'a str,
    code: &'a str,
}

#[derive(Deserialize)]
struct WireUser {
    id: String,
    email: String,
    name: Option<String>,
    #[serde(rename = "emailVerified", default)]
    email_verified: bool,
    #[serde(rename = "createdAt", default = "chrono::Utc::now")]
    created_at: chrono::DateTime<chrono::Utc>,
    #[serde(rename = "lastLoginAt", default)]
    last_login_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl From<WireUser> for User {
    fn from(wire: WireUser) -> Self {
        Self {
            id: wire.id,
            email: User::normalize_email(&wire.email),
            name: wire.name,
            email_verified: wire.email_verified,
            created_at: wire.created_at,
            last_login_at: wire.last_login_at,
            metadata: None,
        }
    }
}

#[derive(Deserialize)]
struct AuthResponse {
    #[allow(dead_code)]
    success: Option<bool>,
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    #[serde(default)]
    secondary_token: Option<String>,
    #[serde(default)]
    secondary_expires_at: Option<i64>,
    user: WireUser,
}

impl AuthResponse {
    fn into_auth_result(self, auth_method: crate::model::AuthMethod) -> AuthResult {
        let now = chrono::Utc::now();
        let refreshed_at = now.timestamp_millis();
        let expires_at = self.expires_in.map(|secs| now.timestamp_millis() + secs * 1000);
        let mut user: User = self.user.into();
        user.last_login_at = Some(now);
        let _ = auth_method;
        AuthResult {
            user,
            tokens: TokenSet {
                access_token: self.access_token,
                refresh_token: self.refresh_token,
                expires_at,
                refreshed_at: Some(refreshed_at),
                secondary_token: self.secondary_token,
                secondary_expires_at: self.secondary_expires_at,
            },
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WebAuthnChallengeWire {
    challenge: String,
    rp_id: String,
    allow_credentials: Vec<String>,
    timeout: u32,
    user_verification: String,
    challenge_id: String,
}

impl From<WebAuthnChallengeWire> for WebAuthnChallengeResponse {
    fn from(wire: WebAuthnChallengeWire) -> Self {
        Self {
            challenge_id: wire.challenge_id,
            challenge: wire.challenge,
            rp_id: wire.rp_id,
            allow_credentials: wire.allow_credentials,
            timeout: wire.timeout,
            user_verification: wire.user_verification,
        }
    }
}

#[derive(Deserialize)]
struct RefreshResponseWire {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    secondary_token: Option<String>,
    secondary_expires_at: Option<i64>,
}

impl From<RefreshResponseWire> for RefreshResult {
    fn from(wire: RefreshResponseWire) -> Self {
        Self {
            access_token: wire.access_token,
            refresh_token: wire.refresh_token,
            expires_in: wire.expires_in,
            secondary_token: wire.secondary_token,
            secondary_expires_at: wire.secondary_expires_at,
        }
    }
}

/// `reqwest`-backed [`IdpClient`] implementation.
///
/// Applies the configured `app_code` path prefix (if any) and the input
/// validation rules of the external contract before any request leaves the
/// process.
pub struct HttpIdpClient {
    http: reqwest::Client,
    base_url: String,
    app_code: Option<String>,
}

impl HttpIdpClient {
    /// Construct a client against `base_url`, optionally path-prefixed by
    /// `app_code`.
    #[must_use]
    pub fn new(base_url: impl Into<String>, app_code: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            app_code,
        }
    }

    fn url(&self, path: &str) -> String {
        match &self.app_code {
            Some(app_code) => format!("{}/{app_code}{path}", self.base_url),
            None => format!("{}{path}", self.base_url),
        }
    }

    async fn post_json<Req: Serialize, Res: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        method: &str,
        body: &Req,
    ) -> Result<Res, ErrorRecord> {
        let context = |email: Option<String>| ErrorContext {
            method: Some(method.to_string()),
            email,
        };
        let response = self
            .http
            .post(self.url(path))
            .json(body)
            .send()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context(None), None))?;

        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(std::time::Duration::from_secs);

        if !response.status().is_success() {
            let status = response.status();
            let body_text = response.text().await.unwrap_or_default();
            return Err(ErrorRecord::classify(
                &format!("{status} {body_text}"),
                context(None),
                retry_after,
            ));
        }

        response
            .json::<Res>()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context(None), None))
    }
}

impl IdpClient for HttpIdpClient {
    async fn check_user(&self, email: &str) -> Result<DiscoveryResult, ErrorRecord> {
        validate_email(email)?;
        let wire: CheckUserResponse = self
            .post_json("/auth/check-user", "check_user", &CheckUserRequest { email })
            .await?;
        Ok(wire.into())
    }

    async fn send_email_code(&self, email: &str, create_if_missing: bool) -> Result<SendResult, ErrorRecord> {
        validate_email(email)?;
        let wire: SendResponse = self
            .post_json(
                "/auth/send-email-code",
                "send_email_code",
                &SendEmailCodeRequest { email, create_if_missing },
            )
            .await?;
        Ok(wire.into())
    }

    async fn verify_email_code(&self, email: &str, code: &str) -> Result<AuthResult, ErrorRecord> {
        validate_email(email)?;
        let wire: AuthResponse = self
            .post_json(
                "/auth/verify-email-code",
                "verify_email_code",
                &VerifyEmailCodeRequest { email, code },
            )
            .await?;
        Ok(wire.into_auth_result(crate::model::AuthMethod::EmailCode))
    }

    async fn webauthn_challenge(&self, email: &str) -> Result<WebAuthnChallengeResponse, ErrorRecord> {
        validate_email(email)?;
        let wire: WebAuthnChallengeWire = self
            .post_json("/auth/webauthn/challenge", "webauthn_challenge", &CheckUserRequest { email })
            .await?;
        Ok(wire.into())
    }

    async fn webauthn_verify(
        &self,
        email: &str,
        challenge_id: &str,
        assertion: serde_json::Value,
    ) -> Result<AuthResult, ErrorRecord> {
        validate_email(email)?;
        #[derive(Serialize)]
        struct Body<'a> {
            email: &'a str,
            #[serde(rename = "challengeId")]
            challenge_id: &'a str,
            #[serde(rename = "credentialResponse")]
            credential_response: serde_json::Value,
        }
        let wire: AuthResponse = self
            .post_json(
                "/auth/webauthn/verify",
                "webauthn_verify",
                &Body {
                    email,
                    challenge_id,
                    credential_response: assertion,
                },
            )
            .await?;
        Ok(wire.into_auth_result(crate::model::AuthMethod::Passkey))
    }

    async fn webauthn_register_options(&self, access_token: &str) -> Result<WebAuthnRegistrationOptions, ErrorRecord> {
        let context = ErrorContext {
            method: Some("webauthn_register_options".to_string()),
            email: None,
        };
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Wire {
            challenge_id: String,
            challenge: String,
            rp_id: String,
        }
        let response = self
            .http
            .post(self.url("/auth/webauthn/register-options"))
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context.clone(), None))?;
        if !response.status().is_success() {
            return Err(ErrorRecord::classify(&response.status().to_string(), context, None));
        }
        let wire: Wire = response
            .json()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context, None))?;
        Ok(WebAuthnRegistrationOptions {
            challenge_id: wire.challenge_id,
            challenge: wire.challenge,
            rp_id: wire.rp_id,
        })
    }

    async fn webauthn_register_finish(&self, access_token: &str, attestation: serde_json::Value) -> Result<String, ErrorRecord> {
        let context = ErrorContext {
            method: Some("webauthn_register_finish".to_string()),
            email: None,
        };
        #[derive(Deserialize)]
        struct Response {
            #[serde(rename = "credentialId")]
            credential_id: String,
        }
        let response = self
            .http
            .post(self.url("/auth/webauthn/register-finish"))
            .bearer_auth(access_token)
            .json(&attestation)
            .send()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context.clone(), None))?;
        if !response.status().is_success() {
            return Err(ErrorRecord::classify(&response.status().to_string(), context, None));
        }
        let parsed: Response = response
            .json()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context, None))?;
        Ok(parsed.credential_id)
    }

    async fn refresh_token(&self, refresh_token: &str) -> Result<RefreshResult, ErrorRecord> {
        #[derive(Serialize)]
        struct Body<'a> {
            refresh_token: &'a str,
        }
        let wire: RefreshResponseWire = self.post_json("/auth/refresh", "refresh_token", &Body { refresh_token }).await?;
        Ok(wire.into())
    }

    async fn sign_out(&self, access_token: &str, refresh_token: Option<&str>) -> Result<(), ErrorRecord> {
        #[derive(Serialize)]
        struct Body<'a> {
            access_token: &'a str,
            refresh_token: Option<&'a str>,
        }
        #[derive(Deserialize)]
        struct Response {
            #[allow(dead_code)]
            success: bool,
        }
        let _: Response = self
            .post_json(
                "/auth/signout",
                "sign_out",
                &Body {
                    access_token,
                    refresh_token,
                },
            )
            .await?;
        Ok(())
    }

    async fn send_magic_link(&self, email: &str, redirect_url: Option<&str>) -> Result<SendResult, ErrorRecord> {
        validate_email(email)?;
        if let Some(url) = redirect_url {
            if !url.starts_with("https://") {
                return Err(ErrorRecord::classify(
                    "invalid redirect url: must be https",
                    ErrorContext {
                        method: Some("send_magic_link".to_string()),
                        email: Some(email.to_string()),
                    },
                    None,
                ));
            }
        }
        #[derive(Serialize)]
        struct Body<'a> {
            email: &'a str,
            #[serde(rename = "redirectUrl", skip_serializing_if = "Option::is_none")]
            redirect_url: Option<&'a str>,
        }
        let wire: SendResponse = self
            .post_json("/auth/signin/magic-link", "send_magic_link", &Body { email, redirect_url })
            .await?;
        Ok(wire.into())
    }

    async fn verify_magic_link(&self, token: &str) -> Result<AuthResult, ErrorRecord> {
        #[derive(Serialize)]
        struct Body<'a> {
            token: &'a str,
        }
        let wire: AuthResponse = self.post_json("/auth/verify-magic-link", "verify_magic_link", &Body { token }).await?;
        Ok(wire.into_auth_result(crate::model::AuthMethod::MagicLink))
    }

    async fn health(&self) -> Result<HealthStatus, ErrorRecord> {
        let context = ErrorContext {
            method: Some("health".to_string()),
            email: None,
        };
        #[derive(Deserialize)]
        struct Response {
            status: HealthStatus,
        }
        let response = self
            .http
            .get(self.url("/health"))
            .send()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context.clone(), None))?;
        let parsed: Response = response
            .json()
            .await
            .map_err(|err| ErrorRecord::classify(&err.to_string(), context, None))?;
        Ok(parsed.status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_email_accepts_simple_address() {
        assert!(validate_email("a@b.com").is_ok());
    }

    #[test]
    fn validate_email_rejects_missing_at() {
        assert!(validate_email("not-an-email").is_err());
    }

    #[test]
    fn validate_email_rejects_empty_domain() {
        assert!(validate_email("a@").is_err());
    }

    #[test]
    fn validate_email_rejects_overlong_address() {
        let long = format!("{}@b.com", "a".repeat(300));
        assert!(validate_email(&long).is_err());
    }

    #[test]
    fn check_user_response_deserializes_camel_case_wire_shape() {
        let json = serde_json::json!({
            "exists": true,
            "hasPasskey": true,
            "userId": "u1",
            "emailVerified": true,
            "lastPinSentAt": null,
            "lastPinExpiry": null,
        });
        let wire: CheckUserResponse = serde_json::from_value(json).expect("valid wire shape");
        let result: DiscoveryResult = wire.into();
        assert!(result.exists);
        assert!(result.has_passkey);
        assert_eq!(result.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn auth_response_normalizes_user_email_on_conversion() {
        let json = serde_json::json!({
            "success": true,
            "access_token": "AT1",
            "refresh_token": "RT1",
            "expires_in": 3600,
            "user": {
                "id": "u1",
                "email": "  Alice@Example.COM ",
                "emailVerified": true,
            },
        });
        let wire: AuthResponse = serde_json::from_value(json).expect("valid wire shape");
        let result = wire.into_auth_result(crate::model::AuthMethod::EmailCode);
        assert_eq!(result.user.email, "alice@example.com");
        assert_eq!(result.tokens.access_token, "AT1");
        assert_eq!(result.tokens.refresh_token.as_deref(), Some("RT1"));
    }
}
