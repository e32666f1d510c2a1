//! Core data model: users, tokens, persisted session records, and the
//! auxiliary records the ceremony and discovery layers pass around.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Authentication method a session was established with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMethod {
    /// WebAuthn passkey.
    Passkey,
    /// One-time email code.
    EmailCode,
    /// Tokenized magic link.
    MagicLink,
    /// Legacy password flow, carried for completeness but not driven by the
    /// ceremony state machine.
    Password,
}

/// Identity record returned by the IdP and held by the Auth Core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Opaque identifier assigned by the IdP.
    pub id: String,
    /// Normalized (lowercased, trimmed) email address.
    pub email: String,
    /// Display name, if the IdP has one on file.
    pub name: Option<String>,
    /// Whether the user's email has been verified.
    pub email_verified: bool,
    /// Account creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last successful sign-in, if known.
    pub last_login_at: Option<DateTime<Utc>>,
    /// Opaque metadata passed through untouched.
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl User {
    /// Normalize an email the way every entry point into the engine must:
    /// trimmed and lowercased.
    #[must_use]
    pub fn normalize_email(email: &str) -> String {
        email.trim().to_lowercase()
    }
}

/// Authentication material held by the Auth Core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenSet {
    /// Opaque bearer token for the primary API.
    pub access_token: String,
    /// Opaque rotating refresh token, when the IdP issues one.
    pub refresh_token: Option<String>,
    /// Absolute expiry of `access_token`, in epoch milliseconds. `None`
    /// means the IdP did not report a duration; the engine then treats the
    /// token as non-expiring for scheduling purposes.
    pub expires_at: Option<i64>,
    /// When this token set was last rotated.
    pub refreshed_at: Option<i64>,
    /// Token for a downstream secondary data service, if the IdP issues one.
    pub secondary_token: Option<String>,
    /// Expiry of `secondary_token`.
    pub secondary_expires_at: Option<i64>,
}

/// What is actually written to the session persistence adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Identity fields carried alongside the tokens.
    pub user: User,
    /// The token material.
    pub tokens: TokenSet,
    /// How this session was established.
    pub auth_method: AuthMethod,
}

impl SessionRecord {
    /// Whether this record is expired per the load-time expiry rule: an
    /// `expires_at` in the past with no refresh token to recover with.
    #[must_use]
    pub fn is_expired(&self, now_millis: i64) -> bool {
        match (self.tokens.expires_at, &self.tokens.refresh_token) {
            (Some(expires_at), None) => expires_at < now_millis,
            _ => false,
        }
    }
}

/// Soft "returning user" hint surfaced to the UI, independent of an active
/// session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastUserRecord {
    /// Opaque identifier.
    pub id: String,
    /// Normalized email.
    pub email: String,
    /// Display name, if known.
    pub name: Option<String>,
    /// Last successful sign-in.
    pub last_login_at: DateTime<Utc>,
}

impl LastUserRecord {
    /// Last-user hints older than this are discarded rather than surfaced.
    pub const MAX_AGE_DAYS: i64 = 30;

    /// Whether this record has aged out and should be discarded.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_login_at) > chrono::Duration::days(Self::MAX_AGE_DAYS)
    }
}

/// Outcome of a `check_user` lookup, cached by the Discovery Cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryResult {
    /// Whether an account exists for the email.
    pub exists: bool,
    /// Whether the account has at least one registered passkey.
    pub has_passkey: bool,
    /// The account's opaque identifier, if it exists.
    pub user_id: Option<String>,
    /// Whether the account's email is verified.
    pub email_verified: Option<bool>,
    /// When the last email code was sent, if any.
    pub last_pin_sent_at: Option<DateTime<Utc>>,
    /// When the last-sent email code expires.
    pub last_pin_expiry: Option<DateTime<Utc>>,
}

impl DiscoveryResult {
    /// Whether the last-sent email code is still usable.
    #[must_use]
    pub fn has_valid_pin(&self, now: DateTime<Utc>) -> bool {
        self.last_pin_expiry.is_some_and(|expiry| expiry > now)
    }

    /// Minutes remaining on the last-sent email code, rounded up. `0` if
    /// there is no valid code.
    #[must_use]
    pub fn pin_remaining_minutes(&self, now: DateTime<Utc>) -> i64 {
        match self.last_pin_expiry {
            Some(expiry) if expiry > now => {
                let remaining_ms = expiry.signed_duration_since(now).num_milliseconds();
                (remaining_ms + 59_999) / 60_000
            }
            _ => 0,
        }
    }
}

/// A short-lived, opaque challenge nonce owned by the IdP. The engine never
/// interprets its contents, only stores and relays it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    /// Identifier the IdP uses to look up the challenge server-side.
    pub challenge_id: String,
    /// Opaque challenge material (base64 or JSON, as the IdP defines it).
    pub challenge: serde_json::Value,
    /// When this challenge expires.
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_user() -> User {
        User {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
            name: None,
            email_verified: true,
            created_at: Utc::now(),
            last_login_at: None,
            metadata: None,
        }
    }

    #[test]
    fn normalizes_email_casing_and_whitespace() {
        assert_eq!(User::normalize_email("  Foo@Example.COM "), "foo@example.com");
    }

    #[test]
    fn session_record_expired_only_without_refresh_token() {
        let expired_with_refresh = SessionRecord {
            user: sample_user(),
            tokens: TokenSet {
                access_token: "a".to_string(),
                refresh_token: Some("r".to_string()),
                expires_at: Some(0),
                refreshed_at: None,
                secondary_token: None,
                secondary_expires_at: None,
            },
            auth_method: AuthMethod::Passkey,
        };
        assert!(!expired_with_refresh.is_expired(1_000));

        let expired_without_refresh = SessionRecord {
            tokens: TokenSet {
                refresh_token: None,
                ..expired_with_refresh.tokens.clone()
            },
            ..expired_with_refresh
        };
        assert!(expired_without_refresh.is_expired(1_000));
    }

    #[test]
    fn discovery_result_pin_remaining_rounds_up() {
        let now = Utc::now();
        let result = DiscoveryResult {
            exists: true,
            has_passkey: false,
            user_id: Some("u1".to_string()),
            email_verified: Some(true),
            last_pin_sent_at: Some(now),
            last_pin_expiry: Some(now + chrono::Duration::seconds(61)),
        };
        assert!(result.has_valid_pin(now));
        assert_eq!(result.pin_remaining_minutes(now), 2);
    }

    #[test]
    fn last_user_record_staleness() {
        let old = LastUserRecord {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
            name: None,
            last_login_at: Utc::now() - chrono::Duration::days(31),
        };
        assert!(old.is_stale(Utc::now()));
    }
}
