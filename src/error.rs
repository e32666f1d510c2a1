//! Error classification.
//!
//! The engine talks to an upstream identity provider whose failure modes are
//! heterogeneous: transport errors from `reqwest`, structured error bodies
//! from the IdP, and platform-level WebAuthn failures. This module collapses
//! all of them into the closed [`ErrorKind`] taxonomy so the rest of the
//! engine — the ceremony state machine, the refresh scheduler, the UI-facing
//! facade — can reason about failures without caring where they came from.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Closed taxonomy of classified error kinds.
///
/// Ordering here is insignificant; the set is closed and exhaustively
/// matched wherever retry or UI-surfacing decisions are made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Transport-level failure: DNS, connection refused, timeout.
    Network,
    /// The IdP responded but is not currently able to serve the request.
    ServiceUnavailable,
    /// `check_user` (or an equivalent lookup) found no account for the email.
    UserNotFound,
    /// The user backed out of a WebAuthn ceremony (`NotAllowedError`, abort).
    AuthCancelled,
    /// A WebAuthn or credential operation failed for a reason other than
    /// cancellation.
    AuthFailed,
    /// The IdP is throttling this caller.
    RateLimited,
    /// An email code was wrong or has expired.
    InvalidCode,
    /// The request itself was malformed (bad email shape, bad redirect URL).
    InvalidInput,
    /// Nothing above matched.
    Unknown,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind is worth retrying.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::Network
                | Self::ServiceUnavailable
                | Self::AuthCancelled
                | Self::AuthFailed
                | Self::RateLimited
                | Self::Unknown
        )
    }

    /// Base retry delay for this kind, used by [`crate::retry::RetryPolicy`]
    /// consumers that want a kind-specific starting point.
    #[must_use]
    pub const fn base_delay(self) -> Duration {
        match self {
            Self::Network => Duration::from_millis(500),
            Self::ServiceUnavailable => Duration::from_secs(2),
            Self::RateLimited => Duration::from_secs(5),
            _ => Duration::from_secs(1),
        }
    }
}

/// Context carried alongside a classified error: which IdP method produced
/// it and, when relevant, which email the call concerned.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    /// Name of the IdP operation that failed (e.g. `"verify_email_code"`).
    pub method: Option<String>,
    /// Email the operation concerned, when applicable.
    pub email: Option<String>,
}

/// A classified, timestamped error record.
///
/// `ErrorRecord` is what the engine stores and hands to the UI (as
/// `ui_error`) or keeps internally (as `api_error`); see the facade's
/// error-propagation policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// The classified kind.
    pub kind: ErrorKind,
    /// The original, unclassified message, kept for diagnostics.
    pub message: String,
    /// Whether this failure is worth retrying.
    pub retryable: bool,
    /// When the failure was classified.
    pub timestamp: chrono::DateTime<chrono::Utc>,
    /// Call context, when available.
    pub context: ErrorContext,
    /// `Retry-After` duration, when the source carried one (HTTP 429).
    pub retry_after: Option<Duration>,
}

impl ErrorRecord {
    /// Classify a raw message and method context into an [`ErrorRecord`].
    ///
    /// Implements the ordered substring-matching rules: the first matching
    /// rule wins. This function never fails; the fallback kind is
    /// [`ErrorKind::Unknown`].
    #[must_use]
    pub fn classify(message: &str, context: ErrorContext, retry_after: Option<Duration>) -> Self {
        let lower = message.to_lowercase();
        let method = context.method.as_deref().unwrap_or_default();

        let kind = if lower.contains("fetch") || lower.contains("network") {
            ErrorKind::Network
        } else if lower.contains("404") && method == "check_user" {
            ErrorKind::UserNotFound
        } else if lower.contains("user not found") {
            ErrorKind::UserNotFound
        } else if lower.contains("404")
            || lower.contains("endpoint")
            || lower.contains("not found")
            || lower.contains("500")
            || lower.contains("502")
            || lower.contains("503")
        {
            ErrorKind::ServiceUnavailable
        } else if lower.contains("notallowederr") || lower.contains("cancelled") || lower.contains("aborted") {
            ErrorKind::AuthCancelled
        } else if lower.contains("webauthn") || lower.contains("passkey") || lower.contains("credential") {
            ErrorKind::AuthFailed
        } else if lower.contains("rate limit") || lower.contains("too many requests") || lower.contains("429") {
            ErrorKind::RateLimited
        } else if (lower.contains("invalid") && lower.contains("code"))
            || (lower.contains("expired") && lower.contains("code"))
            || (method == "verify_email_code" && lower.contains("invalid"))
        {
            ErrorKind::InvalidCode
        } else if lower.contains("invalid") || lower.contains("validation") || lower.contains("400") {
            ErrorKind::InvalidInput
        } else {
            ErrorKind::Unknown
        };

        Self {
            retryable: kind.is_retryable(),
            kind,
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
            context,
            retry_after,
        }
    }
}

/// Top-level engine error returned by fallible public APIs.
#[derive(Debug, thiserror::Error, Clone, PartialEq)]
pub enum EngineError {
    /// A classified failure from the IdP or transport.
    #[error("{0:?}: {1}")]
    Classified(ErrorKind, String),

    /// The persisted session record was malformed and has been discarded.
    #[error("malformed session record: {0}")]
    MalformedSession(String),

    /// An attempt was made to mutate an immutable configuration field
    /// (`api_base_url`, `client_id`, `domain`) on a live store.
    #[error("configuration field is immutable once the engine is running")]
    ConfigImmutable,

    /// The ceremony received an action that is invalid in its current state.
    #[error("action not valid in current sign-in state")]
    InvalidCeremonyAction,
}

impl From<ErrorRecord> for EngineError {
    fn from(record: ErrorRecord) -> Self {
        Self::Classified(record.kind, record.message)
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
