//! Session Persistence Adapter.
//!
//! All state mutations to the persisted session slot and the last-user slot
//! go through a single trait so the rest of the engine does not need to
//! know whether it is backed by an in-process map, a platform keychain, or
//! a file.
//!
//! # Implementation Notes
//!
//! - Reads and writes are best-effort: a failure is logged and swallowed,
//!   never surfaced as an error to the caller (loss of persistence degrades
//!   to an in-memory session, it does not fail the engine).
//! - `save_session` merges into whatever is already stored; it never
//!   replaces unspecified fields. This lets the refresh path and the
//!   user-update path write independently without clobbering each other.
//! - The adapter does not proactively expire records; expiry is checked
//!   only on load (see [`crate::model::SessionRecord::is_expired`]).

use std::collections::HashMap;
use std::sync::Mutex;

use serde::Deserialize;
use tracing::warn;

use crate::model::{AuthMethod, LastUserRecord, SessionRecord, TokenSet, User};

/// A partial update to a [`SessionRecord`]. Every field left `None` is
/// untouched by [`SessionPersistence::save_session`].
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    /// Replace the stored user, if present.
    pub user: Option<User>,
    /// Replace the stored access token, if present.
    pub access_token: Option<String>,
    /// Replace the stored refresh token. `Some(None)` clears it explicitly
    /// (distinct from leaving it untouched).
    pub refresh_token: Option<Option<String>>,
    /// Replace the stored expiry.
    pub expires_at: Option<Option<i64>>,
    /// Replace the stored rotation timestamp.
    pub refreshed_at: Option<Option<i64>>,
    /// Replace the stored secondary token.
    pub secondary_token: Option<Option<String>>,
    /// Replace the stored secondary token expiry.
    pub secondary_expires_at: Option<Option<i64>>,
    /// Replace the stored auth method.
    pub auth_method: Option<crate::model::AuthMethod>,
}

fn merge(existing: Option<SessionRecord>, patch: SessionPatch) -> Option<SessionRecord> {
    let mut base = existing.unwrap_or_else(|| SessionRecord {
        user: patch.user.clone().unwrap_or_else(|| User {
            id: String::new(),
            email: String::new(),
            name: None,
            email_verified: false,
            created_at: chrono::Utc::now(),
            last_login_at: None,
            metadata: None,
        }),
        tokens: crate::model::TokenSet {
            access_token: String::new(),
            refresh_token: None,
            expires_at: None,
            refreshed_at: None,
            secondary_token: None,
            secondary_expires_at: None,
        },
        auth_method: crate::model::AuthMethod::EmailCode,
    });

    if let Some(user) = patch.user {
        base.user = user;
    }
    if let Some(access_token) = patch.access_token {
        base.tokens.access_token = access_token;
    }
    if let Some(refresh_token) = patch.refresh_token {
        base.tokens.refresh_token = refresh_token;
    }
    if let Some(expires_at) = patch.expires_at {
        base.tokens.expires_at = expires_at;
    }
    if let Some(refreshed_at) = patch.refreshed_at {
        base.tokens.refreshed_at = refreshed_at;
    }
    if let Some(secondary_token) = patch.secondary_token {
        base.tokens.secondary_token = secondary_token;
    }
    if let Some(secondary_expires_at) = patch.secondary_expires_at {
        base.tokens.secondary_expires_at = secondary_expires_at;
    }
    if let Some(auth_method) = patch.auth_method {
        base.auth_method = auth_method;
    }
    Some(base)
}

/// A session record as an older client wrote it before tokens were nested
/// under their own object. `DurableSessionStore` reads this shape as a
/// fallback so upgrading a host application does not sign out every user
/// with a session persisted by the previous version.
#[derive(Debug, Deserialize)]
struct LegacyFlatSessionRecord {
    user_id: String,
    email: String,
    name: Option<String>,
    email_verified: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    last_login_at: Option<chrono::DateTime<chrono::Utc>>,
    metadata: Option<serde_json::Value>,
    access_token: String,
    refresh_token: Option<String>,
    expires_at: Option<i64>,
    refreshed_at: Option<i64>,
    secondary_token: Option<String>,
    secondary_expires_at: Option<i64>,
    auth_method: AuthMethod,
}

impl From<LegacyFlatSessionRecord> for SessionRecord {
    fn from(legacy: LegacyFlatSessionRecord) -> Self {
        Self {
            user: User {
                id: legacy.user_id,
                email: legacy.email,
                name: legacy.name,
                email_verified: legacy.email_verified,
                created_at: legacy.created_at,
                last_login_at: legacy.last_login_at,
                metadata: legacy.metadata,
            },
            tokens: TokenSet {
                access_token: legacy.access_token,
                refresh_token: legacy.refresh_token,
                expires_at: legacy.expires_at,
                refreshed_at: legacy.refreshed_at,
                secondary_token: legacy.secondary_token,
                secondary_expires_at: legacy.secondary_expires_at,
            },
            auth_method: legacy.auth_method,
        }
    }
}

/// Pluggable key/value backing for a session persistence implementation
/// that needs to survive process restarts. Host applications wire this to
/// a file, `sled`, or a platform keychain without this crate depending on
/// any of them directly.
pub trait KvStore: Send + Sync {
    /// Read the raw bytes stored under `key`, if any.
    fn get(&self, key: &str) -> Option<Vec<u8>>;
    /// Store `value` under `key`.
    fn set(&self, key: &str, value: Vec<u8>);
    /// Remove whatever is stored under `key`.
    fn remove(&self, key: &str);
}

/// Session Persistence Adapter.
pub trait SessionPersistence: Send + Sync {
    /// Merge `patch` into the stored session record (creating one if none
    /// exists) and return the record as actually persisted.
    fn save_session(&self, patch: SessionPatch) -> SessionRecord;

    /// Load the stored session record.
    ///
    /// Returns `None` and clears the slot if the stored payload is
    /// malformed, or if the record is expired per
    /// [`SessionRecord::is_expired`][crate::model::SessionRecord::is_expired].
    fn load_session(&self) -> Option<SessionRecord>;

    /// Remove the stored session record and notify cross-context
    /// subscribers via the given notifier.
    fn clear_session(&self);

    /// Save the last-user hint.
    fn save_user(&self, user: LastUserRecord);

    /// Load the last-user hint, discarding it if stale
    /// (see [`LastUserRecord::is_stale`]).
    fn get_user(&self) -> Option<LastUserRecord>;

    /// Remove the last-user hint.
    fn clear_user(&self);
}

const SESSION_KEY: &str = "auth_session_engine.session";
const USER_KEY: &str = "auth_session_engine.last_user";

/// Process-lifetime, in-memory session persistence. The default
/// implementation when [`crate::config::StorageClass::Volatile`] is
/// configured.
#[derive(Default)]
pub struct VolatileSessionStore {
    session: Mutex<Option<SessionRecord>>,
    user: Mutex<Option<LastUserRecord>>,
}

impl VolatileSessionStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionPersistence for VolatileSessionStore {
    fn save_session(&self, patch: SessionPatch) -> SessionRecord {
        let mut guard = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let merged = merge(guard.take(), patch).unwrap_or_else(|| unreachable!("merge always returns Some"));
        *guard = Some(merged.clone());
        merged
    }

    fn load_session(&self) -> Option<SessionRecord> {
        let mut guard = match self.session.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = chrono::Utc::now().timestamp_millis();
        match guard.clone() {
            Some(record) if record.is_expired(now) => {
                *guard = None;
                None
            }
            other => other,
        }
    }

    fn clear_session(&self) {
        if let Ok(mut guard) = self.session.lock() {
            *guard = None;
        }
    }

    fn save_user(&self, user: LastUserRecord) {
        if let Ok(mut guard) = self.user.lock() {
            *guard = Some(user);
        }
    }

    fn get_user(&self) -> Option<LastUserRecord> {
        let mut guard = match self.user.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let now = chrono::Utc::now();
        match guard.clone() {
            Some(record) if record.is_stale(now) => {
                *guard = None;
                None
            }
            other => other,
        }
    }

    fn clear_user(&self) {
        if let Ok(mut guard) = self.user.lock() {
            *guard = None;
        }
    }
}

/// Session persistence backed by a host-provided [`KvStore`]; survives
/// process restarts. Payloads are written in the nested JSON shape
/// documented by the engine's persisted-state layout and read back
/// accepting either that shape or a legacy flat shape, so a host migrating
/// from an older client does not lose existing sessions.
pub struct DurableSessionStore {
    kv: Box<dyn KvStore>,
}

impl DurableSessionStore {
    /// Wrap a host-provided [`KvStore`].
    #[must_use]
    pub fn new(kv: Box<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn read_session_raw(&self) -> Option<SessionRecord> {
        let bytes = self.kv.get(SESSION_KEY)?;
        if let Ok(record) = serde_json::from_slice::<SessionRecord>(&bytes) {
            return Some(record);
        }
        if let Ok(legacy) = serde_json::from_slice::<LegacyFlatSessionRecord>(&bytes) {
            return Some(legacy.into());
        }
        warn!("discarding malformed persisted session record");
        self.kv.remove(SESSION_KEY);
        None
    }
}

impl SessionPersistence for DurableSessionStore {
    fn save_session(&self, patch: SessionPatch) -> SessionRecord {
        let merged = merge(self.read_session_raw(), patch).unwrap_or_else(|| unreachable!("merge always returns Some"));
        match serde_json::to_vec(&merged) {
            Ok(bytes) => self.kv.set(SESSION_KEY, bytes),
            Err(err) => warn!(%err, "failed to serialize session record"),
        }
        merged
    }

    fn load_session(&self) -> Option<SessionRecord> {
        let record = self.read_session_raw()?;
        let now = chrono::Utc::now().timestamp_millis();
        if record.is_expired(now) {
            self.kv.remove(SESSION_KEY);
            return None;
        }
        Some(record)
    }

    fn clear_session(&self) {
        self.kv.remove(SESSION_KEY);
    }

    fn save_user(&self, user: LastUserRecord) {
        match serde_json::to_vec(&user) {
            Ok(bytes) => self.kv.set(USER_KEY, bytes),
            Err(err) => warn!(%err, "failed to serialize last-user record"),
        }
    }

    fn get_user(&self) -> Option<LastUserRecord> {
        let bytes = self.kv.get(USER_KEY)?;
        let record = match serde_json::from_slice::<LastUserRecord>(&bytes) {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "discarding malformed last-user record");
                self.kv.remove(USER_KEY);
                return None;
            }
        };
        if record.is_stale(chrono::Utc::now()) {
            self.kv.remove(USER_KEY);
            return None;
        }
        Some(record)
    }

    fn clear_user(&self) {
        self.kv.remove(USER_KEY);
    }
}

/// An in-memory [`KvStore`] useful for tests and for hosts with no durable
/// storage backend available.
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryKvStore {
    /// Construct an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: Vec<u8>) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), value);
        }
    }

    fn remove(&self, key: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AuthMethod;

    fn patch_with_access_token(token: &str) -> SessionPatch {
        SessionPatch {
            user: Some(User {
                id: "u1".to_string(),
                email: "a@b.com".to_string(),
                name: None,
                email_verified: true,
                created_at: chrono::Utc::now(),
                last_login_at: None,
                metadata: None,
            }),
            access_token: Some(token.to_string()),
            refresh_token: Some(Some("r1".to_string())),
            expires_at: Some(Some(chrono::Utc::now().timestamp_millis() + 60_000)),
            auth_method: Some(AuthMethod::EmailCode),
            ..Default::default()
        }
    }

    #[test]
    fn volatile_store_round_trips() {
        let store = VolatileSessionStore::new();
        let saved = store.save_session(patch_with_access_token("t1"));
        assert_eq!(saved.tokens.access_token, "t1");
        let loaded = store.load_session().expect("session should be present");
        assert_eq!(loaded, saved);
    }

    #[test]
    fn save_session_merges_rather_than_replaces() {
        let store = VolatileSessionStore::new();
        store.save_session(patch_with_access_token("t1"));
        let merged = store.save_session(SessionPatch {
            access_token: Some("t2".to_string()),
            ..Default::default()
        });
        assert_eq!(merged.tokens.access_token, "t2");
        assert_eq!(merged.tokens.refresh_token.as_deref(), Some("r1"));
        assert_eq!(merged.user.email, "a@b.com");
    }

    #[test]
    fn load_session_discards_expired_record_without_refresh_token() {
        let store = VolatileSessionStore::new();
        store.save_session(SessionPatch {
            user: Some(User {
                id: "u1".to_string(),
                email: "a@b.com".to_string(),
                name: None,
                email_verified: true,
                created_at: chrono::Utc::now(),
                last_login_at: None,
                metadata: None,
            }),
            access_token: Some("t1".to_string()),
            refresh_token: Some(None),
            expires_at: Some(Some(0)),
            ..Default::default()
        });
        assert!(store.load_session().is_none());
        assert!(store.load_session().is_none(), "slot must stay cleared");
    }

    #[test]
    fn durable_store_discards_garbage_on_read_failure_is_logged_not_panicked() {
        let kv = InMemoryKvStore::new();
        kv.set(SESSION_KEY, b"not json".to_vec());
        let store = DurableSessionStore::new(Box::new(kv));
        assert!(store.load_session().is_none());
    }

    #[test]
    fn durable_store_accepts_legacy_flat_shape_on_read() {
        let kv = InMemoryKvStore::new();
        let legacy = serde_json::json!({
            "user_id": "u1",
            "email": "a@b.com",
            "name": null,
            "email_verified": true,
            "created_at": chrono::Utc::now().to_rfc3339(),
            "last_login_at": null,
            "metadata": null,
            "access_token": "t1",
            "refresh_token": "r1",
            "expires_at": chrono::Utc::now().timestamp_millis() + 60_000,
            "refreshed_at": null,
            "secondary_token": null,
            "secondary_expires_at": null,
            "auth_method": "email-code",
        });
        kv.set(SESSION_KEY, serde_json::to_vec(&legacy).expect("serializes"));
        let store = DurableSessionStore::new(Box::new(kv));
        let loaded = store.load_session().expect("legacy shape should parse");
        assert_eq!(loaded.user.id, "u1");
        assert_eq!(loaded.tokens.access_token, "t1");
        assert_eq!(loaded.auth_method, AuthMethod::EmailCode);
    }

    #[test]
    fn durable_store_round_trips_through_kv() {
        let kv = Box::new(InMemoryKvStore::new());
        let store = DurableSessionStore::new(kv);
        let saved = store.save_session(patch_with_access_token("t1"));
        let loaded = store.load_session().expect("session should persist");
        assert_eq!(loaded.tokens.access_token, saved.tokens.access_token);
    }

    #[test]
    fn last_user_hint_round_trips_and_expires() {
        let store = VolatileSessionStore::new();
        store.save_user(LastUserRecord {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
            name: None,
            last_login_at: chrono::Utc::now(),
        });
        assert!(store.get_user().is_some());

        store.save_user(LastUserRecord {
            id: "u1".to_string(),
            email: "a@b.com".to_string(),
            name: None,
            last_login_at: chrono::Utc::now() - chrono::Duration::days(31),
        });
        assert!(store.get_user().is_none());
    }

}
