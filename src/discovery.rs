//! User Discovery Cache.
//!
//! Short-lived memoization of `check_user` results to avoid redundant
//! round-trips during a single ceremony. Entries are invalidated eagerly by
//! [`crate::idp::IdpClient`] callers right after any operation that could
//! change a user's existence or credential set, so a just-registered user
//! is never blocked behind a stale `exists=false`.
//!
//! Per-context, not shared: each engine instance owns its own cache.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::model::DiscoveryResult;

struct Entry {
    result: DiscoveryResult,
    cached_at: chrono::DateTime<chrono::Utc>,
}

/// A bounded-TTL cache from normalized email to the last `check_user`
/// result observed for it.
pub struct DiscoveryCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl DiscoveryCache {
    /// Construct a cache with the given TTL
    /// (see [`crate::config::Config::discovery_cache_ttl`]).
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Return the cached result for `email`, if present and not yet
    /// expired.
    #[must_use]
    pub fn get(&self, email: &str) -> Option<DiscoveryResult> {
        let entries = self.entries.lock().ok()?;
        let entry = entries.get(email)?;
        let age = chrono::Utc::now().signed_duration_since(entry.cached_at);
        if age.to_std().ok()? > self.ttl {
            return None;
        }
        Some(entry.result.clone())
    }

    /// Store (or refresh) the result for `email`.
    pub fn set(&self, email: &str, result: DiscoveryResult) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                email.to_string(),
                Entry {
                    result,
                    cached_at: chrono::Utc::now(),
                },
            );
        }
    }

    /// Remove the cached entry for `email`, if any.
    pub fn invalidate(&self, email: &str) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(email);
        }
    }

    /// Remove every cached entry.
    pub fn clear_all(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
