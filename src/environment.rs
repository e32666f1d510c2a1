//! Collaborator bundles injected into the Auth Core and Ceremony stores.
//!
//! Each store gets its own narrow `Environment` type exposing exactly the
//! collaborators its methods need to do their work, scoped per store
//! instead of one environment shared by every store in the crate.

use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::config::Config;
use crate::discovery::DiscoveryCache;
use crate::events::EventBus;
use crate::idp::IdpClient;
use crate::notifier::NotifierMessage;
use crate::persistence::SessionPersistence;

/// Collaborators the Auth Core Store needs to carry out its methods: the
/// IdP client (for refresh and sign-out calls), the persistence adapter, a
/// publish callback to the Cross-Context Notifier, and the event bus.
///
/// Generic over the concrete [`IdpClient`] implementation, parameterizing
/// the environment over the collaborator type rather than erasing it
/// behind `dyn` (async trait methods are not object-safe without an
/// adapter crate this workspace does not carry).
pub struct AuthCoreEnvironment<Idp: IdpClient> {
    /// Typed IdP client.
    pub idp: Arc<Idp>,
    /// Session persistence adapter.
    pub persistence: Arc<dyn SessionPersistence>,
    /// Publish a message to every other live context. Boxed rather than
    /// generic over a `Notifier` implementation because only the publish
    /// side is needed synchronously inside the store's methods; the
    /// receive loop that turns incoming notifier messages into
    /// `SessionClearedExternally` actions is driven separately by the
    /// facade, which does hold the concrete `Notifier`.
    pub publish: Arc<dyn Fn(NotifierMessage) + Send + Sync>,
    /// Lifecycle event bus.
    pub events: Arc<EventBus>,
    /// Engine configuration. Swappable at runtime by the Composition
    /// Facade's `update_config` (branding, flags, `sign_in_mode`); the
    /// facade shares the same handle with [`CeremonyEnvironment`] so both
    /// stores observe a config update atomically.
    pub config: Arc<ArcSwap<Config>>,
}

impl<Idp: IdpClient> Clone for AuthCoreEnvironment<Idp> {
    fn clone(&self) -> Self {
        Self {
            idp: Arc::clone(&self.idp),
            persistence: Arc::clone(&self.persistence),
            publish: Arc::clone(&self.publish),
            events: Arc::clone(&self.events),
            config: Arc::clone(&self.config),
        }
    }
}

/// Collaborators the Sign-In Ceremony Store needs: the IdP client, the
/// event bus, the per-context Discovery Cache, and config (`sign_in_mode`
/// governs the `UserChecked{exists=false}` branch).
pub struct CeremonyEnvironment<Idp: IdpClient> {
    /// Typed IdP client.
    pub idp: Arc<Idp>,
    /// Lifecycle event bus.
    pub events: Arc<EventBus>,
    /// Per-context discovery memoization.
    pub discovery: Arc<DiscoveryCache>,
    /// Engine configuration, shared with [`AuthCoreEnvironment`] so a live
    /// `update_config` is visible to both stores at once.
    pub config: Arc<ArcSwap<Config>>,
}

impl<Idp: IdpClient> Clone for CeremonyEnvironment<Idp> {
    fn clone(&self) -> Self {
        Self {
            idp: Arc::clone(&self.idp),
            events: Arc::clone(&self.events),
            discovery: Arc::clone(&self.discovery),
            config: Arc::clone(&self.config),
        }
    }
}
