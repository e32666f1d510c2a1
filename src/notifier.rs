//! Cross-Context Notifier.
//!
//! Broadcasts session updates and clears between concurrent contexts (tabs,
//! or independent process-local engine handles) of the same origin, so
//! that signing in or out in one context converges the others. This is an
//! eventual-consistency transport, not a serializer: receivers must apply
//! their own guards (see the Auth Core's monotonic-expiry invariant) rather
//! than trust message order.

use tokio::sync::broadcast;

use crate::model::SessionRecord;

/// A message delivered to every other live context of the same origin.
#[derive(Debug, Clone, PartialEq)]
pub enum NotifierMessage {
    /// Another context wrote a new merged session record.
    SessionUpdated {
        /// The merged record as that context observed it.
        record: SessionRecord,
        /// When the write happened.
        at: chrono::DateTime<chrono::Utc>,
    },
    /// Another context cleared its session.
    SessionCleared {
        /// When the clear happened.
        at: chrono::DateTime<chrono::Utc>,
    },
}

/// Cross-context broadcast contract.
///
/// Implementations MUST exclude a publisher's own messages from its own
/// subscription (self-exclusion); the default in-process implementation
/// does this by tagging each publish with a context id.
pub trait Notifier: Send + Sync {
    /// A handle subscribers can poll or await on.
    type Subscription: NotifierSubscription;

    /// Publish a message to every other context.
    fn publish(&self, message: NotifierMessage);

    /// Subscribe to messages from other contexts.
    fn subscribe(&self) -> Self::Subscription;
}

/// A subscription handle returned by [`Notifier::subscribe`].
pub trait NotifierSubscription: Send {
    /// Wait for the next message from another context. Returns `None` if
    /// the notifier has been dropped.
    #[allow(async_fn_in_trait)]
    async fn recv(&mut self) -> Option<NotifierMessage>;
}

/// Default in-process [`Notifier`] backed by a [`tokio::sync::broadcast`]
/// channel, standing in for a host's real cross-context transport (a
/// browser `BroadcastChannel`, an IPC socket, or a watched file). Hosts
/// that need true OS-level cross-process delivery provide their own
/// [`Notifier`] implementation.
pub struct BroadcastNotifier {
    context_id: u64,
    sender: broadcast::Sender<(u64, NotifierMessage)>,
}

impl BroadcastNotifier {
    /// Construct a notifier identified by `context_id`; messages this
    /// instance publishes are filtered back out of its own subscription.
    #[must_use]
    pub fn new(context_id: u64) -> Self {
        let (sender, _receiver) = broadcast::channel(64);
        Self { context_id, sender }
    }
}

impl Notifier for BroadcastNotifier {
    type Subscription = BroadcastSubscription;

    fn publish(&self, message: NotifierMessage) {
        // A full channel with no subscribers yields a `SendError`, which is
        // expected when no other context is currently listening.
        let _ = self.sender.send((self.context_id, message));
    }

    fn subscribe(&self) -> Self::Subscription {
        BroadcastSubscription {
            context_id: self.context_id,
            receiver: self.sender.subscribe(),
        }
    }
}

/// Subscription handle for [`BroadcastNotifier`].
pub struct BroadcastSubscription {
    context_id: u64,
    receiver: broadcast::Receiver<(u64, NotifierMessage)>,
}

impl NotifierSubscription for BroadcastSubscription {
    async fn recv(&mut self) -> Option<NotifierMessage> {
        loop {
            match self.receiver.recv().await {
                Ok((origin, message)) if origin != self.context_id => return Some(message),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SessionRecord {
        SessionRecord {
            user: crate::model::User {
                id: "u1".to_string(),
                email: "a@b.com".to_string(),
                name: None,
                email_verified: true,
                created_at: chrono::Utc::now(),
                last_login_at: None,
                metadata: None,
            },
            tokens: crate::model::TokenSet {
                access_token: "t1".to_string(),
                refresh_token: None,
                expires_at: None,
                refreshed_at: None,
                secondary_token: None,
                secondary_expires_at: None,
            },
            auth_method: crate::model::AuthMethod::EmailCode,
        }
    }

    #[tokio::test]
    async fn delivers_to_other_contexts() {
        let notifier = BroadcastNotifier::new(1);
        let other = BroadcastNotifier { context_id: 2, sender: notifier.sender.clone() };
        let mut subscription = other.subscribe();

        notifier.publish(NotifierMessage::SessionCleared { at: chrono::Utc::now() });

        let received = subscription.recv().await;
        assert!(matches!(received, Some(NotifierMessage::SessionCleared { .. })));
    }

    #[tokio::test]
    async fn excludes_self() {
        let notifier = BroadcastNotifier::new(1);
        let mut own_subscription = notifier.subscribe();

        notifier.publish(NotifierMessage::SessionUpdated {
            record: sample_record(),
            at: chrono::Utc::now(),
        });

        // No other context is listening, so this subscription should never
        // observe its own publish; dropping the sender closes the channel
        // and causes `recv` to resolve instead of hanging forever.
        drop(notifier);
        assert_eq!(own_subscription.recv().await, None);
    }
}
