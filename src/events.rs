//! Event Bus.
//!
//! Typed, intra-process publish/subscribe of sign-in lifecycle events. The
//! bus is not a transport across contexts; cross-context propagation is the
//! [`crate::notifier::Notifier`]'s job. Handler errors are isolated: one
//! failing handler must not suppress the others, so handlers return a
//! `Result` rather than being allowed to unwind.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::ErrorRecord;
use crate::model::User;

/// Data carried by an event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EventPayload {
    /// A sign-in ceremony began.
    SignInStarted {
        /// The email the ceremony was started for.
        email: String,
    },
    /// A sign-in ceremony completed successfully.
    SignInSuccess {
        /// The authenticated user.
        user: User,
    },
    /// A sign-in ceremony failed.
    SignInError {
        /// The classified failure.
        error: ErrorRecord,
    },
    /// The user signed out.
    SignOut,
    /// The access token was rotated.
    TokenRefreshed,
    /// The session expired without a usable refresh token.
    SessionExpired,
    /// A passkey was used to authenticate.
    PasskeyUsed {
        /// The credential's opaque identifier.
        credential_id: String,
    },
    /// A passkey was enrolled.
    PasskeyCreated {
        /// The credential's opaque identifier.
        credential_id: String,
    },
    /// A passkey registration ceremony began.
    RegistrationStarted,
    /// A passkey registration ceremony completed successfully.
    RegistrationSuccess {
        /// The credential's opaque identifier.
        credential_id: String,
    },
    /// A passkey registration ceremony failed.
    RegistrationError {
        /// The classified failure.
        error: ErrorRecord,
    },
}

/// The closed set of event types the bus carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// See [`EventPayload::SignInStarted`].
    SignInStarted,
    /// See [`EventPayload::SignInSuccess`].
    SignInSuccess,
    /// See [`EventPayload::SignInError`].
    SignInError,
    /// See [`EventPayload::SignOut`].
    SignOut,
    /// See [`EventPayload::TokenRefreshed`].
    TokenRefreshed,
    /// See [`EventPayload::SessionExpired`].
    SessionExpired,
    /// See [`EventPayload::PasskeyUsed`].
    PasskeyUsed,
    /// See [`EventPayload::PasskeyCreated`].
    PasskeyCreated,
    /// See [`EventPayload::RegistrationStarted`].
    RegistrationStarted,
    /// See [`EventPayload::RegistrationSuccess`].
    RegistrationSuccess,
    /// See [`EventPayload::RegistrationError`].
    RegistrationError,
}

impl EventPayload {
    /// The [`EventType`] this payload belongs to.
    #[must_use]
    pub const fn event_type(&self) -> EventType {
        match self {
            Self::SignInStarted { .. } => EventType::SignInStarted,
            Self::SignInSuccess { .. } => EventType::SignInSuccess,
            Self::SignInError { .. } => EventType::SignInError,
            Self::SignOut => EventType::SignOut,
            Self::TokenRefreshed => EventType::TokenRefreshed,
            Self::SessionExpired => EventType::SessionExpired,
            Self::PasskeyUsed { .. } => EventType::PasskeyUsed,
            Self::PasskeyCreated { .. } => EventType::PasskeyCreated,
            Self::RegistrationStarted => EventType::RegistrationStarted,
            Self::RegistrationSuccess { .. } => EventType::RegistrationSuccess,
            Self::RegistrationError { .. } => EventType::RegistrationError,
        }
    }
}

type Handler = Box<dyn Fn(&EventPayload) -> Result<(), String> + Send + Sync>;

/// Opaque handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

/// Intra-process typed publish/subscribe bus.
#[derive(Default)]
pub struct EventBus {
    next_id: Mutex<u64>,
    handlers: Mutex<HashMap<EventType, Vec<(SubscriptionId, Handler)>>>,
}

impl EventBus {
    /// Construct an empty bus.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event_type`, returning an unsubscribe
    /// handle.
    pub fn on<F>(&self, event_type: EventType, handler: F) -> SubscriptionId
    where
        F: Fn(&EventPayload) -> Result<(), String> + Send + Sync + 'static,
    {
        let id = {
            let mut next_id = self.next_id.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            let id = SubscriptionId(*next_id);
            *next_id += 1;
            id
        };
        if let Ok(mut handlers) = self.handlers.lock() {
            handlers.entry(event_type).or_default().push((id, Box::new(handler)));
        }
        id
    }

    /// Unsubscribe a specific handler.
    pub fn off(&self, event_type: EventType, id: SubscriptionId) {
        if let Ok(mut handlers) = self.handlers.lock() {
            if let Some(list) = handlers.get_mut(&event_type) {
                list.retain(|(handler_id, _)| *handler_id != id);
            }
        }
    }

    /// Remove every handler, or only those for `event_type` when given.
    pub fn remove_all_listeners(&self, event_type: Option<EventType>) {
        if let Ok(mut handlers) = self.handlers.lock() {
            match event_type {
                Some(event_type) => {
                    handlers.remove(&event_type);
                }
                None => handlers.clear(),
            }
        }
    }

    /// Call every handler registered for `payload`'s event type, in
    /// registration order. A handler returning `Err` is logged and does
    /// not prevent the remaining handlers from running.
    pub fn emit(&self, payload: &EventPayload) {
        let event_type = payload.event_type();
        let Ok(handlers) = self.handlers.lock() else {
            return;
        };
        let Some(list) = handlers.get(&event_type) else {
            return;
        };
        for (_, handler) in list {
            if let Err(err) = handler(payload) {
                warn!(?event_type, %err, "event handler failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn emits_to_registered_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        bus.on(EventType::SignOut, move |_payload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.emit(&EventPayload::SignOut);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn one_failing_handler_does_not_suppress_others() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        bus.on(EventType::SignOut, |_payload| Err("boom".to_string()));
        let calls_clone = Arc::clone(&calls);
        bus.on(EventType::SignOut, move |_payload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.emit(&EventPayload::SignOut);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn off_removes_only_the_targeted_handler() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let id = bus.on(EventType::SignOut, move |_payload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.off(EventType::SignOut, id);
        bus.emit(&EventPayload::SignOut);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn remove_all_listeners_clears_everything() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        bus.on(EventType::SignOut, move |_payload| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        bus.remove_all_listeners(None);
        bus.emit(&EventPayload::SignOut);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }
}
