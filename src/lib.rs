//! # Passwordless Authentication Session Engine
//!
//! A client-side authentication session engine: passkeys, email-code and
//! magic-link ceremonies, refresh-token rotation, and cross-context session
//! persistence, built for an embedding UI layer that holds nothing but a
//! [`facade::CompositionFacade`].
//!
//! ## Architecture
//!
//! Three cooperating stores, each an observable `watch` cell driven by
//! `&self` methods with interior mutability:
//!
//! - [`auth_core`] — identity, tokens, and the refresh protocol.
//! - [`ceremony`] — the sign-in ceremony's UI-facing state machine.
//! - [`facade`] — the merged projection and action surface a UI holds.
//!
//! Supporting modules: [`persistence`] (the session storage adapter),
//! [`notifier`] (cross-context/cross-tab convergence), [`discovery`] (the
//! per-context `check_user` cache), [`idp`] (the typed upstream client),
//! [`error`] (the closed failure taxonomy), [`events`] (the lifecycle event
//! bus), [`config`] (the engine's configuration record), and [`retry`] (the
//! shared backoff policy).
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use auth_session_engine::config::Config;
//! use auth_session_engine::facade::CompositionFacade;
//! use auth_session_engine::idp::HttpIdpClient;
//! use auth_session_engine::notifier::BroadcastNotifier;
//! use auth_session_engine::persistence::VolatileSessionStore;
//!
//! # async fn example() {
//! let config = Config::builder("https://idp.example.com", "client-1", "example.com").build();
//! let facade = CompositionFacade::new(
//!     config,
//!     Arc::new(HttpIdpClient::new("https://idp.example.com", None)),
//!     Arc::new(VolatileSessionStore::new()),
//!     Arc::new(BroadcastNotifier::new(1)),
//! );
//!
//! facade.set_email("user@example.com");
//! let _ = facade.check_user("user@example.com").await;
//! # }
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

pub mod auth_core;
pub mod ceremony;
pub mod config;
pub mod discovery;
pub mod environment;
pub mod error;
pub mod events;
pub mod facade;
pub mod idp;
#[cfg(feature = "test-utils")]
pub mod mocks;
pub mod model;
pub mod notifier;
pub mod persistence;
pub mod retry;

pub use config::{Config, ConfigBuilder};
pub use error::{EngineError, Result};
pub use facade::{CompositionFacade, FacadeSnapshot};
