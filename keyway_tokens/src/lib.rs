//! Shared token state for clients of token-authenticated APIs
//!
//! A client talking to a service that issues short-lived bearer tokens needs
//! two pieces of shared state: the token currently in use, and a record of
//! whether someone is already busy fetching a new one. This crate provides
//! both, independently guarded so that reading the token is never held up by
//! re-authentication bookkeeping.
//!
//! * [`TokenStore`] holds the current [`AccessToken`] together with the
//!   [`AuthResult`] that issued it. Readers always see a matching pair.
//! * [`ReauthCoordinator`] makes sure that, when a token is rejected, only one
//!   caller runs the authentication procedure while everyone else waits for
//!   its outcome.
//!
//! ```
//! use keyway_tokens::{AccessToken, ReauthCoordinator, TokenStore};
//! # #[tokio::main(flavor = "current_thread")] async fn main() {
//! let store = TokenStore::with_token(AccessToken::from_static("expired"));
//! let coordinator = ReauthCoordinator::new();
//!
//! let rejected = store.token().unwrap();
//! let target = &store;
//! coordinator
//!     .reauthenticate(&store, Some(&*rejected), move || async move {
//!         // Exchange credentials with the identity service here
//!         target.set_token(AccessToken::from_static("renewed"));
//!         Ok::<_, std::io::Error>(())
//!     })
//!     .await
//!     .unwrap();
//!
//! assert_eq!(store.token().unwrap().as_str(), "renewed");
//! # }
//! ```
//!
//! The [`backoff`] and [`jitter`] modules provide delay schedules for callers
//! that need to wait before trying again.
//!
//! # Features
//!
//! * `rand` (default): Provides [`RandomJitter`][jitter::RandomJitter], based
//!   on the random number generator provided by the [rand] crate.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

pub mod backoff;
mod braids;
mod coordinator;
pub mod jitter;
mod store;

pub use braids::*;
pub use coordinator::{ReauthCoordinator, ReauthError};
pub use store::{AuthResult, TokenExtractError, TokenState, TokenStore};
