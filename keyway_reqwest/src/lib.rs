//! Authenticated requests against APIs that issue short-lived tokens
//!
//! A [`ProviderClient`] sends every request with the current token in the
//! `X-Auth-Token` header. When the service rejects the token, the client
//! obtains a new one through its [`Reauthenticate`] hook and sends the
//! request again. However many requests are rejected at the same time, only
//! one of them re-authenticates; the others wait for it and reuse the new
//! token.
//!
//! Rate-limited responses are handed to a [`RetryBackoff`] hook, and all
//! other failures to a [`RetryPolicy`] hook, either of which may have the
//! request sent again.
//!
//! ```no_run
//! use async_trait::async_trait;
//! use keyway_reqwest::{
//!     hooks::ExponentialBackoff, BoxError, ProviderClient, Reauthenticate, RequestOptions,
//!     SUBJECT_TOKEN_HEADER,
//! };
//! use keyway_tokens::{backoff::ErrorBackoffConfig, AccessToken};
//! use reqwest::{Method, Url};
//!
//! struct Password {
//!     token_url: Url,
//!     body: serde_json::Value,
//! }
//!
//! #[async_trait]
//! impl Reauthenticate for Password {
//!     async fn reauthenticate(&self, client: &ProviderClient) -> Result<(), BoxError> {
//!         let options = RequestOptions::new().with_json_body(&self.body)?;
//!         let response = client
//!             .throwaway()
//!             .request(Method::POST, self.token_url.clone(), options)
//!             .await?;
//!         let token = response
//!             .headers()
//!             .get(SUBJECT_TOKEN_HEADER)
//!             .ok_or("no token issued")?
//!             .to_str()?;
//!         client.set_token(AccessToken::new(token.to_owned()));
//!         Ok(())
//!     }
//! }
//!
//! # #[tokio::main(flavor = "current_thread")] async fn main() -> Result<(), BoxError> {
//! let client = ProviderClient::builder()
//!     .reauthenticator(Password {
//!         token_url: Url::parse("https://identity.example.com/v3/auth/tokens")?,
//!         body: serde_json::json!({ "auth": { "identity": { "methods": ["password"] } } }),
//!     })
//!     .retry_backoff(ExponentialBackoff::new(ErrorBackoffConfig::default()))
//!     .build();
//!
//! let servers = client
//!     .get(
//!         Url::parse("https://compute.example.com/v2.1/servers")?,
//!         RequestOptions::new(),
//!     )
//!     .await?;
//! println!("listed servers: {}", servers.status());
//! # Ok(()) }
//! ```

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

use reqwest::header::HeaderName;

mod client;
mod error;
mod execute;
pub mod hooks;
mod request;
mod user_agent;

pub use client::{ProviderClient, ProviderClientBuilder, DEFAULT_MAX_BACKOFF_RETRIES};
pub use error::{BoxError, ConfigurationError, Error, UnexpectedResponseCode};
pub use hooks::{Reauthenticate, RetryBackoff, RetryContext, RetryPolicy};
pub use request::{default_ok_codes, Body, JsonResponse, RawBody, RequestOptions, Response};
pub use user_agent::{UserAgent, DEFAULT_USER_AGENT};

/// The header carrying the token of an authenticated request
pub const AUTH_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-auth-token");

/// The header in which an identity service returns a newly issued token
pub const SUBJECT_TOKEN_HEADER: HeaderName = HeaderName::from_static("x-subject-token");
