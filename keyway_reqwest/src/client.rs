use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use keyway_tokens::{
    AccessToken, AccessTokenRef, AuthResult, ReauthCoordinator, ReauthError, TokenExtractError,
    TokenState, TokenStore,
};
use reqwest::{Method, Url};
use reqwest_middleware::ClientWithMiddleware;
use serde::de::DeserializeOwned;

use crate::{
    execute, Error, JsonResponse, Reauthenticate, RequestOptions, Response, RetryBackoff,
    RetryPolicy, UserAgent,
};

/// The number of rate-limit backoffs allowed for a single request by default
pub const DEFAULT_MAX_BACKOFF_RETRIES: u32 = 60;

/// A client for a token-authenticated API
///
/// Cloning a client is cheap, and all clones share the same token and
/// re-authentication state.
#[derive(Clone)]
pub struct ProviderClient {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) transport: ClientWithMiddleware,
    pub(crate) tokens: TokenStore,
    pub(crate) coordinator: ReauthCoordinator,
    pub(crate) reauthenticator: Option<Arc<dyn Reauthenticate>>,
    pub(crate) retry_backoff: Option<Arc<dyn RetryBackoff>>,
    pub(crate) retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub(crate) max_backoff_retries: u32,
    pub(crate) user_agent: UserAgent,
    pub(crate) throwaway: AtomicBool,
}

impl ProviderClient {
    /// Starts building a new client
    pub fn builder() -> ProviderClientBuilder {
        ProviderClientBuilder::default()
    }

    /// Gets a copy of the current token
    pub fn token(&self) -> Option<AccessToken> {
        self.inner.tokens.token()
    }

    /// Gets the authentication result that issued the current token
    pub fn auth_result(&self) -> Option<Arc<dyn AuthResult>> {
        self.inner.tokens.auth_result()
    }

    /// Loads the current token together with its authentication result
    pub fn token_state(&self) -> Arc<TokenState> {
        self.inner.tokens.current()
    }

    /// Replaces the current token, discarding any authentication result
    pub fn set_token(&self, token: AccessToken) {
        self.inner.tokens.set_token(token);
    }

    /// Replaces the current token with the one issued in `result`
    ///
    /// If the result does not carry a token, the client keeps its current
    /// token and the extraction error is returned.
    pub fn set_token_and_auth_result(
        &self,
        result: Arc<dyn AuthResult>,
    ) -> Result<(), TokenExtractError> {
        self.inner.tokens.set_auth_result(result)
    }

    /// Forgets the current token and authentication result
    pub fn clear_token(&self) {
        self.inner.tokens.clear();
    }

    /// Copies the token and authentication result from another client
    pub fn copy_token_from(&self, other: &ProviderClient) {
        self.inner.tokens.copy_from(&other.inner.tokens);
    }

    /// Whether this client sends requests without a token
    pub fn is_throwaway(&self) -> bool {
        self.inner.throwaway.load(Ordering::Acquire)
    }

    /// Marks this client, and all of its clones, as a throwaway client
    ///
    /// A throwaway client never attaches a token to its requests and never
    /// waits for a running re-authentication.
    pub fn set_throwaway(&self, throwaway: bool) {
        self.inner.throwaway.store(throwaway, Ordering::Release);
    }

    /// Creates a throwaway client for talking to the identity service
    ///
    /// The new client shares this client's transport, user agent and retry
    /// hooks, but starts without a token and cannot re-authenticate.
    pub fn throwaway(&self) -> ProviderClient {
        ProviderClient {
            inner: Arc::new(Inner {
                transport: self.inner.transport.clone(),
                tokens: TokenStore::new(),
                coordinator: ReauthCoordinator::new(),
                reauthenticator: None,
                retry_backoff: self.inner.retry_backoff.clone(),
                retry_policy: self.inner.retry_policy.clone(),
                max_backoff_retries: self.inner.max_backoff_retries,
                user_agent: self.inner.user_agent.clone(),
                throwaway: AtomicBool::new(true),
            }),
        }
    }

    /// The user agent sent with every request
    pub fn user_agent(&self) -> &UserAgent {
        &self.inner.user_agent
    }

    /// Re-authenticates, or waits for a re-authentication that is already
    /// running
    ///
    /// `previous` is the token that was rejected. If the client no longer
    /// holds it, another caller has already replaced it and nothing is done.
    /// Passing `None` forces a new authentication.
    ///
    /// A client without a re-authenticator does nothing and succeeds.
    #[tracing::instrument(level = "debug", skip_all, fields(forced = previous.is_none()))]
    pub async fn reauthenticate(&self, previous: Option<&AccessTokenRef>) -> Result<(), ReauthError> {
        let Some(reauthenticator) = &self.inner.reauthenticator else {
            return Ok(());
        };

        self.inner
            .coordinator
            .reauthenticate(&self.inner.tokens, previous, move || {
                reauthenticator.reauthenticate(self)
            })
            .await
    }

    /// Sends a request, retrying it as needed
    ///
    /// The response is accepted when its status is one of the options'
    /// `ok_codes`, or one of [`default_ok_codes()`][crate::default_ok_codes]
    /// for the method. Unless the options keep the body, it is read to the
    /// end before the response is returned.
    pub async fn request(
        &self,
        method: Method,
        url: Url,
        options: RequestOptions,
    ) -> Result<Response, Error> {
        execute::execute(self, method, url, &options, false, Ok).await
    }

    /// Sends a request and decodes the JSON response body
    ///
    /// A `204 No Content` response is not decoded. A body that fails to
    /// decode is treated like any other failure and may be retried by the
    /// retry policy.
    pub async fn request_json<T>(
        &self,
        method: Method,
        url: Url,
        options: RequestOptions,
    ) -> Result<JsonResponse<T>, Error>
    where
        T: DeserializeOwned + Send,
    {
        execute::execute(self, method, url, &options, true, execute::decode::<T>).await
    }

    /// Sends a `GET` request
    pub async fn get(&self, url: Url, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::GET, url, options).await
    }

    /// Sends a `HEAD` request
    pub async fn head(&self, url: Url, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::HEAD, url, options).await
    }

    /// Sends a `POST` request
    pub async fn post(&self, url: Url, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::POST, url, options).await
    }

    /// Sends a `PUT` request
    pub async fn put(&self, url: Url, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::PUT, url, options).await
    }

    /// Sends a `PATCH` request
    pub async fn patch(&self, url: Url, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::PATCH, url, options).await
    }

    /// Sends a `DELETE` request
    pub async fn delete(&self, url: Url, options: RequestOptions) -> Result<Response, Error> {
        self.request(Method::DELETE, url, options).await
    }
}

impl fmt::Debug for ProviderClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderClient")
            .field("tokens", &self.inner.tokens)
            .field("throwaway", &self.is_throwaway())
            .field("reauthenticates", &self.inner.reauthenticator.is_some())
            .field("backs_off", &self.inner.retry_backoff.is_some())
            .field("retries", &self.inner.retry_policy.is_some())
            .field("max_backoff_retries", &self.inner.max_backoff_retries)
            .field("user_agent", &self.inner.user_agent)
            .finish()
    }
}

/// Builder for a [`ProviderClient`]
#[derive(Default)]
pub struct ProviderClientBuilder {
    transport: Option<ClientWithMiddleware>,
    token: Option<AccessToken>,
    reauthenticator: Option<Arc<dyn Reauthenticate>>,
    retry_backoff: Option<Arc<dyn RetryBackoff>>,
    retry_policy: Option<Arc<dyn RetryPolicy>>,
    max_backoff_retries: Option<u32>,
    user_agent: UserAgent,
}

impl ProviderClientBuilder {
    /// Sends requests through `transport`
    ///
    /// Accepts either a plain [`reqwest::Client`] or a client with a
    /// middleware stack. Defaults to `reqwest::Client::default()`.
    pub fn transport(mut self, transport: impl Into<ClientWithMiddleware>) -> Self {
        self.transport = Some(transport.into());
        self
    }

    /// Starts with a known token
    pub fn token(mut self, token: AccessToken) -> Self {
        self.token = Some(token);
        self
    }

    /// Obtains a new token with `reauthenticator` whenever one is rejected
    pub fn reauthenticator(mut self, reauthenticator: impl Reauthenticate + 'static) -> Self {
        self.reauthenticator = Some(Arc::new(reauthenticator));
        self
    }

    /// Waits out rate-limited responses with `backoff`
    pub fn retry_backoff(mut self, backoff: impl RetryBackoff + 'static) -> Self {
        self.retry_backoff = Some(Arc::new(backoff));
        self
    }

    /// Consults `policy` about all other failures
    pub fn retry_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.retry_policy = Some(Arc::new(policy));
        self
    }

    /// Limits the number of rate-limit backoffs for a single request
    ///
    /// Defaults to [`DEFAULT_MAX_BACKOFF_RETRIES`].
    pub fn max_backoff_retries(mut self, max: u32) -> Self {
        self.max_backoff_retries = Some(max);
        self
    }

    /// Sends `user_agent` with every request
    pub fn user_agent(mut self, user_agent: UserAgent) -> Self {
        self.user_agent = user_agent;
        self
    }

    /// Builds the client
    pub fn build(self) -> ProviderClient {
        let tokens = match self.token {
            Some(token) => TokenStore::with_token(token),
            None => TokenStore::new(),
        };

        ProviderClient {
            inner: Arc::new(Inner {
                transport: self
                    .transport
                    .unwrap_or_else(|| ClientWithMiddleware::from(reqwest::Client::default())),
                tokens,
                coordinator: ReauthCoordinator::new(),
                reauthenticator: self.reauthenticator,
                retry_backoff: self.retry_backoff,
                retry_policy: self.retry_policy,
                max_backoff_retries: self
                    .max_backoff_retries
                    .unwrap_or(DEFAULT_MAX_BACKOFF_RETRIES),
                user_agent: self.user_agent,
                throwaway: AtomicBool::new(false),
            }),
        }
    }
}

impl fmt::Debug for ProviderClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderClientBuilder")
            .field("token", &self.token)
            .field("reauthenticates", &self.reauthenticator.is_some())
            .field("backs_off", &self.retry_backoff.is_some())
            .field("retries", &self.retry_policy.is_some())
            .field("max_backoff_retries", &self.max_backoff_retries)
            .field("user_agent", &self.user_agent)
            .finish()
    }
}
