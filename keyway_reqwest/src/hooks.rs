//! Pluggable re-authentication, backoff and retry behavior
//!
//! Each hook returns `Ok(())` to have the request sent again, or an error to
//! give up. Hooks that want to wait before the next attempt do so before
//! returning.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use keyway_tokens::{
    backoff::ErrorBackoffConfig,
    jitter::{JitterSource, NullJitter},
};
use reqwest::{header::RETRY_AFTER, Method, StatusCode, Url};

use crate::{BoxError, Error, ProviderClient, RequestOptions, UnexpectedResponseCode};

/// Obtains a new token after the current one was rejected
///
/// On success, implementations must install the new token with
/// [`ProviderClient::set_token_and_auth_result()`] or
/// [`ProviderClient::set_token()`]. Calls to the identity service should
/// be made through [`ProviderClient::throwaway()`], which neither waits on
/// nor triggers re-authentication.
#[async_trait]
pub trait Reauthenticate: Send + Sync {
    /// Authenticates again on behalf of `client`
    async fn reauthenticate(&self, client: &ProviderClient) -> Result<(), BoxError>;
}

/// Waits out a rate-limited (`429` or `498`) response
#[async_trait]
pub trait RetryBackoff: Send + Sync {
    /// Called before the `attempt`-th retry of a request
    async fn backoff(&self, failure: &UnexpectedResponseCode, attempt: u32)
        -> Result<(), BoxError>;
}

/// Decides whether a failed request is sent again
///
/// This is consulted for every failure that was not handled by
/// re-authentication or rate-limit backoff.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Called before the `attempt`-th retry of a request
    async fn retry(&self, context: &RetryContext<'_>, attempt: u32) -> Result<(), BoxError>;
}

#[async_trait]
impl<T> Reauthenticate for Arc<T>
where
    T: Reauthenticate + ?Sized,
{
    async fn reauthenticate(&self, client: &ProviderClient) -> Result<(), BoxError> {
        (**self).reauthenticate(client).await
    }
}

#[async_trait]
impl<T> RetryBackoff for Arc<T>
where
    T: RetryBackoff + ?Sized,
{
    async fn backoff(
        &self,
        failure: &UnexpectedResponseCode,
        attempt: u32,
    ) -> Result<(), BoxError> {
        (**self).backoff(failure, attempt).await
    }
}

#[async_trait]
impl<T> RetryPolicy for Arc<T>
where
    T: RetryPolicy + ?Sized,
{
    async fn retry(&self, context: &RetryContext<'_>, attempt: u32) -> Result<(), BoxError> {
        (**self).retry(context, attempt).await
    }
}

/// The request that failed and why
#[derive(Debug)]
pub struct RetryContext<'a> {
    pub(crate) method: &'a Method,
    pub(crate) url: &'a Url,
    pub(crate) options: &'a RequestOptions,
    pub(crate) error: &'a Error,
}

impl<'a> RetryContext<'a> {
    /// The request method
    #[inline]
    pub fn method(&self) -> &'a Method {
        self.method
    }

    /// The request URL
    #[inline]
    pub fn url(&self) -> &'a Url {
        self.url
    }

    /// The options the request was made with
    #[inline]
    pub fn options(&self) -> &'a RequestOptions {
        self.options
    }

    /// The failure of the last attempt
    #[inline]
    pub fn error(&self) -> &'a Error {
        self.error
    }
}

/// Sleeps before each retry of a rate-limited request
///
/// When the response carries a `Retry-After` header in seconds, that delay
/// is used, up to the maximum delay of the schedule. Otherwise the delay
/// grows exponentially with each attempt.
#[derive(Clone, Copy, Debug, Default)]
pub struct ExponentialBackoff<J = NullJitter> {
    config: ErrorBackoffConfig,
    jitter: J,
}

impl ExponentialBackoff {
    /// Constructs a backoff following `config`
    pub fn new(config: ErrorBackoffConfig) -> Self {
        Self {
            config,
            jitter: NullJitter,
        }
    }
}

impl<J> ExponentialBackoff<J> {
    /// Jitters every delay with `jitter`
    pub fn with_jitter<K: JitterSource>(self, jitter: K) -> ExponentialBackoff<K> {
        ExponentialBackoff {
            config: self.config,
            jitter,
        }
    }
}

impl<J: JitterSource> ExponentialBackoff<J> {
    fn delay_for(&self, failure: &UnexpectedResponseCode, attempt: u32) -> Duration {
        let delay = retry_after(failure)
            .map(|delay| delay.min(self.config.max_error_delay()))
            .unwrap_or_else(|| self.config.delay_for(attempt));
        self.jitter.jitter(delay)
    }
}

#[async_trait]
impl<J> RetryBackoff for ExponentialBackoff<J>
where
    J: JitterSource + Send + Sync,
{
    async fn backoff(
        &self,
        failure: &UnexpectedResponseCode,
        attempt: u32,
    ) -> Result<(), BoxError> {
        let delay = self.delay_for(failure, attempt);
        tracing::debug!(
            status = failure.actual().as_u16(),
            attempt,
            delay.ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "rate limited, backing off"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

fn retry_after(failure: &UnexpectedResponseCode) -> Option<Duration> {
    let value = failure.headers().get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse().ok().map(Duration::from_secs)
}

/// Retries transport failures and server errors a fixed number of times
#[derive(Clone, Copy, Debug)]
pub struct ExponentialRetry<J = NullJitter> {
    max_attempts: u32,
    config: ErrorBackoffConfig,
    jitter: J,
}

impl ExponentialRetry {
    /// Constructs a policy that retries up to `max_attempts` times
    pub fn new(max_attempts: u32, config: ErrorBackoffConfig) -> Self {
        Self {
            max_attempts,
            config,
            jitter: NullJitter,
        }
    }
}

impl<J> ExponentialRetry<J> {
    /// Jitters every delay with `jitter`
    pub fn with_jitter<K: JitterSource>(self, jitter: K) -> ExponentialRetry<K> {
        ExponentialRetry {
            max_attempts: self.max_attempts,
            config: self.config,
            jitter,
        }
    }
}

fn is_transient(error: &Error) -> bool {
    match error {
        Error::Transport(_) | Error::ResponseBody(_) => true,
        Error::UnexpectedResponseCode(failure) => failure.actual().is_server_error(),
        _ => false,
    }
}

/// The error returned when a failure is not worth retrying
#[derive(Debug, thiserror::Error)]
pub enum RetryRefused {
    /// The failure is not transient
    #[error("failure is not retryable")]
    NotRetryable,
    /// The retry limit was reached
    #[error("gave up after {0} retries")]
    Exhausted(u32),
}

#[async_trait]
impl<J> RetryPolicy for ExponentialRetry<J>
where
    J: JitterSource + Send + Sync,
{
    async fn retry(&self, context: &RetryContext<'_>, attempt: u32) -> Result<(), BoxError> {
        if !is_transient(context.error()) {
            return Err(RetryRefused::NotRetryable.into());
        }

        if attempt > self.max_attempts {
            return Err(RetryRefused::Exhausted(self.max_attempts).into());
        }

        let delay = self.jitter.jitter(self.config.delay_for(attempt));
        tracing::debug!(
            method = %context.method(),
            url = %context.url(),
            attempt,
            delay.ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "retrying after transient failure"
        );
        tokio::time::sleep(delay).await;
        Ok(())
    }
}

/// Whether the status means the client is being rate limited
pub(crate) fn is_rate_limited(status: StatusCode) -> bool {
    // 498 is not a registered status, but some gateways use it for
    // rejected request rates
    status == StatusCode::TOO_MANY_REQUESTS || status.as_u16() == 498
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use reqwest::header::{HeaderMap, HeaderValue};

    use super::*;

    fn rate_limited(retry_after: Option<&'static str>) -> UnexpectedResponseCode {
        let mut headers = HeaderMap::new();
        if let Some(value) = retry_after {
            headers.insert(RETRY_AFTER, HeaderValue::from_static(value));
        }

        UnexpectedResponseCode {
            method: Method::GET,
            url: Url::parse("https://compute.example.com/v2.1/servers").unwrap(),
            expected: vec![StatusCode::OK],
            actual: StatusCode::TOO_MANY_REQUESTS,
            body: Bytes::new(),
            headers,
        }
    }

    #[test]
    fn rate_limit_statuses() {
        assert!(is_rate_limited(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_rate_limited(StatusCode::from_u16(498).unwrap()));
        assert!(!is_rate_limited(StatusCode::SERVICE_UNAVAILABLE));
    }

    mod exponential_backoff {
        use super::*;

        #[test]
        fn follows_the_schedule_without_retry_after() {
            let backoff = ExponentialBackoff::new(ErrorBackoffConfig::default());
            let failure = rate_limited(None);

            assert_eq!(backoff.delay_for(&failure, 1), Duration::from_millis(100));
            assert_eq!(backoff.delay_for(&failure, 3), Duration::from_millis(400));
        }

        #[test]
        fn honors_retry_after_seconds() {
            let backoff = ExponentialBackoff::new(ErrorBackoffConfig::default());
            let failure = rate_limited(Some("3"));

            assert_eq!(backoff.delay_for(&failure, 1), Duration::from_secs(3));
        }

        #[test]
        fn caps_retry_after_at_the_maximum_delay() {
            let backoff = ExponentialBackoff::new(ErrorBackoffConfig::default());
            let failure = rate_limited(Some("3600"));

            assert_eq!(backoff.delay_for(&failure, 1), Duration::from_secs(15));
        }

        #[test]
        fn ignores_retry_after_dates() {
            let backoff = ExponentialBackoff::new(ErrorBackoffConfig::default());
            let failure = rate_limited(Some("Wed, 21 Oct 2015 07:28:00 GMT"));

            assert_eq!(backoff.delay_for(&failure, 2), Duration::from_millis(200));
        }

        #[tokio::test(start_paused = true)]
        async fn sleeps_before_allowing_the_retry() {
            let backoff = ExponentialBackoff::new(ErrorBackoffConfig::default());
            let failure = rate_limited(Some("2"));

            let started = tokio::time::Instant::now();
            backoff.backoff(&failure, 1).await.unwrap();

            assert!(started.elapsed() >= Duration::from_secs(2));
        }
    }

    mod exponential_retry {
        use super::*;

        static GET: Method = Method::GET;

        fn context<'a>(
            error: &'a Error,
            url: &'a Url,
            options: &'a RequestOptions,
        ) -> RetryContext<'a> {
            RetryContext {
                method: &GET,
                url,
                options,
                error,
            }
        }

        #[tokio::test(start_paused = true)]
        async fn retries_server_errors() {
            let policy = ExponentialRetry::new(2, ErrorBackoffConfig::default());
            let mut failure = rate_limited(None);
            failure.actual = StatusCode::BAD_GATEWAY;
            let error = Error::from(failure);
            let url = Url::parse("https://compute.example.com/").unwrap();
            let options = RequestOptions::new();

            policy
                .retry(&context(&error, &url, &options), 1)
                .await
                .unwrap();
            policy
                .retry(&context(&error, &url, &options), 2)
                .await
                .unwrap();
        }

        #[tokio::test]
        async fn gives_up_after_the_limit() {
            let policy = ExponentialRetry::new(2, ErrorBackoffConfig::default());
            let mut failure = rate_limited(None);
            failure.actual = StatusCode::SERVICE_UNAVAILABLE;
            let error = Error::from(failure);
            let url = Url::parse("https://compute.example.com/").unwrap();
            let options = RequestOptions::new();

            let refused = policy
                .retry(&context(&error, &url, &options), 3)
                .await
                .unwrap_err();
            assert_eq!(refused.to_string(), "gave up after 2 retries");
        }

        #[tokio::test]
        async fn refuses_client_errors() {
            let policy = ExponentialRetry::new(5, ErrorBackoffConfig::default());
            let mut failure = rate_limited(None);
            failure.actual = StatusCode::NOT_FOUND;
            let error = Error::from(failure);
            let url = Url::parse("https://compute.example.com/").unwrap();
            let options = RequestOptions::new();

            let refused = policy
                .retry(&context(&error, &url, &options), 1)
                .await
                .unwrap_err();
            assert_eq!(refused.to_string(), "failure is not retryable");
        }
    }
}
