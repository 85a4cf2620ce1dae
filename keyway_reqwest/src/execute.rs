//! The request loop
//!
//! Every attempt re-sends the complete request. A failed attempt is handed
//! to the first recovery step that applies:
//!
//! 1. a rejected token (`401`) is replaced once per request,
//! 2. a rate-limited response (`429` or `498`) is backed off, up to the
//!    client's limit,
//! 3. any other response, transport or decoding failure goes to the retry
//!    policy.
//!
//! A failure that no step recovers from is returned to the caller.

use std::future::Future;

use keyway_tokens::AccessToken;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, USER_AGENT},
    Method, StatusCode, Url,
};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::{
    hooks::is_rate_limited, Body, ConfigurationError, Error, JsonResponse, ProviderClient,
    RequestOptions, Response, RetryContext, UnexpectedResponseCode, AUTH_TOKEN_HEADER,
};

const APPLICATION_JSON: &str = "application/json";

/// Bookkeeping for a single call, across all of its attempts
#[derive(Debug, Default)]
struct RequestState {
    /// The response that rejected the original token, once the request has
    /// re-authenticated
    reauthenticated: Option<Box<UnexpectedResponseCode>>,
    /// Backoffs and retries taken so far
    retries: u32,
    /// The token sent with the last attempt
    sent_token: Option<AccessToken>,
}

#[tracing::instrument(level = "debug", skip_all, fields(method = %method, url = %url))]
pub(crate) async fn execute<R, F>(
    client: &ProviderClient,
    method: Method,
    url: Url,
    options: &RequestOptions,
    decode: bool,
    finish: F,
) -> Result<R, Error>
where
    F: Fn(Response) -> Result<R, Error> + Send + Sync,
    R: Send,
{
    options.validate(decode)?;

    let mut state = RequestState::default();
    loop {
        let error = match attempt(client, &method, &url, options, &mut state)
            .await
            .and_then(&finish)
        {
            Ok(finished) => return Ok(finished),
            Err(error) => error,
        };

        if let Err(error) = recover(client, error, &method, &url, options, &mut state).await {
            return Err(match state.reauthenticated.take() {
                Some(original) => Error::ErrorAfterReauthentication {
                    original,
                    source: Box::new(error),
                },
                None => error,
            });
        }
    }
}

pub(crate) fn decode<T: DeserializeOwned>(response: Response) -> Result<JsonResponse<T>, Error> {
    let value = match response.body {
        Body::Drained(_) if response.status == StatusCode::NO_CONTENT => None,
        Body::Drained(bytes) => Some(serde_json::from_slice(&bytes).map_err(Error::Decode)?),
        Body::Kept(_) => return Err(ConfigurationError::KeepBodyWithDecode.into()),
    };

    Ok(JsonResponse {
        status: response.status,
        headers: response.headers,
        url: response.url,
        value,
    })
}

async fn attempt(
    client: &ProviderClient,
    method: &Method,
    url: &Url,
    options: &RequestOptions,
    state: &mut RequestState,
) -> Result<Response, Error> {
    let headers = headers(client, options, state).await?;

    let mut request = reqwest::Request::new(method.clone(), url.clone());
    *request.headers_mut() = headers;
    *request.body_mut() = options.body().await?;
    *request.timeout_mut() = options.timeout();

    tracing::trace!(retries = state.retries, "sending request");
    let response = cancellable(
        options.cancellation(),
        client.inner.transport.execute(request),
    )
    .await?
    .map_err(Error::Transport)?;

    let status = response.status();
    let headers = response.headers().clone();
    tracing::debug!(response.status = status.as_u16(), "received response");

    if !options.accepts(method, status) {
        // The body only adds detail to the error, so a failed read is ignored
        let body = cancellable(options.cancellation(), response.bytes())
            .await?
            .unwrap_or_default();

        return Err(UnexpectedResponseCode {
            method: method.clone(),
            url: url.clone(),
            expected: options.expected_codes(method),
            actual: status,
            body,
            headers,
        }
        .into());
    }

    let response_url = response.url().clone();
    let body = if options.keeps_body() {
        Body::Kept(response)
    } else {
        let bytes = cancellable(options.cancellation(), response.bytes())
            .await?
            .map_err(Error::ResponseBody)?;
        Body::Drained(bytes)
    };

    Ok(Response {
        status,
        headers,
        url: response_url,
        body,
    })
}

/// Builds the headers of an attempt
///
/// Defaults are overridden by the extra headers of the request, and omitted
/// headers are removed after that. The current token is attached last, once
/// no re-authentication is running, and replaces any value the request set.
async fn headers(
    client: &ProviderClient,
    options: &RequestOptions,
    state: &mut RequestState,
) -> Result<HeaderMap, Error> {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static(APPLICATION_JSON));
    headers.insert(
        USER_AGENT,
        client
            .inner
            .user_agent
            .header_value()
            .map_err(ConfigurationError::InvalidUserAgent)?,
    );
    if options.json_body().is_some() {
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
    }

    for name in options.more_headers().keys() {
        headers.remove(name);
    }
    for (name, value) in options.more_headers() {
        headers.append(name, value.clone());
    }
    for name in options.omit_headers() {
        headers.remove(name);
    }

    if !client.is_throwaway() {
        cancellable(options.cancellation(), client.inner.coordinator.wait_idle()).await?;

        if let Some(token) = client.token() {
            let mut value =
                HeaderValue::from_str(token.as_str()).map_err(ConfigurationError::InvalidToken)?;
            value.set_sensitive(true);
            headers.insert(AUTH_TOKEN_HEADER, value);
        }
    }

    state.sent_token = headers
        .get(AUTH_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(|value| AccessToken::new(value.to_owned()));

    Ok(headers)
}

fn is_retryable(error: &Error) -> bool {
    matches!(
        error,
        Error::UnexpectedResponseCode(_)
            | Error::Transport(_)
            | Error::ResponseBody(_)
            | Error::Decode(_)
    )
}

/// Prepares the next attempt, or returns the error to give up with
async fn recover(
    client: &ProviderClient,
    error: Error,
    method: &Method,
    url: &Url,
    options: &RequestOptions,
    state: &mut RequestState,
) -> Result<(), Error> {
    if !is_retryable(&error) {
        return Err(error);
    }

    match error {
        Error::UnexpectedResponseCode(failure)
            if failure.actual == StatusCode::UNAUTHORIZED
                && state.reauthenticated.is_none()
                && client.inner.reauthenticator.is_some() =>
        {
            reauthenticate(client, failure, options, state).await
        }
        Error::UnexpectedResponseCode(failure)
            if is_rate_limited(failure.actual)
                && client.inner.retry_backoff.is_some()
                && state.retries < client.inner.max_backoff_retries =>
        {
            back_off(client, failure, options, state).await
        }
        error => retry(client, error, method, url, options, state).await,
    }
}

async fn reauthenticate(
    client: &ProviderClient,
    failure: Box<UnexpectedResponseCode>,
    options: &RequestOptions,
    state: &mut RequestState,
) -> Result<(), Error> {
    if !options.is_replayable() {
        return Err(Error::BodyNotRewindable {
            original: Box::new(Error::UnexpectedResponseCode(failure)),
        });
    }

    tracing::debug!("token rejected, re-authenticating");
    let previous = state.sent_token.take();
    match cancellable(
        options.cancellation(),
        client.reauthenticate(previous.as_deref()),
    )
    .await?
    {
        Ok(()) => {
            state.reauthenticated = Some(failure);
            Ok(())
        }
        Err(source) => Err(Error::UnableToReauthenticate {
            original: failure,
            source,
        }),
    }
}

async fn back_off(
    client: &ProviderClient,
    failure: Box<UnexpectedResponseCode>,
    options: &RequestOptions,
    state: &mut RequestState,
) -> Result<(), Error> {
    let Some(backoff) = &client.inner.retry_backoff else {
        return Err(Error::UnexpectedResponseCode(failure));
    };

    if !options.is_replayable() {
        return Err(Error::BodyNotRewindable {
            original: Box::new(Error::UnexpectedResponseCode(failure)),
        });
    }

    state.retries += 1;
    tracing::debug!(
        status = failure.actual.as_u16(),
        attempt = state.retries,
        "rate limited"
    );

    match cancellable(options.cancellation(), backoff.backoff(&failure, state.retries)).await? {
        Ok(()) => Ok(()),
        Err(source) => {
            tracing::warn!(
                error = (&*source as &dyn std::error::Error),
                "backoff declined to retry"
            );
            Err(Error::Aborted {
                source,
                original: Box::new(Error::UnexpectedResponseCode(failure)),
            })
        }
    }
}

async fn retry(
    client: &ProviderClient,
    error: Error,
    method: &Method,
    url: &Url,
    options: &RequestOptions,
    state: &mut RequestState,
) -> Result<(), Error> {
    let Some(policy) = &client.inner.retry_policy else {
        return Err(error);
    };

    if !options.is_replayable() {
        return Err(Error::BodyNotRewindable {
            original: Box::new(error),
        });
    }

    state.retries += 1;
    let outcome = {
        let context = RetryContext {
            method,
            url,
            options,
            error: &error,
        };
        cancellable(options.cancellation(), policy.retry(&context, state.retries)).await?
    };

    match outcome {
        Ok(()) => Ok(()),
        Err(source) => {
            tracing::warn!(
                error = (&*source as &dyn std::error::Error),
                "retry policy declined to retry"
            );
            Err(Error::Aborted {
                source,
                original: Box::new(error),
            })
        }
    }
}

/// Runs `future` unless the request is cancelled first
async fn cancellable<F>(token: Option<&CancellationToken>, future: F) -> Result<F::Output, Error>
where
    F: Future,
{
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => {
                tracing::debug!("request cancelled");
                Err(Error::Cancelled)
            }
            output = future => Ok(output),
        },
        None => Ok(future.await),
    }
}
