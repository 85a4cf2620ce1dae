use std::{error, fmt, io};

use bytes::Bytes;
use keyway_tokens::ReauthError;
use reqwest::{header::HeaderMap, Method, StatusCode, Url};
use thiserror::Error;

/// A boxed error returned by re-authentication, backoff and retry hooks
pub type BoxError = Box<dyn error::Error + Send + Sync + 'static>;

/// An error while executing a request
#[derive(Debug, Error)]
pub enum Error {
    /// The request options cannot be used together
    #[error("invalid request options")]
    Configuration(#[from] ConfigurationError),
    /// The response status was not one of the accepted codes
    #[error(transparent)]
    UnexpectedResponseCode(Box<UnexpectedResponseCode>),
    /// The token was rejected and obtaining a new one failed
    #[error("unable to re-authenticate after the token was rejected")]
    UnableToReauthenticate {
        /// The response that rejected the token
        original: Box<UnexpectedResponseCode>,
        /// Why re-authentication failed
        #[source]
        source: ReauthError,
    },
    /// The request still failed after re-authenticating
    #[error("request failed after re-authenticating")]
    ErrorAfterReauthentication {
        /// The response that rejected the original token
        original: Box<UnexpectedResponseCode>,
        /// The failure of the request sent with the new token
        #[source]
        source: Box<Error>,
    },
    /// The request could not be sent, or no response was received
    #[error("error sending request")]
    Transport(#[source] reqwest_middleware::Error),
    /// The response body could not be read
    #[error("error reading response body")]
    ResponseBody(#[source] reqwest::Error),
    /// The response body was not valid JSON for the requested type
    #[error("error decoding response body")]
    Decode(#[source] serde_json::Error),
    /// The JSON request body could not be encoded
    #[error("error encoding request body")]
    Encode(#[source] serde_json::Error),
    /// The raw request body could not be read or rewound
    #[error("error reading request body")]
    RequestBody(#[source] io::Error),
    /// A retry was needed, but the request body had already been consumed
    #[error("request body cannot be replayed to retry the request")]
    BodyNotRewindable {
        /// The failure that called for a retry
        #[source]
        original: Box<Error>,
    },
    /// A backoff or retry hook declined to retry
    #[error("retry aborted: {source}")]
    Aborted {
        /// The reason given by the hook
        source: BoxError,
        /// The failure that the hook was asked to retry
        original: Box<Error>,
    },
    /// The request was cancelled by its caller
    #[error("request cancelled")]
    Cancelled,
}

impl Error {
    /// Finds the unexpected response at the root of this error, if any
    ///
    /// Composite errors are searched in the order of the most recent
    /// failure first.
    pub fn unexpected_response(&self) -> Option<&UnexpectedResponseCode> {
        match self {
            Self::UnexpectedResponseCode(response) => Some(response.as_ref()),
            Self::UnableToReauthenticate { original, .. } => Some(original.as_ref()),
            Self::ErrorAfterReauthentication { original, source } => source
                .unexpected_response()
                .or(Some(original.as_ref())),
            Self::BodyNotRewindable { original } | Self::Aborted { original, .. } => {
                original.unexpected_response()
            }
            _ => None,
        }
    }

    /// The status code of the unexpected response at the root of this error
    pub fn status(&self) -> Option<StatusCode> {
        self.unexpected_response().map(UnexpectedResponseCode::actual)
    }

    /// Whether the error was caused by the credentials being rejected
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::UnableToReauthenticate { .. })
            || self.status() == Some(StatusCode::UNAUTHORIZED)
    }
}

impl From<UnexpectedResponseCode> for Error {
    fn from(err: UnexpectedResponseCode) -> Self {
        Self::UnexpectedResponseCode(Box::new(err))
    }
}

/// Request options that cannot be honored
#[derive(Debug, Error)]
pub enum ConfigurationError {
    /// Both a JSON body and a raw body were supplied
    #[error("only one of a JSON body or a raw body may be provided")]
    ConflictingBodies,
    /// The response body was asked to be both decoded and kept open
    #[error("the response body cannot be kept open when it is decoded")]
    KeepBodyWithDecode,
    /// The stored token cannot be sent as a header value
    #[error("the current token is not a valid header value")]
    InvalidToken(#[source] reqwest::header::InvalidHeaderValue),
    /// The configured user agent cannot be sent as a header value
    #[error("the user agent is not a valid header value")]
    InvalidUserAgent(#[source] reqwest::header::InvalidHeaderValue),
}

/// A response whose status code was not one of the accepted codes
#[derive(Debug)]
pub struct UnexpectedResponseCode {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) expected: Vec<StatusCode>,
    pub(crate) actual: StatusCode,
    pub(crate) body: Bytes,
    pub(crate) headers: HeaderMap,
}

impl UnexpectedResponseCode {
    /// The request method
    #[inline]
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// The request URL
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The status codes that would have been accepted
    #[inline]
    pub fn expected(&self) -> &[StatusCode] {
        &self.expected
    }

    /// The status code that was received
    #[inline]
    pub fn actual(&self) -> StatusCode {
        self.actual
    }

    /// The response body
    #[inline]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// The response headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }
}

impl fmt::Display for UnexpectedResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "expected HTTP response code {:?} when accessing [{} {}], but got {} instead",
            self.expected.iter().map(StatusCode::as_u16).collect::<Vec<_>>(),
            self.method,
            self.url,
            self.actual.as_u16(),
        )?;

        if !self.body.is_empty() {
            write!(f, ": {}", String::from_utf8_lossy(&self.body))?;
        }

        Ok(())
    }
}

impl error::Error for UnexpectedResponseCode {}
