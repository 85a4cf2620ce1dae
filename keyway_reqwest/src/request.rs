use std::{
    fmt,
    io::{self, SeekFrom},
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
    time::Duration,
};

use bytes::Bytes;
use reqwest::{
    header::{HeaderMap, HeaderName, HeaderValue},
    Method, StatusCode, Url,
};
use serde::Serialize;
use tokio::{
    io::{AsyncRead, AsyncSeek, AsyncSeekExt, ReadBuf},
    sync::OwnedMutexGuard,
};
use tokio_util::{io::ReaderStream, sync::CancellationToken};

use crate::{ConfigurationError, Error};

/// The status codes accepted for a method when none are given explicitly
pub fn default_ok_codes(method: &Method) -> &'static [StatusCode] {
    match method.as_str() {
        "GET" | "HEAD" => &[StatusCode::OK],
        "POST" | "PUT" => &[StatusCode::CREATED, StatusCode::ACCEPTED],
        "PATCH" => &[StatusCode::OK, StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        "DELETE" => &[StatusCode::ACCEPTED, StatusCode::NO_CONTENT],
        _ => &[],
    }
}

/// Options for a single request
#[derive(Debug, Default)]
pub struct RequestOptions {
    json_body: Option<Bytes>,
    raw_body: Option<RawBody>,
    ok_codes: Option<Vec<StatusCode>>,
    more_headers: HeaderMap,
    omit_headers: Vec<HeaderName>,
    keep_body: bool,
    timeout: Option<Duration>,
    cancellation: Option<CancellationToken>,
}

impl RequestOptions {
    /// Constructs options with no body that accept the method's default codes
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `body` encoded as JSON
    pub fn with_json_body<T>(mut self, body: &T) -> Result<Self, Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = serde_json::to_vec(body).map_err(Error::Encode)?;
        self.json_body = Some(Bytes::from(encoded));
        Ok(self)
    }

    /// Sends `body` as is
    pub fn with_raw_body(mut self, body: impl Into<RawBody>) -> Self {
        self.raw_body = Some(body.into());
        self
    }

    /// Replaces the accepted status codes
    pub fn with_ok_codes<I>(mut self, codes: I) -> Self
    where
        I: IntoIterator<Item = StatusCode>,
    {
        self.ok_codes = Some(codes.into_iter().collect());
        self
    }

    /// Sets a header, replacing the default value for it
    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.more_headers.insert(name, value);
        self
    }

    /// Sets several headers at once
    pub fn with_headers(mut self, headers: HeaderMap) -> Self {
        self.more_headers.extend(headers);
        self
    }

    /// Ensures that `name` is not sent, even if it would be set by default
    ///
    /// The token header is attached after omissions and cannot be removed.
    pub fn without_header(mut self, name: HeaderName) -> Self {
        self.omit_headers.push(name);
        self
    }

    /// Hands back the live response instead of draining its body
    pub fn keep_body(mut self) -> Self {
        self.keep_body = true;
        self
    }

    /// Limits how long each attempt may take
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Abandons the request when `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    /// The encoded JSON body
    pub fn json_body(&self) -> Option<&Bytes> {
        self.json_body.as_ref()
    }

    /// The raw body
    pub fn raw_body(&self) -> Option<&RawBody> {
        self.raw_body.as_ref()
    }

    /// The explicitly accepted status codes
    pub fn ok_codes(&self) -> Option<&[StatusCode]> {
        self.ok_codes.as_deref()
    }

    /// The extra headers
    pub fn more_headers(&self) -> &HeaderMap {
        &self.more_headers
    }

    /// The headers that will not be sent
    pub fn omit_headers(&self) -> &[HeaderName] {
        &self.omit_headers
    }

    /// Whether the live response is handed back
    pub fn keeps_body(&self) -> bool {
        self.keep_body
    }

    /// The timeout of each attempt
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The token that cancels the request
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        self.cancellation.as_ref()
    }

    pub(crate) fn accepts(&self, method: &Method, status: StatusCode) -> bool {
        self.ok_codes()
            .unwrap_or_else(|| default_ok_codes(method))
            .contains(&status)
    }

    pub(crate) fn expected_codes(&self, method: &Method) -> Vec<StatusCode> {
        self.ok_codes()
            .unwrap_or_else(|| default_ok_codes(method))
            .to_vec()
    }

    /// Whether the request can be sent again
    pub fn is_replayable(&self) -> bool {
        self.raw_body.as_ref().map_or(true, RawBody::is_replayable)
    }

    pub(crate) fn validate(&self, decode: bool) -> Result<(), ConfigurationError> {
        if self.json_body.is_some() && self.raw_body.is_some() {
            return Err(ConfigurationError::ConflictingBodies);
        }

        if decode && self.keep_body {
            return Err(ConfigurationError::KeepBodyWithDecode);
        }

        Ok(())
    }

    pub(crate) async fn body(&self) -> Result<Option<reqwest::Body>, Error> {
        if let Some(json) = &self.json_body {
            return Ok(Some(reqwest::Body::from(json.clone())));
        }

        match &self.raw_body {
            Some(raw) => raw.to_body().await.map(Some),
            None => Ok(None),
        }
    }
}

trait SeekableReader: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

impl<T> SeekableReader for T where T: AsyncRead + AsyncSeek + Send + Sync + Unpin {}

struct Seekable {
    reader: Box<dyn SeekableReader>,
    start: Option<u64>,
}

enum RawBodyKind {
    Bytes(Bytes),
    Seekable(Arc<tokio::sync::Mutex<Seekable>>),
    Stream(Mutex<Option<reqwest::Body>>),
}

/// A request body that is sent without encoding
///
/// Whether a request can be retried depends on the body. In-memory bytes
/// can always be sent again. A seekable reader is rewound to where it
/// started before each attempt. A stream can only be sent once.
pub struct RawBody {
    kind: RawBodyKind,
}

impl RawBody {
    /// A body held in memory
    pub fn bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            kind: RawBodyKind::Bytes(bytes.into()),
        }
    }

    /// A body read from a seekable source
    ///
    /// The body starts at the position of the reader when it is first sent.
    /// Each attempt streams from that position, holding the reader until the
    /// attempt's body is dropped.
    pub fn seekable<R>(reader: R) -> Self
    where
        R: AsyncRead + AsyncSeek + Send + Sync + Unpin + 'static,
    {
        Self {
            kind: RawBodyKind::Seekable(Arc::new(tokio::sync::Mutex::new(Seekable {
                reader: Box::new(reader),
                start: None,
            }))),
        }
    }

    /// A body that can only be sent once
    pub fn stream(body: impl Into<reqwest::Body>) -> Self {
        Self {
            kind: RawBodyKind::Stream(Mutex::new(Some(body.into()))),
        }
    }

    /// Whether the body can be sent (again)
    pub fn is_replayable(&self) -> bool {
        match &self.kind {
            RawBodyKind::Bytes(_) | RawBodyKind::Seekable(_) => true,
            RawBodyKind::Stream(body) => body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .is_some(),
        }
    }

    pub(crate) async fn to_body(&self) -> Result<reqwest::Body, Error> {
        match &self.kind {
            RawBodyKind::Bytes(bytes) => Ok(reqwest::Body::from(bytes.clone())),
            RawBodyKind::Seekable(seekable) => {
                // The reader stays locked until the body of this attempt is dropped
                let mut seekable = Arc::clone(seekable).lock_owned().await;
                seekable.rewind().await.map_err(Error::RequestBody)?;
                Ok(reqwest::Body::wrap_stream(ReaderStream::new(Rewound(seekable))))
            }
            RawBodyKind::Stream(body) => body
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
                .ok_or_else(|| {
                    Error::RequestBody(io::Error::new(
                        io::ErrorKind::Other,
                        "streamed request body was already sent",
                    ))
                }),
        }
    }
}

impl Seekable {
    async fn rewind(&mut self) -> io::Result<()> {
        let start = match self.start {
            Some(start) => start,
            None => {
                let start = self.reader.stream_position().await?;
                self.start = Some(start);
                start
            }
        };

        self.reader.seek(SeekFrom::Start(start)).await?;
        Ok(())
    }
}

/// A seekable reader, rewound and locked for one attempt
struct Rewound(OwnedMutexGuard<Seekable>);

impl AsyncRead for Rewound {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().0.reader).poll_read(cx, buf)
    }
}

impl fmt::Debug for RawBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            RawBodyKind::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            RawBodyKind::Seekable(_) => f.write_str("Seekable"),
            RawBodyKind::Stream(_) => f
                .debug_struct("Stream")
                .field("sent", &!self.is_replayable())
                .finish(),
        }
    }
}

impl From<Bytes> for RawBody {
    fn from(bytes: Bytes) -> Self {
        Self::bytes(bytes)
    }
}

impl From<Vec<u8>> for RawBody {
    fn from(bytes: Vec<u8>) -> Self {
        Self::bytes(bytes)
    }
}

impl From<String> for RawBody {
    fn from(text: String) -> Self {
        Self::bytes(text)
    }
}

impl From<&'static str> for RawBody {
    fn from(text: &'static str) -> Self {
        Self::bytes(text)
    }
}

/// The body of an accepted response
#[derive(Debug)]
pub enum Body {
    /// The body was read to the end
    Drained(Bytes),
    /// The body was left unread, as requested with
    /// [`RequestOptions::keep_body()`]
    Kept(reqwest::Response),
}

/// An accepted response
#[derive(Debug)]
pub struct Response {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) body: Body,
}

impl Response {
    /// The response status
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL of the response
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The response body
    #[inline]
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// The drained response body, if it was read
    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.body {
            Body::Drained(bytes) => Some(bytes),
            Body::Kept(_) => None,
        }
    }

    /// Takes the response body
    pub fn into_body(self) -> Body {
        self.body
    }
}

/// An accepted response with a decoded JSON body
#[derive(Debug)]
pub struct JsonResponse<T> {
    pub(crate) status: StatusCode,
    pub(crate) headers: HeaderMap,
    pub(crate) url: Url,
    pub(crate) value: Option<T>,
}

impl<T> JsonResponse<T> {
    /// The response status
    #[inline]
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// The response headers
    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// The final URL of the response
    #[inline]
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// The decoded body
    ///
    /// A `204 No Content` response is not decoded and has no value.
    #[inline]
    pub fn value(&self) -> Option<&T> {
        self.value.as_ref()
    }

    /// Takes the decoded body
    pub fn into_value(self) -> Option<T> {
        self.value
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use http_body::Body as _;

    use super::*;

    async fn collect(body: reqwest::Body) -> Vec<u8> {
        let mut body = std::pin::pin!(body);
        let mut contents = Vec::new();
        while let Some(frame) = std::future::poll_fn(|cx| body.as_mut().poll_frame(cx)).await {
            if let Ok(data) = frame.unwrap().into_data() {
                contents.extend_from_slice(&data);
            }
        }
        contents
    }

    async fn sent(options: &RequestOptions) -> Vec<u8> {
        collect(options.body().await.unwrap().unwrap()).await
    }

    mod default_ok_codes {
        use super::*;

        #[test]
        fn reads_expect_ok() {
            assert_eq!(default_ok_codes(&Method::GET), &[StatusCode::OK]);
            assert_eq!(default_ok_codes(&Method::HEAD), &[StatusCode::OK]);
        }

        #[test]
        fn writes_expect_created_or_accepted() {
            let expected = [StatusCode::CREATED, StatusCode::ACCEPTED];
            assert_eq!(default_ok_codes(&Method::POST), &expected);
            assert_eq!(default_ok_codes(&Method::PUT), &expected);
        }

        #[test]
        fn patch_and_delete_accept_no_content() {
            assert!(default_ok_codes(&Method::PATCH).contains(&StatusCode::NO_CONTENT));
            assert_eq!(
                default_ok_codes(&Method::DELETE),
                &[StatusCode::ACCEPTED, StatusCode::NO_CONTENT]
            );
        }

        #[test]
        fn other_methods_accept_nothing() {
            assert!(default_ok_codes(&Method::OPTIONS).is_empty());
        }
    }

    mod when_validating {
        use super::*;

        #[test]
        fn both_bodies_conflict() {
            let options = RequestOptions::new()
                .with_json_body(&serde_json::json!({"name": "vm"}))
                .unwrap()
                .with_raw_body("raw");

            assert!(matches!(
                options.validate(false),
                Err(ConfigurationError::ConflictingBodies)
            ));
        }

        #[test]
        fn kept_body_cannot_be_decoded() {
            let options = RequestOptions::new().keep_body();

            assert!(options.validate(false).is_ok());
            assert!(matches!(
                options.validate(true),
                Err(ConfigurationError::KeepBodyWithDecode)
            ));
        }

        #[test]
        fn explicit_ok_codes_replace_the_defaults() {
            let options = RequestOptions::new().with_ok_codes([StatusCode::NO_CONTENT]);

            assert!(options.accepts(&Method::GET, StatusCode::NO_CONTENT));
            assert!(!options.accepts(&Method::GET, StatusCode::OK));
        }
    }

    mod raw_body {
        use super::*;

        #[tokio::test]
        async fn bytes_are_sent_every_time() {
            let options = RequestOptions::new().with_raw_body("payload");

            assert_eq!(sent(&options).await, b"payload");
            assert!(options.is_replayable());
            assert_eq!(sent(&options).await, b"payload");
        }

        #[tokio::test]
        async fn seekable_reader_is_rewound_to_where_it_started() {
            let mut reader = Cursor::new(b"skip:payload".to_vec());
            reader.set_position(5);
            let options = RequestOptions::new().with_raw_body(RawBody::seekable(reader));

            assert_eq!(sent(&options).await, b"payload");
            assert!(options.is_replayable());
            assert_eq!(sent(&options).await, b"payload");
        }

        #[tokio::test]
        async fn stream_is_sent_only_once() {
            let options = RequestOptions::new().with_raw_body(RawBody::stream("once"));

            assert!(options.is_replayable());
            assert_eq!(sent(&options).await, b"once");
            assert!(!options.is_replayable());
            assert!(matches!(options.body().await, Err(Error::RequestBody(_))));
        }
    }

    #[tokio::test]
    async fn json_body_is_encoded_once() {
        let options = RequestOptions::new()
            .with_json_body(&serde_json::json!({"server": {"name": "vm"}}))
            .unwrap();

        assert_eq!(sent(&options).await, br#"{"server":{"name":"vm"}}"#);
    }
}
