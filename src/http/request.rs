//! HTTP/1.1 request parsing using the [`httparse`] crate.

use bytes::BytesMut;
use thiserror::Error;

use super::body::{Body, BodyDecoder, BodyError, Framing};
use super::{Headers, Method, StatusCode};

/// Errors that can occur while parsing an HTTP/1.1 request.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("request is incomplete: more data needed")]
    Incomplete,

    #[error("HTTP parse error: {0}")]
    Parse(#[from] httparse::Error),

    #[error("missing required field: {field}")]
    MissingField { field: &'static str },

    #[error("invalid Content-Length header: {value:?}")]
    InvalidContentLength { value: String },

    #[error("both Content-Length and Transfer-Encoding are present")]
    ConflictingFraming,

    #[error("unsupported Transfer-Encoding: {value:?}")]
    UnsupportedTransferEncoding { value: String },

    #[error("malformed body: {0}")]
    Body(#[from] BodyError),
}

impl RequestError {
    /// Status to answer with when this error ends a connection.
    pub fn status(&self) -> StatusCode {
        match self {
            Self::UnsupportedTransferEncoding { .. } => StatusCode::NotImplemented,
            _ => StatusCode::BadRequest,
        }
    }
}

/// A parsed HTTP/1.1 request.
///
/// [`Request::parse_head`] reads only the head and reports how the body is
/// framed; the server then streams the body into [`Request::into_body`] as it
/// arrives. [`Request::parse`] is the all-in-memory variant.
///
/// # Examples
///
/// ```
/// use swapgate::http::request::Request;
///
/// let raw = b"GET /api/proxy/swap/v6.0/1/quote?amount=10 HTTP/1.1\r\nHost: localhost\r\n\r\n";
/// let (request, _offset) = Request::parse(raw).unwrap();
///
/// assert_eq!(request.method().as_str(), "GET");
/// assert_eq!(request.path(), "/api/proxy/swap/v6.0/1/quote");
/// assert_eq!(request.query_string(), Some("amount=10"));
/// assert_eq!(request.headers().get("host"), Some("localhost"));
/// ```
#[derive(Debug)]
pub struct Request {
    method: Method,
    path: String,
    /// HTTP minor version: 0 for HTTP/1.0, 1 for HTTP/1.1.
    version: u8,
    headers: Headers,
    query: Option<String>,
    framing: Framing,
    body: Body,
}

impl Request {
    /// Maximum number of headers we support per request.
    const MAX_HEADERS: usize = 64;

    /// Parses the request line and headers from the start of `buf`.
    ///
    /// Returns the request, with an empty body, and the length of the head
    /// (up to and including the blank line). Bytes after that belong to the
    /// body described by [`Request::framing`].
    ///
    /// # Errors
    ///
    /// - [`RequestError::Incomplete`]: the head is not fully buffered yet.
    /// - [`RequestError::Parse`]: the data is malformed and cannot be parsed.
    /// - [`RequestError::MissingField`]: a required field (method, path, version) is absent.
    /// - [`RequestError::InvalidContentLength`]: `Content-Length` is not a number,
    ///   or repeated with different values.
    /// - [`RequestError::ConflictingFraming`]: both `Content-Length` and
    ///   `Transfer-Encoding` are present.
    /// - [`RequestError::UnsupportedTransferEncoding`]: anything but `chunked`.
    pub fn parse_head(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let mut headers = [httparse::EMPTY_HEADER; Self::MAX_HEADERS];
        let mut raw_req = httparse::Request::new(&mut headers);

        let head_len = match raw_req.parse(buf)? {
            httparse::Status::Complete(offset) => offset,
            httparse::Status::Partial => return Err(RequestError::Incomplete),
        };

        let Ok(method) = raw_req
            .method
            .ok_or(RequestError::MissingField { field: "method" })?
            .parse::<Method>();

        let raw_path = raw_req
            .path
            .ok_or(RequestError::MissingField { field: "path" })?;

        let (path, query) = match raw_path.split_once('?') {
            Some((path, query)) => (path.to_owned(), Some(query.to_owned())),
            None => (raw_path.to_owned(), None),
        };

        let version = raw_req
            .version
            .ok_or(RequestError::MissingField { field: "version" })?;

        let mut header_map = Headers::with_capacity(raw_req.headers.len());
        for header in raw_req.headers.iter() {
            if let Ok(value) = std::str::from_utf8(header.value) {
                header_map.insert(header.name, value);
            }
        }

        let framing = framing_of(&header_map)?;

        Ok((
            Self {
                method,
                path,
                version,
                headers: header_map,
                query,
                framing,
                body: Body::empty(),
            },
            head_len,
        ))
    }

    /// Parses a complete request, body included, from `buf`.
    ///
    /// Returns the request and the number of bytes it occupied; anything past
    /// that offset is the next pipelined request.
    ///
    /// # Errors
    ///
    /// As [`parse_head`](Self::parse_head), plus [`RequestError::Incomplete`]
    /// while the body is still short and [`RequestError::Body`] for malformed
    /// chunked encoding.
    pub fn parse(buf: &[u8]) -> Result<(Self, usize), RequestError> {
        let (mut request, head_len) = Self::parse_head(buf)?;

        let mut rest = BytesMut::from(&buf[head_len..]);
        let mut decoder = BodyDecoder::new(request.framing);
        let mut body = BytesMut::new();
        while let Some(piece) = decoder.decode(&mut rest)? {
            body.extend_from_slice(&piece);
        }
        if !decoder.is_done() {
            return Err(RequestError::Incomplete);
        }

        request.body = Body::Full(body.freeze());
        Ok((request, buf.len() - rest.len()))
    }

    /// Replaces the body.
    #[must_use]
    pub fn with_body(mut self, body: impl Into<Body>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the HTTP method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Returns the request path (without the query string).
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Returns the HTTP minor version number (0 = HTTP/1.0, 1 = HTTP/1.1).
    pub fn version(&self) -> u8 {
        self.version
    }

    /// Returns the request headers.
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    /// Returns the raw query string (without the leading `?`), if any.
    pub fn query_string(&self) -> Option<&str> {
        self.query.as_deref()
    }

    /// How the body was delimited on the wire.
    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// Returns the body without consuming it.
    pub fn body(&self) -> &Body {
        &self.body
    }

    /// Takes the body, which may still be arriving.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Returns `true` if the connection should be kept alive after this request.
    ///
    /// HTTP/1.1 defaults to keep-alive. HTTP/1.0 defaults to close unless
    /// `Connection: keep-alive` is explicitly set.
    pub fn is_keep_alive(&self) -> bool {
        match self.headers.get("connection") {
            Some(conn) => conn.eq_ignore_ascii_case("keep-alive"),
            None => self.version == 1, // HTTP/1.1 default: keep-alive
        }
    }

    /// Returns `true` if the client waits for `100 Continue` before sending
    /// the body.
    pub fn expects_continue(&self) -> bool {
        self.version == 1
            && self
                .headers
                .get("expect")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("100-continue"))
    }
}

fn framing_of(headers: &Headers) -> Result<Framing, RequestError> {
    let mut lengths = headers.get_all("content-length");
    let length = match lengths.next() {
        Some(first) => {
            let parse = |v: &str| {
                v.trim()
                    .parse::<u64>()
                    .map_err(|_| RequestError::InvalidContentLength { value: v.to_owned() })
            };
            let n = parse(first)?;
            for other in lengths {
                if parse(other)? != n {
                    return Err(RequestError::InvalidContentLength {
                        value: other.to_owned(),
                    });
                }
            }
            Some(n)
        }
        None => None,
    };

    let codings: Vec<&str> = headers
        .get_all("transfer-encoding")
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .collect();

    match (codings.as_slice(), length) {
        ([], Some(n)) => Ok(Framing::Length(n)),
        ([], None) => Ok(Framing::Empty),
        (_, Some(_)) => Err(RequestError::ConflictingFraming),
        ([coding], None) if coding.eq_ignore_ascii_case("chunked") => Ok(Framing::Chunked),
        (_, None) => Err(RequestError::UnsupportedTransferEncoding {
            value: codings.join(", "),
        }),
    }
}
