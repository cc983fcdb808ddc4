//! HTTP/1.1 response builder.
//!
//! Provides a fluent builder API for constructing HTTP responses and writing
//! them to a socket. A response body is either fully buffered (framed with
//! `Content-Length`) or a byte stream relayed as it arrives (framed with
//! chunked transfer-encoding).

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::body::Body;
use super::{Headers, StatusCode};

/// An HTTP/1.1 response, ready to be written to a connection.
///
/// # Examples
///
/// ```
/// use swapgate::http::{Response, StatusCode};
///
/// let response = Response::new(StatusCode::Ok)
///     .header("Content-Type", "application/json")
///     .body(r#"{"status":"ok"}"#);
///
/// assert_eq!(response.status(), StatusCode::Ok);
/// assert_eq!(response.header_map().get("content-type"), Some("application/json"));
/// assert!(!response.is_streamed());
/// ```
#[derive(Debug)]
pub struct Response {
    status: StatusCode,
    headers: Headers,
    body: Body,
    keep_alive: bool,
}

impl Response {
    /// Creates a new response with the given status and an empty body.
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: Headers::new(),
            body: Body::empty(),
            keep_alive: true,
        }
    }

    /// Creates a `application/json` response from any serializable value.
    ///
    /// Serialization of the crate's own payload types cannot fail; should a
    /// foreign type fail anyway, a `500` with a plain-text reason is returned.
    pub fn json<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Self {
        match serde_json::to_vec(value) {
            Ok(bytes) => Self::new(status)
                .header("Content-Type", "application/json")
                .body_bytes(bytes),
            Err(e) => Self::new(StatusCode::InternalServerError)
                .body(format!("failed to serialize response: {e}")),
        }
    }

    /// Appends a response header. Multiple calls with the same name are additive.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replaces the whole header map.
    #[must_use]
    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    /// Appends a header in-place. Intended for middleware pipelines that receive
    /// a `Response` from downstream and need to decorate it without consuming it.
    pub fn add_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.headers.insert(name, value);
    }

    /// Sets the response body from a string.
    #[must_use]
    pub fn body(mut self, body: impl Into<String>) -> Self {
        self.body = Body::Full(Bytes::from(body.into()));
        self
    }

    /// Sets the response body from raw bytes.
    #[must_use]
    pub fn body_bytes(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Body::Full(body.into());
        self
    }

    /// Sets a streamed body. Chunks are written as they arrive.
    #[must_use]
    pub fn body_stream<S>(mut self, stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        self.body = Body::from_stream(stream);
        self
    }

    /// Controls whether the `Connection: keep-alive` or `Connection: close` header is written.
    #[must_use]
    pub fn keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Returns the status code of this response.
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Returns the response headers.
    pub fn header_map(&self) -> &Headers {
        &self.headers
    }

    /// Returns `true` if the body will be streamed rather than written in one piece.
    pub fn is_streamed(&self) -> bool {
        matches!(self.body, Body::Stream(_))
    }

    /// Consumes the response and returns its body.
    pub fn into_body(self) -> Body {
        self.body
    }

    /// Writes the response to `writer` using HTTP/1.1 wire format.
    ///
    /// Automatically adds:
    /// - `Content-Type: text/plain; charset=utf-8` if a buffered body is
    ///   non-empty and no `Content-Type` header was set.
    /// - `Content-Length: <n>` for buffered bodies, or
    ///   `Transfer-Encoding: chunked` for streamed ones.
    /// - `Connection: keep-alive` or `Connection: close`.
    ///
    /// `1xx`, `204` and `304` responses never carry a body: any body set on
    /// them is dropped and no framing header is written.
    ///
    /// Caller-supplied framing headers (`Content-Length`, `Transfer-Encoding`,
    /// `Connection`) are replaced so the message framing always matches the body.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from `writer`, or the first error yielded by a
    /// streamed body. A failure mid-stream leaves the message truncated; the
    /// connection must then be closed.
    pub async fn write_to<W>(self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_message(writer, true).await
    }

    /// Writes only the status line and headers, as the answer to a `HEAD`
    /// request. Framing headers still describe the body a `GET` would carry.
    pub async fn write_head_to<W>(self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.write_message(writer, false).await
    }

    async fn write_message<W>(mut self, writer: &mut W, include_body: bool) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        self.headers
            .remove_any(&["content-length", "transfer-encoding", "connection"]);

        if let Body::Full(body) = &self.body {
            if !body.is_empty()
                && self.status.allows_body()
                && !self.headers.contains("content-type")
            {
                self.headers
                    .insert("Content-Type", "text/plain; charset=utf-8");
            }
        }

        let connection = if self.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.headers.insert("Connection", connection);

        if !self.status.allows_body() {
            let mut head = Self::encode_head(self.status, &self.headers, 0);
            head.put(&b"\r\n"[..]);
            writer.write_all(&head).await?;
            return writer.flush().await;
        }

        match self.body {
            Body::Full(body) => {
                let mut buf = Self::encode_head(self.status, &self.headers, body.len());
                buf.put(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
                if include_body {
                    buf.put(body);
                }
                writer.write_all(&buf).await?;
            }
            Body::Stream(mut stream) => {
                let mut head = Self::encode_head(self.status, &self.headers, 0);
                head.put(&b"Transfer-Encoding: chunked\r\n\r\n"[..]);
                writer.write_all(&head).await?;

                if include_body {
                    while let Some(chunk) = stream.next().await {
                        let chunk = chunk?;
                        if chunk.is_empty() {
                            continue;
                        }
                        writer
                            .write_all(format!("{:X}\r\n", chunk.len()).as_bytes())
                            .await?;
                        writer.write_all(&chunk).await?;
                        writer.write_all(b"\r\n").await?;
                    }
                    writer.write_all(b"0\r\n\r\n").await?;
                }
            }
        }

        writer.flush().await
    }

    // Status line plus every header, without the final blank line.
    fn encode_head(status: StatusCode, headers: &Headers, body_hint: usize) -> BytesMut {
        let mut buf = BytesMut::with_capacity(128 + headers.len() * 64 + body_hint);
        buf.put(
            format!(
                "HTTP/1.1 {} {}\r\n",
                status.as_u16(),
                status.canonical_reason()
            )
            .as_bytes(),
        );
        buf.put(headers.to_string().as_bytes());
        buf
    }
}

impl Default for Response {
    fn default() -> Self {
        Self::new(StatusCode::Ok)
    }
}
