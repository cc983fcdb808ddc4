//! Async TCP server using Tokio.
//!
//! Accepts TCP connections and dispatches HTTP/1.1 requests to a handler function.
//! Supports HTTP/1.1 persistent connections (keep-alive), request bodies that
//! stream into the handler as they arrive (`Content-Length` or chunked),
//! streamed responses, and graceful shutdown of the accept loop.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::http::{
    Body, Framing, Method, StatusCode,
    body::{BodyDecoder, BodyError},
    request::{Request, RequestError},
    response::Response,
};

/// Errors produced by the server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to bind to {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Default cap on a single request body (8 MiB).
pub const DEFAULT_MAX_BODY: u64 = 8 * 1024 * 1024;

/// Maximum size of the request line plus headers.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Initial read buffer capacity per connection.
const INITIAL_BUF_SIZE: usize = 4096;

/// Body chunks buffered between the socket and a slow handler.
const BODY_CHANNEL_DEPTH: usize = 8;

/// The HTTP server fronting the proxy and market-data routes.
///
/// # Examples
///
/// ```rust,no_run
/// use swapgate::server::Server;
/// use swapgate::http::{Request, Response, StatusCode};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let server = Server::bind("127.0.0.1:8080").await?;
///     server.run(|_req: Request| async {
///         Response::new(StatusCode::Ok).body("Hello!")
///     }).await?;
///     Ok(())
/// }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    max_body: u64,
}

impl Server {
    /// Binds the server to the given TCP address.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound
    /// (e.g. port already in use, insufficient permissions).
    pub async fn bind(addr: impl AsRef<str>) -> Result<Self, ServerError> {
        let addr = addr.as_ref();
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::Bind {
                addr: addr.to_owned(),
                source: e,
            })?;
        let local_addr = listener.local_addr()?;
        Ok(Self {
            listener,
            local_addr,
            max_body: DEFAULT_MAX_BODY,
        })
    }

    /// Caps the size of a request body. A declared `Content-Length` above the
    /// cap is answered with `413` before any body byte is read; a chunked body
    /// that grows past it is cut off with `413`.
    #[must_use]
    pub fn with_max_body(mut self, max_body: u64) -> Self {
        self.max_body = max_body;
        self
    }

    /// Returns the local address the server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Starts accepting connections and dispatching requests to `handler`
    /// until the process is terminated.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Io`] if the TCP listener itself fails.
    pub async fn run<H, F>(self, handler: H) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
    {
        self.run_until(handler, std::future::pending()).await
    }

    /// Like [`run`](Self::run), but stops accepting new connections once
    /// `shutdown` resolves. Connections already accepted finish on their own
    /// spawned tasks.
    ///
    /// The handler receives a [`Request`] and must return a [`Future`] that
    /// resolves to a [`Response`]. It is wrapped in an [`Arc`] and shared across
    /// all spawned Tokio tasks, so it must be `Send + Sync + 'static`.
    pub async fn run_until<H, F, S>(self, handler: H, shutdown: S) -> Result<(), ServerError>
    where
        H: Fn(Request) -> F + Send + Sync + 'static,
        F: Future<Output = Response> + Send + 'static,
        S: Future<Output = ()>,
    {
        let handler = Arc::new(handler);
        info!(address = %self.local_addr, max_body = self.max_body, "swapgate listening");
        tokio::pin!(shutdown);

        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                () = &mut shutdown => {
                    info!(address = %self.local_addr, "shutdown requested, no longer accepting");
                    return Ok(());
                }
            };

            let (stream, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    error!(error = %e, "failed to accept connection");
                    continue;
                }
            };

            debug!(peer = %peer_addr, "connection accepted");
            let handler = Arc::clone(&handler);
            let max_body = self.max_body;

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer_addr, handler, max_body).await {
                    warn!(peer = %peer_addr, error = %e, "connection closed with error");
                }
            });
        }
    }
}

/// Why a request body could not be delivered in full.
#[derive(Debug, Error)]
enum BodyFailure {
    #[error("request body exceeds {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("malformed request body: {0}")]
    Malformed(#[from] BodyError),

    #[error("connection closed mid-body")]
    Closed,

    #[error("I/O error while reading body: {0}")]
    Io(#[from] io::Error),
}

impl BodyFailure {
    // Status to answer with, if the peer is still there to read it.
    fn status(&self) -> Option<StatusCode> {
        match self {
            Self::TooLarge { .. } => Some(StatusCode::PayloadTooLarge),
            Self::Malformed(_) => Some(StatusCode::BadRequest),
            Self::Closed | Self::Io(_) => None,
        }
    }
}

/// Handles a single TCP connection over its lifetime.
///
/// HTTP/1.1 connections are persistent by default: we loop, reading one
/// request per iteration, until the peer closes the connection or signals
/// `Connection: close`.
async fn handle_connection<H, F>(
    mut stream: TcpStream,
    peer_addr: SocketAddr,
    handler: Arc<H>,
    max_body: u64,
) -> Result<(), io::Error>
where
    H: Fn(Request) -> F + Send + Sync + 'static,
    F: Future<Output = Response> + Send + 'static,
{
    let mut buf = BytesMut::with_capacity(INITIAL_BUF_SIZE);

    loop {
        // Only read when the buffer does not already hold a complete head.
        let (request, head_len) = match Request::parse_head(&buf) {
            Ok(parsed) => parsed,
            Err(RequestError::Incomplete) => {
                if buf.len() > MAX_HEAD_SIZE {
                    warn!(peer = %peer_addr, "request head too large: sending 413");
                    reject(&mut stream, StatusCode::PayloadTooLarge, "Request head too large")
                        .await?;
                    break;
                }
                if stream.read_buf(&mut buf).await? == 0 {
                    debug!(peer = %peer_addr, "connection closed by peer");
                    break;
                }
                continue;
            }
            Err(e) => {
                let status = e.status();
                warn!(peer = %peer_addr, error = %e, status = status.as_u16(), "rejecting request");
                reject(&mut stream, status, &e.to_string()).await?;
                break;
            }
        };
        let _ = buf.split_to(head_len);

        let framing = request.framing();
        if let Framing::Length(declared) = framing {
            if declared > max_body {
                warn!(peer = %peer_addr, declared, max_body, "request body too large: sending 413");
                reject(&mut stream, StatusCode::PayloadTooLarge, "Request entity too large")
                    .await?;
                break;
            }
        }

        let keep_alive = request.is_keep_alive();
        let is_head = request.method() == &Method::Head;

        debug!(
            peer = %peer_addr,
            method = %request.method(),
            path = %request.path(),
            ?framing,
            "dispatching request"
        );

        let response = if framing.is_empty() {
            handler(request).await
        } else {
            if request.expects_continue() {
                stream.write_all(b"HTTP/1.1 100 Continue\r\n\r\n").await?;
            }

            let (tx, rx) = mpsc::channel(BODY_CHANNEL_DEPTH);
            let request = request.with_body(Body::from_receiver(rx));
            let (pumped, response) = tokio::join!(
                pump_body(&mut stream, &mut buf, framing, max_body, tx),
                handler(request),
            );

            if let Err(failure) = pumped {
                warn!(peer = %peer_addr, error = %failure, "request body failed");
                if let Some(status) = failure.status() {
                    reject(&mut stream, status, &failure.to_string()).await?;
                }
                break;
            }
            response
        };

        let response = response.keep_alive(keep_alive);
        if is_head {
            response.write_head_to(&mut stream).await?;
        } else {
            response.write_to(&mut stream).await?;
        }

        if !keep_alive {
            debug!(peer = %peer_addr, "Connection: close: shutting down");
            break;
        }
    }

    Ok(())
}

/// Decodes the body following the current head and feeds it to `tx`.
///
/// Reads from `stream` only when `buf` runs dry, and stops exactly at the end
/// of the body so pipelined bytes stay in `buf`. If the handler drops its end
/// of the channel the rest of the body is still read and discarded, keeping
/// the connection in sync.
async fn pump_body(
    stream: &mut TcpStream,
    buf: &mut BytesMut,
    framing: Framing,
    max_body: u64,
    tx: mpsc::Sender<io::Result<Bytes>>,
) -> Result<(), BodyFailure> {
    let mut decoder = BodyDecoder::new(framing);
    let mut received: u64 = 0;
    let mut tx = Some(tx);

    loop {
        let failure = match decoder.decode(buf) {
            Ok(Some(piece)) => {
                received = received.saturating_add(piece.len() as u64);
                if received > max_body {
                    BodyFailure::TooLarge { limit: max_body }
                } else {
                    if let Some(sender) = &tx {
                        if sender.send(Ok(piece)).await.is_err() {
                            tx = None;
                        }
                    }
                    continue;
                }
            }
            Ok(None) if decoder.is_done() => return Ok(()),
            Ok(None) => match stream.read_buf(buf).await {
                Ok(0) => BodyFailure::Closed,
                Ok(_) => continue,
                Err(e) => BodyFailure::Io(e),
            },
            Err(e) => BodyFailure::Malformed(e),
        };

        if let Some(sender) = tx {
            let _ = sender
                .send(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    failure.to_string(),
                )))
                .await;
        }
        return Err(failure);
    }
}

async fn reject(stream: &mut TcpStream, status: StatusCode, reason: &str) -> io::Result<()> {
    Response::new(status)
        .body(reason.to_owned())
        .keep_alive(false)
        .write_to(stream)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn echo(req: Request) -> Response {
        match req.into_body().collect().await {
            Ok(body) => Response::new(StatusCode::Ok).body_bytes(body),
            Err(e) => Response::new(StatusCode::BadRequest).body(e.to_string()),
        }
    }

    async fn spawn_echo() -> SocketAddr {
        spawn_with(Server::bind("127.0.0.1:0").await.unwrap()).await
    }

    async fn spawn_with(server: Server) -> SocketAddr {
        let addr = server.local_addr();
        tokio::spawn(server.run(echo));
        addr
    }

    async fn exchange(addr: SocketAddr, raw: &[u8]) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(raw).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn echoes_body_split_across_reads() {
        let addr = spawn_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST /swap HTTP/1.1\r\nContent-Length: 11\r\nConnection: close\r\n\r\nhello")
            .await
            .unwrap();
        stream.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        stream.write_all(b" world").await.unwrap();

        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("hello world"));
    }

    #[tokio::test]
    async fn handler_sees_body_before_it_is_complete() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        let (first_tx, first_rx) = tokio::sync::oneshot::channel::<Bytes>();
        let first_tx = std::sync::Mutex::new(Some(first_tx));
        tokio::spawn(server.run(move |req: Request| {
            let notify = first_tx.lock().unwrap().take();
            async move {
                use futures::StreamExt;
                let Body::Stream(mut chunks) = req.into_body() else {
                    return Response::new(StatusCode::InternalServerError);
                };
                let first = chunks.next().await.unwrap().unwrap();
                if let Some(notify) = notify {
                    let _ = notify.send(first);
                }
                while chunks.next().await.is_some() {}
                Response::new(StatusCode::Ok)
            }
        }));

        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nfirst\r\n")
            .await
            .unwrap();
        let first = tokio::time::timeout(Duration::from_secs(2), first_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.as_ref(), b"first");

        stream.write_all(b"0\r\n\r\n").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[tokio::test]
    async fn pipelined_requests_are_answered_in_order() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nContent-Length: 3\r\n\r\nonePOST / HTTP/1.1\r\nContent-Length: 3\r\nConnection: close\r\n\r\ntwo",
        )
        .await;
        let one = text.find("\r\n\r\none").unwrap();
        let two = text.find("\r\n\r\ntwo").unwrap();
        assert!(one < two);
        assert_eq!(text.matches("HTTP/1.1 200 OK").count(), 2);
    }

    #[tokio::test]
    async fn unread_body_is_drained_before_next_request() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            Response::new(StatusCode::Ok).body(req.path().to_owned())
        }));

        let text = exchange(
            addr,
            b"POST /first HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\nGET /second HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        assert!(text.contains("\r\n\r\n/first"));
        assert!(text.ends_with("\r\n\r\n/second"));
    }

    #[tokio::test]
    async fn chunked_request_body_is_decoded() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 11\r\n"));
        assert!(text.ends_with("\r\n\r\nhello world"));
    }

    #[tokio::test]
    async fn expect_continue_gets_interim_response() {
        let addr = spawn_echo().await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"PUT / HTTP/1.1\r\nExpect: 100-continue\r\nContent-Length: 2\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();

        let interim = b"HTTP/1.1 100 Continue\r\n\r\n";
        let mut got = vec![0u8; interim.len()];
        stream.read_exact(&mut got).await.unwrap();
        assert_eq!(got, interim);

        stream.write_all(b"ok").await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[tokio::test]
    async fn maximal_content_length_gets_413() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\nabc",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
    }

    #[tokio::test]
    async fn declared_length_over_limit_gets_413_before_body() {
        let server = Server::bind("127.0.0.1:0").await.unwrap().with_max_body(8);
        let addr = spawn_with(server).await;

        // No body bytes are sent; the answer must not wait for them.
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n")
            .await
            .unwrap();
        let mut out = Vec::new();
        tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        assert!(String::from_utf8(out).unwrap().starts_with("HTTP/1.1 413 "));
    }

    #[tokio::test]
    async fn chunked_body_over_limit_gets_413() {
        let server = Server::bind("127.0.0.1:0").await.unwrap().with_max_body(8);
        let addr = spawn_with(server).await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n5\r\nworld\r\n0\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"));
        assert!(!text.contains("helloworld"));
    }

    #[tokio::test]
    async fn malformed_chunk_gets_400() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nnot-hex\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn malformed_request_gets_400() {
        let addr = spawn_echo().await;
        let text = exchange(addr, b"NOT A REQUEST\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn conflicting_framing_gets_400() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"POST / HTTP/1.1\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n",
        )
        .await;
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
    }

    #[tokio::test]
    async fn unknown_transfer_coding_gets_501() {
        let addr = spawn_echo().await;
        let text = exchange(addr, b"POST / HTTP/1.1\r\nTransfer-Encoding: gzip\r\n\r\n").await;
        assert!(text.starts_with("HTTP/1.1 501 Not Implemented\r\n"));
    }

    #[tokio::test]
    async fn head_request_gets_headers_only() {
        let addr = spawn_echo().await;
        let text = exchange(
            addr,
            b"HEAD / HTTP/1.1\r\nContent-Length: 4\r\nConnection: close\r\n\r\nbody",
        )
        .await;
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn no_content_response_has_no_framing() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr();
        tokio::spawn(server.run(|req: Request| async move {
            if req.method() == &Method::Delete {
                Response::new(StatusCode::NoContent)
            } else {
                Response::new(StatusCode::Ok).body("after")
            }
        }));

        let text = exchange(
            addr,
            b"DELETE /order HTTP/1.1\r\n\r\nGET /order HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;
        let (first, second) = text.split_at(text.find("HTTP/1.1 200").unwrap());
        assert_eq!(first, "HTTP/1.1 204 No Content\r\nConnection: keep-alive\r\n\r\n");
        assert!(second.ends_with("\r\n\r\nafter"));
    }

    #[tokio::test]
    async fn shutdown_stops_accept_loop() {
        let server = Server::bind("127.0.0.1:0").await.unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(server.run_until(
            |_req: Request| async { Response::new(StatusCode::Ok) },
            async {
                let _ = rx.await;
            },
        ));
        tx.send(()).unwrap();
        task.await.unwrap().unwrap();
    }
}
