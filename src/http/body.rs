//! Message bodies and HTTP/1.1 body framing.
//!
//! A [`Body`] is either fully buffered or a stream of chunks. Inbound request
//! bodies are decoded incrementally by [`BodyDecoder`] according to their
//! [`Framing`], so the server never needs the whole payload in memory.

use std::fmt;
use std::io;
use std::pin::Pin;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, TryStreamExt};
use thiserror::Error;
use tokio::sync::mpsc;

/// A boxed stream of body chunks.
pub type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Request or response payload.
pub enum Body {
    /// Bytes held in memory; written with a `Content-Length` header.
    Full(Bytes),
    /// Chunks produced on demand; written with `Transfer-Encoding: chunked`.
    Stream(BodyStream),
}

impl Body {
    /// Returns an empty buffered body.
    pub fn empty() -> Self {
        Self::Full(Bytes::new())
    }

    /// Wraps any chunk stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// A body fed by the receiving half of a channel. The stream ends when
    /// every sender is dropped.
    pub fn from_receiver(rx: mpsc::Receiver<io::Result<Bytes>>) -> Self {
        Self::from_stream(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        }))
    }

    /// Returns `true` for a buffered body with no bytes. A stream is never
    /// considered empty, even if it yields nothing.
    pub fn is_empty(&self) -> bool {
        matches!(self, Self::Full(bytes) if bytes.is_empty())
    }

    /// Drains the body into a single buffer.
    pub async fn collect(self) -> io::Result<Bytes> {
        match self {
            Self::Full(bytes) => Ok(bytes),
            Self::Stream(stream) => {
                let chunks: Vec<Bytes> = stream.try_collect().await?;
                Ok(chunks.concat().into())
            }
        }
    }
}

impl Default for Body {
    fn default() -> Self {
        Self::empty()
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Self::Full(bytes)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// How the length of a request body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// No body at all.
    Empty,
    /// Exactly this many bytes follow the head.
    Length(u64),
    /// `Transfer-Encoding: chunked`.
    Chunked,
}

impl Framing {
    /// Returns `true` when no body bytes follow the head.
    pub fn is_empty(self) -> bool {
        matches!(self, Self::Empty | Self::Length(0))
    }
}

/// Malformed chunked encoding.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BodyError {
    #[error("invalid chunk size line")]
    ChunkSize,

    #[error("chunk data is not followed by CRLF")]
    ChunkTerminator,

    #[error("chunk size or trailer line longer than {max} bytes")]
    LineTooLong { max: usize },
}

impl From<BodyError> for io::Error {
    fn from(err: BodyError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Length { remaining: u64 },
    ChunkSize,
    ChunkData { remaining: u64 },
    ChunkEnd,
    Trailers,
    Done,
}

/// Incremental decoder for one request body.
///
/// Feed it the connection buffer after the head has been split off. Each call
/// to [`decode`](Self::decode) consumes framing bytes and returns the next
/// piece of payload, leaving anything past the end of the body (a pipelined
/// request) untouched in the buffer.
#[derive(Debug)]
pub struct BodyDecoder {
    state: State,
}

impl BodyDecoder {
    /// Longest chunk-size or trailer line accepted.
    pub const MAX_LINE: usize = 4096;

    pub fn new(framing: Framing) -> Self {
        let state = match framing {
            Framing::Empty | Framing::Length(0) => State::Done,
            Framing::Length(n) => State::Length { remaining: n },
            Framing::Chunked => State::ChunkSize,
        };
        Self { state }
    }

    /// Returns `true` once the whole body, including any trailers, is consumed.
    pub fn is_done(&self) -> bool {
        self.state == State::Done
    }

    /// Decodes the next piece of payload from `buf`.
    ///
    /// `Ok(None)` means either the body is finished ([`is_done`](Self::is_done))
    /// or `buf` needs more bytes from the connection.
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, BodyError> {
        loop {
            match self.state {
                State::Done => return Ok(None),
                State::Length { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let (piece, left) = take(buf, remaining);
                    self.state = if left == 0 {
                        State::Done
                    } else {
                        State::Length { remaining: left }
                    };
                    return Ok(Some(piece));
                }
                State::ChunkSize => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    let size = parse_chunk_size(&line)?;
                    self.state = if size == 0 {
                        State::Trailers
                    } else {
                        State::ChunkData { remaining: size }
                    };
                }
                State::ChunkData { remaining } => {
                    if buf.is_empty() {
                        return Ok(None);
                    }
                    let (piece, left) = take(buf, remaining);
                    self.state = if left == 0 {
                        State::ChunkEnd
                    } else {
                        State::ChunkData { remaining: left }
                    };
                    return Ok(Some(piece));
                }
                State::ChunkEnd => {
                    if buf.len() < 2 {
                        return Ok(None);
                    }
                    if &buf[..2] != b"\r\n" {
                        return Err(BodyError::ChunkTerminator);
                    }
                    buf.advance(2);
                    self.state = State::ChunkSize;
                }
                State::Trailers => {
                    // Trailer fields are read and discarded.
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    if line.is_empty() {
                        self.state = State::Done;
                    }
                }
            }
        }
    }
}

// Splits off up to `remaining` bytes; returns them with the count still owed.
fn take(buf: &mut BytesMut, remaining: u64) -> (Bytes, u64) {
    let n = usize::try_from(remaining).map_or(buf.len(), |r| r.min(buf.len()));
    (buf.split_to(n).freeze(), remaining - n as u64)
}

// One CRLF-terminated line without its terminator, or `None` if incomplete.
fn take_line(buf: &mut BytesMut) -> Result<Option<Bytes>, BodyError> {
    match buf.windows(2).position(|w| w == b"\r\n") {
        Some(end) if end > BodyDecoder::MAX_LINE => Err(BodyError::LineTooLong {
            max: BodyDecoder::MAX_LINE,
        }),
        Some(end) => {
            let line = buf.split_to(end).freeze();
            buf.advance(2);
            Ok(Some(line))
        }
        None if buf.len() > BodyDecoder::MAX_LINE => Err(BodyError::LineTooLong {
            max: BodyDecoder::MAX_LINE,
        }),
        None => Ok(None),
    }
}

// Hex size, optionally followed by `;extensions`.
fn parse_chunk_size(line: &[u8]) -> Result<u64, BodyError> {
    let size = line.split(|&b| b == b';').next().unwrap_or_default();
    let size = std::str::from_utf8(size)
        .map_err(|_| BodyError::ChunkSize)?
        .trim_matches([' ', '\t']);
    if size.is_empty() || size.len() > 16 {
        return Err(BodyError::ChunkSize);
    }
    u64::from_str_radix(size, 16).map_err(|_| BodyError::ChunkSize)
}
