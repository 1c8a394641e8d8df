//! HTTP/1.1 exchange codec.
//!
//! Writes request heads and bodies straight onto the connection and parses
//! response heads and bodies out of the connection's read buffer. Bodies are
//! framed by `Transfer-Encoding: chunked`, `Content-Length` or connection close,
//! in that order of precedence.
use std::{io, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderName, HeaderValue, Method, StatusCode};
use tokio::sync::OwnedMutexGuard;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::{
    core::{
        connection::ConnectionIo,
        error::{HttpError, HttpResult},
        headers::Headers,
        request::Request,
        response::Protocol,
        route::Route,
    },
    ports::codec::{BodySink, BodySource, ExchangeCodec, ResponseHead},
};

/// Upper bound for a response head, status line included
const MAX_HEAD_BYTES: usize = 256 * 1024;
/// Upper bound for a chunk-size or trailer line
const MAX_LINE_BYTES: usize = 64 * 1024;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// How the request body is being framed on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestFraming {
    None,
    Fixed { remaining: u64 },
    Chunked,
}

pub struct Http1Codec {
    io: OwnedMutexGuard<ConnectionIo>,
    /// Plain HTTP through a proxy sends the full URL as request target
    absolute_form: bool,
    cancel: CancellationToken,
    read_timeout: Duration,
    write_timeout: Duration,
    request_body: RequestFraming,
    /// Set once the first request byte is handed to the connection
    request_started: bool,
}

impl Http1Codec {
    pub fn new(io: OwnedMutexGuard<ConnectionIo>, route: &Route, cancel: CancellationToken) -> Self {
        Self {
            io,
            absolute_form: !route.address.https && !route.address.proxy.is_direct(),
            cancel,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            request_body: RequestFraming::None,
            request_started: false,
        }
    }

    async fn write(&mut self, buf: &[u8]) -> HttpResult<()> {
        self.io.write_all(buf, self.write_timeout, &self.cancel).await
    }

    /// Read more bytes, treating end of stream as an error
    async fn fill_or_eof(&mut self, what: &str) -> HttpResult<()> {
        if self.io.fill(self.read_timeout, &self.cancel).await? == 0 {
            return Err(HttpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("connection closed before {what}"),
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ExchangeCodec for Http1Codec {
    fn set_timeouts(&mut self, read: Duration, write: Duration) {
        self.read_timeout = read;
        self.write_timeout = write;
    }

    fn is_at_message_boundary(&self) -> bool {
        !self.request_started && self.io.read_buf.is_empty()
    }

    async fn write_request_headers(&mut self, request: &Request) -> HttpResult<()> {
        let target = if self.absolute_form {
            request.url().as_str().to_string()
        } else {
            request.url().request_target()
        };
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(request.method().as_str().as_bytes());
        head.push(b' ');
        head.extend_from_slice(target.as_bytes());
        head.extend_from_slice(b" HTTP/1.1\r\n");
        for (name, value) in request.headers().iter() {
            head.extend_from_slice(name.as_str().as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        trace!(method = %request.method(), target = %target, "Writing request head");
        self.request_started = true;
        self.write(&head).await
    }

    fn open_request_body(&mut self, content_length: Option<u64>) -> Box<dyn BodySink + '_> {
        self.request_body = match content_length {
            Some(remaining) => RequestFraming::Fixed { remaining },
            None => RequestFraming::Chunked,
        };
        Box::new(RequestSink { codec: self })
    }

    async fn finish_request(&mut self) -> HttpResult<()> {
        match std::mem::replace(&mut self.request_body, RequestFraming::None) {
            RequestFraming::Chunked => self.write(b"0\r\n\r\n").await?,
            RequestFraming::Fixed { remaining } if remaining > 0 => {
                return Err(HttpError::InvalidRequest(format!(
                    "request body ended {remaining} byte(s) short of its Content-Length"
                )));
            }
            _ => {}
        }
        self.io.flush(self.write_timeout, &self.cancel).await
    }

    async fn read_response_headers(&mut self) -> HttpResult<ResponseHead> {
        loop {
            // Bytes before `scanned` hold no terminator; a match may straddle the last 3
            let mut scanned = 0;
            let end = loop {
                if let Some(at) = find(&self.io.read_buf[scanned..], b"\r\n\r\n") {
                    break scanned + at;
                }
                if self.io.read_buf.len() > MAX_HEAD_BYTES {
                    return Err(HttpError::MalformedResponse(format!(
                        "response head exceeds {MAX_HEAD_BYTES} bytes"
                    )));
                }
                scanned = self.io.read_buf.len().saturating_sub(3);
                self.fill_or_eof("response headers").await?;
            };
            let raw = self.io.read_buf.split_to(end + 4);
            let head = parse_head(&raw[..end])?;
            // 101 is final: the exchange cannot continue as HTTP/1.1 after it
            if head.status.is_informational() && head.status != StatusCode::SWITCHING_PROTOCOLS {
                trace!(status = head.status.as_u16(), "Skipping interim response");
                continue;
            }
            return Ok(head);
        }
    }

    fn open_response_body(
        self: Box<Self>,
        request: &Request,
        head: &ResponseHead,
    ) -> Box<dyn BodySource> {
        let framing = response_framing(request, head);
        trace!(?framing, "Opening response body");
        let codec = *self;
        Box::new(Http1Body {
            io: codec.io,
            cancel: codec.cancel,
            read_timeout: codec.read_timeout,
            framing,
        })
    }
}

struct RequestSink<'a> {
    codec: &'a mut Http1Codec,
}

#[async_trait]
impl<'a> BodySink for RequestSink<'a> {
    async fn write_all(&mut self, buf: &[u8]) -> HttpResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        match self.codec.request_body {
            RequestFraming::Chunked => {
                let size = format!("{:x}\r\n", buf.len());
                self.codec.write(size.as_bytes()).await?;
                self.codec.write(buf).await?;
                self.codec.write(b"\r\n").await
            }
            RequestFraming::Fixed { remaining } => {
                let len = buf.len() as u64;
                if len > remaining {
                    return Err(HttpError::InvalidRequest(
                        "request body is longer than its Content-Length".to_string(),
                    ));
                }
                self.codec.request_body = RequestFraming::Fixed {
                    remaining: remaining - len,
                };
                self.codec.write(buf).await
            }
            RequestFraming::None => Err(HttpError::violation(
                "terminal stage call-server",
                "request body written after the request was finished",
            )),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailers,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ResponseFraming {
    Fixed { remaining: u64 },
    Chunked(ChunkState),
    UntilClose { done: bool },
    Invalid(String),
}

fn response_framing(request: &Request, head: &ResponseHead) -> ResponseFraming {
    let status = head.status;
    if request.method() == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
    {
        return ResponseFraming::Fixed { remaining: 0 };
    }
    if head.headers.has_token("transfer-encoding", "chunked") {
        return ResponseFraming::Chunked(ChunkState::Size);
    }
    match head.headers.get("content-length") {
        Some(value) => match value.trim().parse::<u64>() {
            Ok(remaining) => ResponseFraming::Fixed { remaining },
            Err(_) => ResponseFraming::Invalid(format!("invalid Content-Length: {value:?}")),
        },
        None => ResponseFraming::UntilClose { done: false },
    }
}

/// Response body reader. Owns the connection I/O until it is dropped.
struct Http1Body {
    io: OwnedMutexGuard<ConnectionIo>,
    cancel: CancellationToken,
    read_timeout: Duration,
    framing: ResponseFraming,
}

impl Http1Body {
    /// Read at least one more byte into the buffer; `false` at end of stream
    async fn fill(&mut self) -> HttpResult<bool> {
        Ok(self.io.fill(self.read_timeout, &self.cancel).await? > 0)
    }

    async fn fill_or_eof(&mut self) -> HttpResult<()> {
        if !self.fill().await? {
            return Err(HttpError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed before the response body ended",
            )));
        }
        Ok(())
    }

    /// Take one CRLF-terminated line from the buffer, without the terminator
    async fn read_line(&mut self) -> HttpResult<BytesMut> {
        loop {
            if let Some(at) = find(&self.io.read_buf, b"\r\n") {
                let mut line = self.io.read_buf.split_to(at + 2);
                line.truncate(at);
                return Ok(line);
            }
            if self.io.read_buf.len() > MAX_LINE_BYTES {
                return Err(HttpError::MalformedResponse(
                    "chunked body line too long".to_string(),
                ));
            }
            self.fill_or_eof().await?;
        }
    }

    /// Up to `limit` bytes from the buffer, reading from the connection if it is empty
    async fn take(&mut self, limit: u64) -> HttpResult<Bytes> {
        if self.io.read_buf.is_empty() {
            self.fill_or_eof().await?;
        }
        let n = self.io.read_buf.len().min(usize::try_from(limit).unwrap_or(usize::MAX));
        Ok(self.io.read_buf.split_to(n).freeze())
    }

    async fn read_chunked(&mut self) -> HttpResult<Option<Bytes>> {
        loop {
            let ResponseFraming::Chunked(state) = &self.framing else {
                return Ok(None);
            };
            match state.clone() {
                ChunkState::Size => {
                    let line = self.read_line().await?;
                    let size = parse_chunk_size(&line)?;
                    let next = if size == 0 {
                        ChunkState::Trailers
                    } else {
                        ChunkState::Data(size)
                    };
                    self.framing = ResponseFraming::Chunked(next);
                }
                ChunkState::Data(remaining) => {
                    let chunk = self.take(remaining).await?;
                    let left = remaining - chunk.len() as u64;
                    self.framing = ResponseFraming::Chunked(if left == 0 {
                        ChunkState::DataEnd
                    } else {
                        ChunkState::Data(left)
                    });
                    return Ok(Some(chunk));
                }
                ChunkState::DataEnd => {
                    let line = self.read_line().await?;
                    if !line.is_empty() {
                        return Err(HttpError::MalformedResponse(
                            "missing CRLF after chunk data".to_string(),
                        ));
                    }
                    self.framing = ResponseFraming::Chunked(ChunkState::Size);
                }
                ChunkState::Trailers => {
                    // Trailers are read and dropped
                    while !self.read_line().await?.is_empty() {}
                    self.framing = ResponseFraming::Chunked(ChunkState::Done);
                }
                ChunkState::Done => return Ok(None),
            }
        }
    }
}

#[async_trait]
impl BodySource for Http1Body {
    async fn read_chunk(&mut self) -> HttpResult<Option<Bytes>> {
        match self.framing.clone() {
            ResponseFraming::Fixed { remaining: 0 } => Ok(None),
            ResponseFraming::Fixed { remaining } => {
                let chunk = self.take(remaining).await?;
                self.framing = ResponseFraming::Fixed {
                    remaining: remaining - chunk.len() as u64,
                };
                Ok(Some(chunk))
            }
            ResponseFraming::Chunked(_) => self.read_chunked().await,
            ResponseFraming::UntilClose { done: true } => Ok(None),
            ResponseFraming::UntilClose { done: false } => {
                if self.io.read_buf.is_empty() && !self.fill().await? {
                    self.framing = ResponseFraming::UntilClose { done: true };
                    return Ok(None);
                }
                let n = self.io.read_buf.len();
                Ok(Some(self.io.read_buf.split_to(n).freeze()))
            }
            ResponseFraming::Invalid(message) => Err(HttpError::MalformedResponse(message)),
        }
    }

    fn is_connection_reusable(&self) -> bool {
        matches!(
            self.framing,
            ResponseFraming::Fixed { .. } | ResponseFraming::Chunked(_)
        )
    }

    fn is_at_message_boundary(&self) -> bool {
        matches!(
            self.framing,
            ResponseFraming::Fixed { remaining: 0 } | ResponseFraming::Chunked(ChunkState::Done)
        ) && self.io.read_buf.is_empty()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

fn parse_chunk_size(line: &[u8]) -> HttpResult<u64> {
    let text = std::str::from_utf8(line)
        .map_err(|_| HttpError::MalformedResponse("chunk size is not ASCII".to_string()))?;
    // Chunk extensions follow a ';' and are ignored
    let digits = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(digits, 16)
        .map_err(|_| HttpError::MalformedResponse(format!("invalid chunk size: {digits:?}")))
}

fn parse_head(raw: &[u8]) -> HttpResult<ResponseHead> {
    let mut lines = raw.split(|&b| b == b'\n').map(|line| match line {
        [rest @ .., b'\r'] => rest,
        line => line,
    });
    let status_line = lines.next().unwrap_or_default();
    let status_line = std::str::from_utf8(status_line)
        .map_err(|_| HttpError::MalformedResponse("status line is not valid UTF-8".to_string()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = parts.next().unwrap_or_default();
    let protocol = Protocol::parse(version).ok_or_else(|| {
        HttpError::MalformedResponse(format!("unexpected status line: {status_line:?}"))
    })?;
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            HttpError::MalformedResponse(format!("unexpected status line: {status_line:?}"))
        })?;
    let message = parts.next().unwrap_or_default().to_string();

    let mut headers = Headers::new();
    for line in lines {
        if line.is_empty() {
            continue;
        }
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            return Err(HttpError::MalformedResponse(format!(
                "header line without ':': {:?}",
                String::from_utf8_lossy(line)
            )));
        };
        let name = HeaderName::from_bytes(line[..colon].trim_ascii()).map_err(|_| {
            HttpError::MalformedResponse(format!(
                "invalid header name: {:?}",
                String::from_utf8_lossy(&line[..colon])
            ))
        })?;
        let value = HeaderValue::from_bytes(line[colon + 1..].trim_ascii()).map_err(|_| {
            HttpError::MalformedResponse(format!("invalid value for header {name}"))
        })?;
        headers.append(name, value);
    }

    Ok(ResponseHead {
        protocol,
        status,
        message,
        headers,
    })
}
