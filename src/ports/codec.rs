use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;

use crate::core::{
    error::HttpResult,
    headers::Headers,
    request::Request,
    response::Protocol,
};

/// Status line and headers of a response, before its body is opened.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub protocol: Protocol,
    pub status: StatusCode,
    pub message: String,
    pub headers: Headers,
}

impl ResponseHead {
    /// Whether the peer asked for the connection to be closed after this exchange
    pub fn closes_connection(&self) -> bool {
        match self.protocol {
            Protocol::Http10 => !self.headers.has_token("connection", "keep-alive"),
            Protocol::Http11 => self.headers.has_token("connection", "close"),
        }
    }
}

/// Destination for request body bytes.
#[async_trait]
pub trait BodySink: Send {
    async fn write_all(&mut self, buf: &[u8]) -> HttpResult<()>;
}

/// Lazily read response body bytes.
#[async_trait]
pub trait BodySource: Send {
    /// Next chunk of the body, or `None` once the body is exhausted
    async fn read_chunk(&mut self) -> HttpResult<Option<Bytes>>;

    /// Whether the connection can carry another exchange once this body is exhausted
    fn is_connection_reusable(&self) -> bool {
        true
    }

    /// Whether the connection sits between two messages, so that a failed read
    /// left nothing of this response behind on the wire
    fn is_at_message_boundary(&self) -> bool {
        false
    }
}

/// ExchangeCodec translates one request/response exchange to and from bytes on a
/// single leased connection. An instance is valid for exactly one exchange.
#[async_trait]
pub trait ExchangeCodec: Send {
    /// Apply the read/write timeouts in effect for the remainder of the exchange
    fn set_timeouts(&mut self, read: Duration, write: Duration);

    /// Whether nothing of this exchange has reached the wire yet. Only then can
    /// the connection carry another exchange after this one fails.
    fn is_at_message_boundary(&self) -> bool {
        false
    }

    /// Write the request line and headers
    async fn write_request_headers(&mut self, request: &Request) -> HttpResult<()>;

    /// Open a sink for the request body. `None` length means the size is unknown.
    fn open_request_body(&mut self, content_length: Option<u64>) -> Box<dyn BodySink + '_>;

    /// Terminate the request and flush everything written so far
    async fn finish_request(&mut self) -> HttpResult<()>;

    /// Read the status line and headers, skipping interim 1xx responses
    async fn read_response_headers(&mut self) -> HttpResult<ResponseHead>;

    /// Hand the connection over to a body reader framed for this response
    fn open_response_body(
        self: Box<Self>,
        request: &Request,
        head: &ResponseHead,
    ) -> Box<dyn BodySource>;
}
