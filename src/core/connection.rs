//! A live transport to one route.
use std::{
    fmt,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::{Duration, Instant},
};

use bytes::BytesMut;
use futures_util::task::noop_waker_ref;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWriteExt, ReadBuf},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::{
    adapters::http1_codec::Http1Codec,
    core::{
        error::{HttpError, HttpResult, TimeoutPhase},
        response::Protocol,
        route::Route,
    },
    ports::{codec::ExchangeCodec, transport::BoxedTransport},
};

/// Unique identifier for a pooled connection
pub type ConnectionId = u64;

const READ_CHUNK: usize = 8 * 1024;

/// The byte stream of a connection plus bytes read but not yet consumed.
///
/// Exactly one exchange holds the I/O at a time. Every wait is bounded by a
/// timeout and aborted when the owning call is canceled.
pub struct ConnectionIo {
    pub(crate) stream: BoxedTransport,
    pub(crate) read_buf: BytesMut,
}

impl ConnectionIo {
    fn new(stream: BoxedTransport) -> Self {
        Self {
            stream,
            read_buf: BytesMut::with_capacity(READ_CHUNK),
        }
    }

    /// Read more bytes into `read_buf`. Returns 0 at end of stream.
    pub(crate) async fn fill(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HttpResult<usize> {
        self.read_buf.reserve(READ_CHUNK);
        let ConnectionIo { stream, read_buf } = self;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Canceled),
            read = tokio::time::timeout(timeout, stream.read_buf(read_buf)) => match read {
                Ok(result) => Ok(result?),
                Err(_) => Err(HttpError::Timeout { phase: TimeoutPhase::Read, after: timeout }),
            },
        }
    }

    pub(crate) async fn write_all(
        &mut self,
        buf: &[u8],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HttpResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Canceled),
            written = tokio::time::timeout(timeout, self.stream.write_all(buf)) => match written {
                Ok(result) => Ok(result?),
                Err(_) => Err(HttpError::Timeout { phase: TimeoutPhase::Write, after: timeout }),
            },
        }
    }

    pub(crate) async fn flush(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> HttpResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(HttpError::Canceled),
            flushed = tokio::time::timeout(timeout, self.stream.flush()) => match flushed {
                Ok(result) => Ok(result?),
                Err(_) => Err(HttpError::Timeout { phase: TimeoutPhase::Write, after: timeout }),
            },
        }
    }
}

/// One established transport. Shared by the pool and at most one exchange.
pub struct RealConnection {
    id: ConnectionId,
    route: Route,
    protocol: Protocol,
    created_at: Instant,
    io: Arc<Mutex<ConnectionIo>>,
}

impl RealConnection {
    pub fn new(id: ConnectionId, route: Route, stream: BoxedTransport) -> Self {
        Self {
            id,
            route,
            protocol: Protocol::Http11,
            created_at: Instant::now(),
            io: Arc::new(Mutex::new(ConnectionIo::new(stream))),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Concurrent exchanges this connection can carry. HTTP/1.x does not multiplex.
    pub fn allocation_limit(&self) -> usize {
        1
    }

    /// Bind a codec for one exchange. Fails if another exchange still holds the I/O.
    pub(crate) fn new_codec(
        &self,
        cancel: CancellationToken,
    ) -> HttpResult<Box<dyn ExchangeCodec>> {
        let io = self.io.clone().try_lock_owned().map_err(|_| {
            HttpError::violation(
                "connection allocator",
                format!("connection {} is already carrying an exchange", self.id),
            )
        })?;
        let codec: Box<dyn ExchangeCodec> = match self.protocol {
            Protocol::Http10 | Protocol::Http11 => {
                Box::new(Http1Codec::new(io, &self.route, cancel))
            }
        };
        Ok(codec)
    }

    /// Non-blocking liveness check for an idle connection.
    ///
    /// A peer that closed the connection, sent unsolicited bytes or left bytes
    /// unread makes the connection unusable. A connection whose I/O is held by
    /// an exchange is reported healthy.
    pub fn is_healthy(&self) -> bool {
        let Ok(mut io) = self.io.try_lock() else {
            return true;
        };
        if !io.read_buf.is_empty() {
            return false;
        }
        let mut scratch = [0u8; 1];
        let mut buf = ReadBuf::new(&mut scratch);
        let mut cx = Context::from_waker(noop_waker_ref());
        match Pin::new(&mut io.stream).poll_read(&mut cx, &mut buf) {
            Poll::Pending => true,
            Poll::Ready(_) => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn io_handle(&self) -> Arc<Mutex<ConnectionIo>> {
        self.io.clone()
    }
}

impl fmt::Debug for RealConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealConnection")
            .field("id", &self.id)
            .field("route", &self.route.to_string())
            .field("protocol", &self.protocol)
            .field("age", &self.age())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::io::{AsyncWriteExt, duplex};

    use super::*;
    use crate::core::{
        route::{Address, Proxy},
        url::HttpUrl,
    };

    fn route() -> Route {
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        Route::new(Address::new(&url, Proxy::Direct), addr)
    }

    #[tokio::test]
    async fn test_idle_connection_is_healthy() {
        let (client, _server) = duplex(64);
        let connection = RealConnection::new(1, route(), Box::new(client));
        assert!(connection.is_healthy());
    }

    #[tokio::test]
    async fn test_peer_close_detected() {
        let (client, server) = duplex(64);
        let connection = RealConnection::new(1, route(), Box::new(client));
        drop(server);
        assert!(!connection.is_healthy());
    }

    #[tokio::test]
    async fn test_unsolicited_bytes_make_connection_unhealthy() {
        let (client, mut server) = duplex(64);
        let connection = RealConnection::new(1, route(), Box::new(client));
        server.write_all(b"HTTP/1.1 408").await.unwrap();
        assert!(!connection.is_healthy());
    }

    #[tokio::test]
    async fn test_busy_connection_rejects_second_codec() {
        let (client, _server) = duplex(64);
        let connection = RealConnection::new(7, route(), Box::new(client));
        let _codec = connection.new_codec(CancellationToken::new()).unwrap();
        let second = connection.new_codec(CancellationToken::new());
        assert!(matches!(second, Err(HttpError::ProtocolViolation { .. })));
        assert!(connection.is_healthy());
    }

    #[tokio::test]
    async fn test_fill_observes_cancellation() {
        let (client, _server) = duplex(64);
        let connection = RealConnection::new(1, route(), Box::new(client));
        let cancel = CancellationToken::new();
        cancel.cancel();
        let io = connection.io_handle();
        let mut io = io.lock().await;
        let result = io.fill(Duration::from_secs(5), &cancel).await;
        assert!(matches!(result, Err(HttpError::Canceled)));
    }

    #[tokio::test]
    async fn test_fill_times_out() {
        let (client, _server) = duplex(64);
        let connection = RealConnection::new(1, route(), Box::new(client));
        let io = connection.io_handle();
        let mut io = io.lock().await;
        let result = io
            .fill(Duration::from_millis(20), &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(HttpError::Timeout {
                phase: TimeoutPhase::Read,
                ..
            })
        ));
    }
}
