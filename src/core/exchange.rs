//! One request/response exchange on a leased connection.
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    core::{
        allocator::{DiscardPolicy, EvictReason},
        body::ResponseBody,
        connection::ConnectionId,
        error::{HttpError, HttpResult},
        pool::Lease,
        request::Request,
        response::Response,
        route::Route,
    },
    ports::codec::{BodySource, ExchangeCodec, ResponseHead},
};

/// A leased connection bound to a codec for the duration of one exchange.
///
/// Dropping an exchange before its response body is handed out evicts the
/// connection.
pub struct Exchange {
    codec: Box<dyn ExchangeCodec>,
    lease: Lease,
    policy: DiscardPolicy,
}

impl Exchange {
    pub(crate) fn new(
        lease: Lease,
        cancel: CancellationToken,
        policy: DiscardPolicy,
    ) -> HttpResult<Self> {
        let codec = lease.connection().new_codec(cancel)?;
        Ok(Self {
            codec,
            lease,
            policy,
        })
    }

    pub fn route(&self) -> &Route {
        self.lease.route()
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.lease.id()
    }

    pub fn is_reused(&self) -> bool {
        self.lease.is_reused()
    }

    pub(crate) fn set_timeouts(&mut self, read: Duration, write: Duration) {
        self.codec.set_timeouts(read, write);
    }

    pub(crate) async fn write_request_headers(&mut self, request: &Request) -> HttpResult<()> {
        self.codec.write_request_headers(request).await
    }

    pub(crate) async fn write_request_body(&mut self, request: &Request) -> HttpResult<()> {
        if let Some(body) = request.body() {
            let mut sink = self.codec.open_request_body(body.content_length());
            body.write_to(&mut *sink).await?;
        }
        self.codec.finish_request().await
    }

    pub(crate) async fn read_response_headers(&mut self) -> HttpResult<ResponseHead> {
        self.codec.read_response_headers().await
    }

    /// Build the response for `head`. The connection stays leased to the body
    /// until it is read to the end; responses that cannot have a body give the
    /// connection back right away.
    pub(crate) async fn into_response(
        self,
        request: Request,
        head: ResponseHead,
    ) -> HttpResult<Response> {
        let Exchange {
            codec,
            lease,
            policy,
        } = self;
        let connection_id = lease.id();
        let keep_alive = !(policy.honor_connection_close
            && (head.closes_connection() || request.headers().has_token("connection", "close")));
        let content_type = head.headers.get("content-type").map(str::to_string);
        let content_length = head
            .headers
            .get("content-length")
            .and_then(|v| v.trim().parse::<u64>().ok());

        let source = codec.open_response_body(&request, &head);
        let mut body = ExchangeBody {
            source: Some(source),
            lease: Some(lease),
            keep_alive,
            policy,
        };
        let response_body = if has_no_body(&request, head.status) {
            body.read_chunk().await?;
            ResponseBody::empty()
        } else {
            ResponseBody::streaming(Box::new(body), content_type.as_deref(), content_length)
        };

        Ok(Response::builder(request)
            .protocol(head.protocol)
            .status(head.status)
            .message(head.message)
            .headers(head.headers)
            .body(response_body)
            .connection_id(Some(connection_id))
            .build())
    }

    /// Give up on the exchange after `error`. The connection is pooled again
    /// only when the discard policy allows it and the codec had not started
    /// the exchange on the wire.
    pub(crate) fn fail(self, error: &HttpError) {
        let Exchange {
            codec,
            lease,
            policy,
        } = self;
        let at_boundary = codec.is_at_message_boundary();
        drop(codec);
        release_after_failure(lease, policy, error, at_boundary);
    }
}

fn release_after_failure(lease: Lease, policy: DiscardPolicy, error: &HttpError, at_boundary: bool) {
    let reason = match policy.eviction_for(error) {
        Some(reason) => reason,
        None if at_boundary => {
            lease.release();
            return;
        }
        // Bytes of this exchange may still arrive and would be read as the next response
        None => EvictReason::MidMessage,
    };
    debug!(connection.id = lease.id(), %reason, "Exchange failed; evicting connection");
    lease.evict();
}

fn has_no_body(request: &Request, status: StatusCode) -> bool {
    request.method() == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
}

/// Response body stream that owns the lease of the connection it reads from.
///
/// The codec source holds the connection's I/O; it is always dropped before
/// the lease gives the connection back.
struct ExchangeBody {
    source: Option<Box<dyn BodySource>>,
    lease: Option<Lease>,
    keep_alive: bool,
    policy: DiscardPolicy,
}

#[async_trait]
impl BodySource for ExchangeBody {
    async fn read_chunk(&mut self) -> HttpResult<Option<Bytes>> {
        let Some(source) = self.source.as_mut() else {
            return Ok(None);
        };
        match source.read_chunk().await {
            Ok(Some(chunk)) => Ok(Some(chunk)),
            Ok(None) => {
                let reusable = self.keep_alive && source.is_connection_reusable();
                self.source = None;
                if let Some(lease) = self.lease.take() {
                    if reusable {
                        lease.release();
                    } else {
                        debug!(
                            connection.id = lease.id(),
                            reason = %EvictReason::ConnectionClose,
                            "Body complete; closing connection"
                        );
                        lease.evict();
                    }
                }
                Ok(None)
            }
            Err(error) => {
                let at_boundary = source.is_at_message_boundary();
                self.source = None;
                if let Some(lease) = self.lease.take() {
                    release_after_failure(lease, self.policy, &error, at_boundary);
                }
                Err(error)
            }
        }
    }
}

impl Drop for ExchangeBody {
    fn drop(&mut self) {
        self.source = None;
        if let Some(lease) = self.lease.take() {
            debug!(
                connection.id = lease.id(),
                reason = %EvictReason::Abandoned,
                "Response body dropped before end; evicting connection"
            );
            lease.evict();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{net::SocketAddr, sync::Arc};

    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::core::{
        connection::RealConnection,
        error::TimeoutPhase,
        pool::ConnectionPool,
        route::{Address, Proxy},
        url::HttpUrl,
    };

    fn leased(pool: &Arc<ConnectionPool>) -> (Lease, DuplexStream) {
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let route = Route::new(Address::new(&url, Proxy::Direct), addr);
        let (client, server) = duplex(64);
        let connection = RealConnection::new(pool.next_connection_id(), route, Box::new(client));
        (pool.insert_leased(connection), server)
    }

    fn read_timeout() -> HttpError {
        HttpError::Timeout {
            phase: TimeoutPhase::Read,
            after: Duration::from_millis(200),
        }
    }

    const KEEP_ON_TIMEOUT: DiscardPolicy = DiscardPolicy {
        discard_on_timeout: false,
        honor_connection_close: true,
    };

    #[tokio::test]
    async fn test_timeout_at_boundary_keeps_connection() {
        let pool = Arc::new(ConnectionPool::new(5, Duration::from_secs(60)));
        let (lease, _peer) = leased(&pool);

        release_after_failure(lease, KEEP_ON_TIMEOUT, &read_timeout(), true);
        assert_eq!(pool.idle_count(), 1);
    }

    #[tokio::test]
    async fn test_timeout_mid_message_evicts_connection() {
        let pool = Arc::new(ConnectionPool::new(5, Duration::from_secs(60)));
        let (lease, _peer) = leased(&pool);

        release_after_failure(lease, KEEP_ON_TIMEOUT, &read_timeout(), false);
        assert_eq!(pool.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_default_policy_evicts_even_at_boundary() {
        let pool = Arc::new(ConnectionPool::new(5, Duration::from_secs(60)));
        let (lease, _peer) = leased(&pool);

        release_after_failure(lease, DiscardPolicy::default(), &read_timeout(), true);
        assert_eq!(pool.connection_count(), 0);
    }
}
