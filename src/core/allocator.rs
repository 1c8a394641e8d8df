//! Finds or creates the connection for each exchange.
use std::{fmt, sync::Arc, time::Duration};

use tracing::{Instrument, debug, info, warn};

use crate::{
    core::{
        call::Call,
        connection::RealConnection,
        error::{ConnectFailure, HttpError, HttpResult},
        pool::{ConnectionPool, Lease},
        route::{Address, Proxy, Route, RouteDatabase, TlsSettings, select_routes},
        url::HttpUrl,
    },
    ports::transport::{Connector, Dns},
    tracing_setup::create_connection_span,
};

/// Why a connection is closed instead of returned to the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictReason {
    Canceled,
    Io,
    Timeout,
    ProtocolError,
    /// The server asked to close, or the body was framed by connection close
    ConnectionClose,
    /// The exchange was dropped before its body was read to the end
    Abandoned,
    /// The exchange failed after it had started on the wire
    MidMessage,
}

impl fmt::Display for EvictReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            EvictReason::Canceled => "call canceled",
            EvictReason::Io => "I/O error",
            EvictReason::Timeout => "timeout",
            EvictReason::ProtocolError => "protocol error",
            EvictReason::ConnectionClose => "connection close",
            EvictReason::Abandoned => "exchange abandoned",
            EvictReason::MidMessage => "failed mid-message",
        };
        f.write_str(reason)
    }
}

/// Which failures disqualify a connection from reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscardPolicy {
    pub discard_on_timeout: bool,
    pub honor_connection_close: bool,
}

impl Default for DiscardPolicy {
    fn default() -> Self {
        Self {
            discard_on_timeout: true,
            honor_connection_close: true,
        }
    }
}

impl DiscardPolicy {
    /// The eviction reason for a connection whose exchange failed with `error`,
    /// or `None` when the policy allows pooling it again.
    pub fn eviction_for(&self, error: &HttpError) -> Option<EvictReason> {
        match error.root() {
            HttpError::Timeout { .. } if !self.discard_on_timeout => None,
            HttpError::Timeout { .. } => Some(EvictReason::Timeout),
            HttpError::Canceled => Some(EvictReason::Canceled),
            HttpError::Io(_) => Some(EvictReason::Io),
            _ => Some(EvictReason::ProtocolError),
        }
    }
}

pub struct ConnectionAllocator {
    pool: Arc<ConnectionPool>,
    connector: Arc<dyn Connector>,
    dns: Arc<dyn Dns>,
    route_db: Arc<RouteDatabase>,
    proxy: Proxy,
    tls: TlsSettings,
    policy: DiscardPolicy,
}

impl ConnectionAllocator {
    pub fn new(
        pool: Arc<ConnectionPool>,
        connector: Arc<dyn Connector>,
        dns: Arc<dyn Dns>,
        route_db: Arc<RouteDatabase>,
        proxy: Proxy,
        tls: TlsSettings,
        policy: DiscardPolicy,
    ) -> Self {
        Self {
            pool,
            connector,
            dns,
            route_db,
            proxy,
            tls,
            policy,
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn route_database(&self) -> &Arc<RouteDatabase> {
        &self.route_db
    }

    pub fn discard_policy(&self) -> DiscardPolicy {
        self.policy
    }

    /// Lease a connection able to carry a request for `url`.
    ///
    /// Pooled connections for any candidate route are tried first. Otherwise
    /// routes are connected in order; the first to connect within
    /// `connect_timeout` wins and the failures before it are recorded on the
    /// call as suppressed causes. When every route fails the error lists all
    /// attempts, first attempt first.
    pub async fn allocate(
        &self,
        call: &Call,
        url: &HttpUrl,
        connect_timeout: Duration,
    ) -> HttpResult<Lease> {
        call.check_canceled()?;
        let address = Address::new(url, self.proxy.clone()).with_tls(self.tls);
        let routes = select_routes(&address, self.dns.as_ref(), &self.route_db).await?;

        for route in &routes {
            if let Some(lease) = self.pool.acquire(route) {
                return Ok(lease);
            }
        }
        debug!(host = %address.host, candidates = routes.len(), "No pooled connection; connecting");

        let cancel = call.cancel_token();
        let mut failures = Vec::new();
        for route in routes {
            let id = self.pool.next_connection_id();
            let span = create_connection_span(id, &route);
            let connect = tokio::time::timeout(
                connect_timeout,
                self.connector.connect(&route, connect_timeout),
            )
            .instrument(span);
            let connected = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(HttpError::Canceled),
                connected = connect => connected,
            };

            match connected {
                Ok(Ok(stream)) => {
                    self.route_db.connected(&route);
                    info!(connection.id = id, route = %route, "Connection established");
                    if !failures.is_empty() {
                        call.add_suppressed_failures(std::mem::take(&mut failures));
                    }
                    return Ok(self.pool.insert_leased(RealConnection::new(id, route, stream)));
                }
                Ok(Err(e)) => {
                    warn!(route = %route, error = %e, "Connect failed; trying next route");
                    self.route_db.failed(&route);
                    failures.push(ConnectFailure::new(route, &e));
                }
                Err(_) => {
                    warn!(route = %route, timeout = ?connect_timeout, "Connect timed out; trying next route");
                    self.route_db.failed(&route);
                    failures.push(ConnectFailure::timed_out(route, connect_timeout));
                }
            }
        }
        Err(HttpError::RoutesExhausted { attempts: failures })
    }

    /// Give a lease back, closing its connection when `reason` is set
    pub fn release(&self, lease: Lease, reason: Option<EvictReason>) {
        match reason {
            Some(reason) => {
                debug!(connection.id = lease.id(), %reason, "Evicting connection");
                lease.evict();
            }
            None => {
                lease.release();
            }
        }
    }

    /// Remember that an exchange on a freshly connected route failed
    pub fn route_failed(&self, route: &Route) {
        self.route_db.failed(route);
    }
}

impl fmt::Debug for ConnectionAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionAllocator")
            .field("pool", &self.pool)
            .field("proxy", &self.proxy)
            .field("tls", &self.tls)
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        io,
        net::SocketAddr,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use tokio::io::{DuplexStream, duplex};

    use super::*;
    use crate::{
        core::{client::HttpClient, error::TimeoutPhase, request::Request},
        ports::transport::BoxedTransport,
    };

    struct FixedDns(Vec<SocketAddr>);

    #[async_trait]
    impl Dns for FixedDns {
        async fn lookup(&self, _host: &str, _port: u16) -> io::Result<Vec<SocketAddr>> {
            Ok(self.0.clone())
        }
    }

    /// Refuses port 1, hangs on port 2, connects to an in-memory pipe otherwise
    #[derive(Default)]
    struct ScriptedConnector {
        attempts: AtomicUsize,
        peers: Mutex<Vec<DuplexStream>>,
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, route: &Route, _timeout: Duration) -> io::Result<BoxedTransport> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            match route.socket_addr.port() {
                1 => Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused")),
                2 => std::future::pending().await,
                _ => {
                    let (client, server) = duplex(1024);
                    self.peers.lock().unwrap().push(server);
                    Ok(Box::new(client))
                }
            }
        }
    }

    fn allocator(addrs: &[&str]) -> (ConnectionAllocator, Arc<ScriptedConnector>) {
        let connector = Arc::new(ScriptedConnector::default());
        let dns = FixedDns(addrs.iter().map(|a| a.parse().unwrap()).collect());
        let allocator = ConnectionAllocator::new(
            Arc::new(ConnectionPool::new(5, Duration::from_secs(60))),
            connector.clone(),
            Arc::new(dns),
            Arc::new(RouteDatabase::new()),
            Proxy::Direct,
            TlsSettings::default(),
            DiscardPolicy::default(),
        );
        (allocator, connector)
    }

    fn call() -> Call {
        let client = HttpClient::builder().build().unwrap();
        client.new_call(Request::get("http://example.com/").unwrap())
    }

    fn url() -> HttpUrl {
        HttpUrl::parse("http://example.com/").unwrap()
    }

    #[tokio::test]
    async fn test_fallback_records_suppressed_failure() {
        let (allocator, _) = allocator(&["127.0.0.1:1", "127.0.0.1:3"]);
        let call = call();

        let lease = allocator
            .allocate(&call, &url(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(lease.route().socket_addr.port(), 3);

        let suppressed = call.suppressed_failures();
        assert_eq!(suppressed.len(), 1);
        assert_eq!(suppressed[0].route.socket_addr.port(), 1);
        assert_eq!(suppressed[0].kind, io::ErrorKind::ConnectionRefused);
    }

    #[tokio::test]
    async fn test_all_routes_failing_aggregates_attempts() {
        let (allocator, connector) = allocator(&["127.0.0.1:1", "127.0.0.1:2"]);
        let call = call();

        let error = allocator
            .allocate(&call, &url(), Duration::from_millis(50))
            .await
            .unwrap_err();
        let HttpError::RoutesExhausted { attempts } = error else {
            panic!("expected route exhaustion, got {error:?}");
        };
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[0].kind, io::ErrorKind::ConnectionRefused);
        assert_eq!(attempts[1].kind, io::ErrorKind::TimedOut);
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 2);
        assert!(call.suppressed_failures().is_empty());
    }

    #[tokio::test]
    async fn test_failed_route_is_postponed_next_time() {
        let (allocator, connector) = allocator(&["127.0.0.1:1", "127.0.0.1:3"]);
        let lease = allocator
            .allocate(&call(), &url(), Duration::from_secs(1))
            .await
            .unwrap();
        allocator.release(lease, Some(EvictReason::Io));

        let call = call();
        allocator
            .allocate(&call, &url(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 3);
        assert!(call.suppressed_failures().is_empty());
    }

    #[tokio::test]
    async fn test_pool_hit_skips_connector() {
        let (allocator, connector) = allocator(&["127.0.0.1:3"]);
        let lease = allocator
            .allocate(&call(), &url(), Duration::from_secs(1))
            .await
            .unwrap();
        let id = lease.id();
        allocator.release(lease, None);

        let again = allocator
            .allocate(&call(), &url(), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(again.id(), id);
        assert!(again.is_reused());
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_canceled_call_does_not_connect() {
        let (allocator, connector) = allocator(&["127.0.0.1:3"]);
        let call = call();
        call.cancel();
        let result = allocator.allocate(&call, &url(), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(HttpError::Canceled)));
        assert_eq!(connector.attempts.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_discard_policy() {
        let timeout = HttpError::Timeout {
            phase: TimeoutPhase::Read,
            after: Duration::from_secs(1),
        };
        let lenient = DiscardPolicy {
            discard_on_timeout: false,
            honor_connection_close: true,
        };
        assert_eq!(lenient.eviction_for(&timeout), None);
        assert_eq!(
            DiscardPolicy::default().eviction_for(&timeout),
            Some(EvictReason::Timeout)
        );
        let io = HttpError::Io(io::Error::other("reset"));
        assert_eq!(lenient.eviction_for(&io), Some(EvictReason::Io));
        assert_eq!(
            lenient.eviction_for(&HttpError::MalformedResponse("x".into())),
            Some(EvictReason::ProtocolError)
        );
    }
}
