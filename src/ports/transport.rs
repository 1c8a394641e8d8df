use std::{io, net::SocketAddr, time::Duration};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::core::route::Route;

/// A connected, possibly encrypted, byte stream.
pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Transport for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type BoxedTransport = Box<dyn Transport>;

/// Connector defines the port (interface) for establishing transports to routes
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to a route
    ///
    /// # Arguments
    /// * `route` - The resolved route (target, proxy and socket address)
    /// * `timeout` - Upper bound for TCP connect, tunnel setup and TLS handshake
    ///
    /// # Returns
    /// A future that resolves to the connected stream or the I/O error that prevented it
    async fn connect(&self, route: &Route, timeout: Duration) -> io::Result<BoxedTransport>;
}

/// Dns defines the port (interface) for resolving host names
#[async_trait]
pub trait Dns: Send + Sync + 'static {
    /// Resolve `host` to socket addresses using `port`, in preference order
    async fn lookup(&self, host: &str, port: u16) -> io::Result<Vec<SocketAddr>>;
}
