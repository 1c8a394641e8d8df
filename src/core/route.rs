//! Addresses, proxies and the routes connections are shared over.
use std::{
    collections::HashSet,
    fmt,
    net::{IpAddr, SocketAddr},
    sync::Mutex,
};

use tracing::debug;

use crate::{
    core::{
        error::{HttpError, HttpResult},
        url::HttpUrl,
    },
    ports::transport::Dns,
};

/// How connections reach the origin server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Proxy {
    #[default]
    Direct,
    /// Plain HTTP proxy. HTTPS traffic is tunnelled through it with `CONNECT`.
    Http { host: String, port: u16 },
}

impl Proxy {
    pub fn is_direct(&self) -> bool {
        matches!(self, Proxy::Direct)
    }
}

impl fmt::Display for Proxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proxy::Direct => f.write_str("direct"),
            Proxy::Http { host, port } => write!(f, "http proxy {host}:{port}"),
        }
    }
}

/// TLS settings of the connector a connection was made with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TlsSettings {
    pub accept_invalid_certs: bool,
}

/// Origin server plus the connection settings that must match for two
/// requests to share a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    pub https: bool,
    pub host: String,
    pub port: u16,
    pub proxy: Proxy,
    /// Part of the identity even for plain HTTP: clients sharing a pool only
    /// reuse connections their own connector settings would have made
    pub tls: TlsSettings,
}

impl Address {
    pub fn new(url: &HttpUrl, proxy: Proxy) -> Self {
        Self {
            https: url.is_https(),
            host: url.host_for_connect().to_string(),
            port: url.port(),
            proxy,
            tls: TlsSettings::default(),
        }
    }

    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }

    /// Whether a connection to this address can carry a request for `url`
    pub fn supports_url(&self, url: &HttpUrl) -> bool {
        self.https == url.is_https()
            && self.port == url.port()
            && self.host.eq_ignore_ascii_case(url.host_for_connect())
    }

    /// `host:port` as written in a `CONNECT` request line
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Host and port the socket actually connects to
    pub fn dial_target(&self) -> (&str, u16) {
        match &self.proxy {
            Proxy::Direct => (self.host.as_str(), self.port),
            Proxy::Http { host, port } => (host.as_str(), *port),
        }
    }
}

/// A concrete way to reach an [`Address`]: one resolved socket address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub address: Address,
    pub socket_addr: SocketAddr,
}

impl Route {
    pub fn new(address: Address, socket_addr: SocketAddr) -> Self {
        Self {
            address,
            socket_addr,
        }
    }

    /// HTTPS through an HTTP proxy needs a `CONNECT` tunnel
    pub fn requires_tunnel(&self) -> bool {
        self.address.https && !self.address.proxy.is_direct()
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.address.https { "https" } else { "http" };
        write!(
            f,
            "{scheme}://{} at {}",
            self.address.authority(),
            self.socket_addr
        )?;
        if !self.address.proxy.is_direct() {
            write!(f, " via {}", self.address.proxy)?;
        }
        Ok(())
    }
}

/// Routes that failed recently. They are tried last until one succeeds again.
#[derive(Debug, Default)]
pub struct RouteDatabase {
    failed: Mutex<HashSet<Route>>,
}

impl RouteDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    fn failed_routes(&self) -> std::sync::MutexGuard<'_, HashSet<Route>> {
        self.failed.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn failed(&self, route: &Route) {
        self.failed_routes().insert(route.clone());
    }

    pub fn connected(&self, route: &Route) {
        self.failed_routes().remove(route);
    }

    pub fn should_postpone(&self, route: &Route) -> bool {
        self.failed_routes().contains(route)
    }
}

/// Resolve `address` into route candidates in the order they should be tried.
///
/// IP literals skip the resolver. Routes recorded as failed keep their
/// relative order but move behind every other candidate.
pub async fn select_routes(
    address: &Address,
    dns: &dyn Dns,
    database: &RouteDatabase,
) -> HttpResult<Vec<Route>> {
    let (host, port) = address.dial_target();
    let socket_addrs = match host.parse::<IpAddr>() {
        Ok(ip) => vec![SocketAddr::new(ip, port)],
        Err(_) => dns
            .lookup(host, port)
            .await
            .map_err(|e| HttpError::UnknownHost {
                host: host.to_string(),
                message: e.to_string(),
            })?,
    };
    if socket_addrs.is_empty() {
        return Err(HttpError::UnknownHost {
            host: host.to_string(),
            message: "no addresses returned".to_string(),
        });
    }

    let (postponed, fresh): (Vec<Route>, Vec<Route>) = socket_addrs
        .into_iter()
        .map(|addr| Route::new(address.clone(), addr))
        .partition(|route| database.should_postpone(route));
    if !postponed.is_empty() {
        debug!(
            host = %address.host,
            postponed = postponed.len(),
            "Postponing recently failed routes"
        );
    }
    Ok(fresh.into_iter().chain(postponed).collect())
}
