//! Configuration data structures for Tether clients.
//!
//! These types map directly to TOML (also JSON / YAML) configuration files. Every
//! section has defaults so a minimal config, or none at all, yields a usable client.
//! A config is read once when the client is built; the client never changes it.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::{
    allocator::DiscardPolicy,
    chain::Timeouts,
    route::{Proxy, TlsSettings},
};

fn default_user_agent() -> String {
    format!("tether/{}", env!("CARGO_PKG_VERSION"))
}

/// Per-phase I/O timeouts, in milliseconds
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    /// TCP connect, proxy tunnel and TLS handshake
    pub connect_ms: u64,
    /// Each blocking read
    pub read_ms: u64,
    /// Each blocking write
    pub write_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            read_ms: 10_000,
            write_ms: 10_000,
        }
    }
}

impl TimeoutConfig {
    pub fn to_timeouts(&self) -> Timeouts {
        Timeouts {
            connect: Duration::from_millis(self.connect_ms),
            read: Duration::from_millis(self.read_ms),
            write: Duration::from_millis(self.write_ms),
        }
    }
}

/// Idle connection pool sizing
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of idle connections kept across all routes
    pub max_idle_connections: usize,
    /// How long an idle connection is kept before it is closed
    pub keep_alive_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_connections: 5,
            keep_alive_secs: 300,
        }
    }
}

impl PoolConfig {
    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry idempotent requests after I/O failures and timeouts on a bound connection
    pub retry_on_connection_failure: bool,
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on_connection_failure: true,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct RedirectConfig {
    pub follow_redirects: bool,
    /// Follow redirects that switch between http and https
    pub follow_ssl_redirects: bool,
    /// Upper bound on redirects plus 408 retries for one call
    pub max_follow_ups: u32,
}

impl Default for RedirectConfig {
    fn default() -> Self {
        Self {
            follow_redirects: true,
            follow_ssl_redirects: true,
            max_follow_ups: 20,
        }
    }
}

/// When a connection that finished an exchange is closed instead of pooled.
/// I/O and protocol errors always close it.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct DiscardConfig {
    /// Close the connection after a read or write timeout. When `false`, only
    /// a timeout before any request byte was written keeps the connection.
    pub discard_on_timeout: bool,
    /// Close the connection when the server answers `Connection: close`
    pub honor_connection_close: bool,
}

impl Default for DiscardConfig {
    fn default() -> Self {
        Self {
            discard_on_timeout: true,
            honor_connection_close: true,
        }
    }
}

impl DiscardConfig {
    pub fn to_policy(&self) -> DiscardPolicy {
        DiscardPolicy {
            discard_on_timeout: self.discard_on_timeout,
            honor_connection_close: self.honor_connection_close,
        }
    }
}

/// HTTP proxy every connection goes through
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(default)]
pub struct TlsConfig {
    /// Skip certificate verification. Only for testing against self-signed servers.
    pub accept_invalid_certs: bool,
}

impl TlsConfig {
    pub fn to_settings(&self) -> TlsSettings {
        TlsSettings {
            accept_invalid_certs: self.accept_invalid_certs,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ClientConfig {
    pub timeouts: TimeoutConfig,
    pub pool: PoolConfig,
    pub retry: RetryConfig,
    pub redirects: RedirectConfig,
    pub discard: DiscardConfig,
    pub proxy: Option<ProxyConfig>,
    pub tls: TlsConfig,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            pool: PoolConfig::default(),
            retry: RetryConfig::default(),
            redirects: RedirectConfig::default(),
            discard: DiscardConfig::default(),
            proxy: None,
            tls: TlsConfig::default(),
            user_agent: default_user_agent(),
        }
    }
}

impl ClientConfig {
    /// Create a new client configuration builder
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    pub fn proxy(&self) -> Proxy {
        match &self.proxy {
            Some(proxy) => Proxy::Http {
                host: proxy.host.clone(),
                port: proxy.port,
            },
            None => Proxy::Direct,
        }
    }
}

/// Builder for ClientConfig to allow for cleaner configuration creation
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.connect_ms = timeout.as_millis() as u64;
        self
    }

    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.read_ms = timeout.as_millis() as u64;
        self
    }

    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeouts.write_ms = timeout.as_millis() as u64;
        self
    }

    /// Set connect, read and write timeouts at once
    pub fn timeout(self, timeout: Duration) -> Self {
        self.connect_timeout(timeout)
            .read_timeout(timeout)
            .write_timeout(timeout)
    }

    pub fn max_idle_connections(mut self, max: usize) -> Self {
        self.config.pool.max_idle_connections = max;
        self
    }

    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.config.pool.keep_alive_secs = keep_alive.as_secs();
        self
    }

    pub fn retry_on_connection_failure(mut self, enabled: bool) -> Self {
        self.config.retry.retry_on_connection_failure = enabled;
        self
    }

    pub fn max_retries(mut self, max: u32) -> Self {
        self.config.retry.max_retries = max;
        self
    }

    pub fn follow_redirects(mut self, enabled: bool) -> Self {
        self.config.redirects.follow_redirects = enabled;
        self
    }

    pub fn follow_ssl_redirects(mut self, enabled: bool) -> Self {
        self.config.redirects.follow_ssl_redirects = enabled;
        self
    }

    pub fn max_follow_ups(mut self, max: u32) -> Self {
        self.config.redirects.max_follow_ups = max;
        self
    }

    pub fn discard(mut self, discard: DiscardConfig) -> Self {
        self.config.discard = discard;
        self
    }

    /// Route every connection through an HTTP proxy
    pub fn proxy(mut self, host: impl Into<String>, port: u16) -> Self {
        self.config.proxy = Some(ProxyConfig {
            host: host.into(),
            port,
        });
        self
    }

    pub fn accept_invalid_certs(mut self, accept: bool) -> Self {
        self.config.tls.accept_invalid_certs = accept;
        self
    }

    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.config.user_agent = user_agent.into();
        self
    }

    pub fn build(self) -> ClientConfig {
        self.config
    }
}
