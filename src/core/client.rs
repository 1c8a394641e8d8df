use std::{fmt, sync::Arc};

use eyre::{Result, WrapErr};
use tracing::debug;

use crate::{
    adapters::{dns::SystemDns, tcp_connector::TcpConnector},
    config::{models::ClientConfig, validation::ClientConfigValidator},
    core::{
        allocator::ConnectionAllocator,
        call::Call,
        chain::{Stage, StageKind, Timeouts},
        error::HttpResult,
        pool::ConnectionPool,
        request::Request,
        response::Response,
        route::RouteDatabase,
        stages::{BridgeStage, CallServerStage, ConnectStage},
    },
    ports::{
        interceptor::Interceptor,
        transport::{Connector, Dns},
    },
};

struct ClientInner {
    config: ClientConfig,
    allocator: Arc<ConnectionAllocator>,
    stages: Arc<[Stage]>,
    timeouts: Timeouts,
}

/// An HTTP client: configuration, interceptors and a connection pool.
///
/// Cloning is cheap and clones share the pool. A client never changes after
/// it is built.
#[derive(Clone)]
pub struct HttpClient {
    inner: Arc<ClientInner>,
}

impl HttpClient {
    /// Client with the default configuration
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::default()
    }

    /// Prepare a call; nothing is sent until it is executed
    pub fn new_call(&self, request: Request) -> Call {
        Call::new(self.clone(), request)
    }

    /// Execute `request` and wait for the response head
    pub async fn execute(&self, request: Request) -> HttpResult<Response> {
        self.new_call(request).execute().await
    }

    pub async fn get(&self, url: &str) -> HttpResult<Response> {
        self.execute(Request::get(url)?).await
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        self.inner.allocator.pool()
    }

    pub fn route_database(&self) -> &Arc<RouteDatabase> {
        self.inner.allocator.route_database()
    }

    pub fn timeouts(&self) -> Timeouts {
        self.inner.timeouts
    }

    pub(crate) fn allocator(&self) -> &Arc<ConnectionAllocator> {
        &self.inner.allocator
    }

    pub(crate) fn stages(&self) -> Arc<[Stage]> {
        self.inner.stages.clone()
    }
}

impl fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClient")
            .field("stages", &self.inner.stages)
            .field("timeouts", &self.inner.timeouts)
            .field("pool", self.pool())
            .finish()
    }
}

/// Builder for [`HttpClient`].
///
/// Interceptors run in registration order. Pool, connector and resolver can be
/// injected; a pool shared between clients is shared as-is.
#[derive(Default)]
pub struct HttpClientBuilder {
    config: ClientConfig,
    interceptors: Vec<Arc<dyn Interceptor>>,
    network_interceptors: Vec<Arc<dyn Interceptor>>,
    pool: Option<Arc<ConnectionPool>>,
    connector: Option<Arc<dyn Connector>>,
    dns: Option<Arc<dyn Dns>>,
}

impl HttpClientBuilder {
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an application interceptor: runs once per attempt, before a connection is chosen
    pub fn add_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.interceptors.push(Arc::new(interceptor));
        self
    }

    /// Add a network interceptor: runs with a connection bound and must proceed exactly once
    pub fn add_network_interceptor(mut self, interceptor: impl Interceptor) -> Self {
        self.network_interceptors.push(Arc::new(interceptor));
        self
    }

    pub fn connection_pool(mut self, pool: Arc<ConnectionPool>) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn Dns>) -> Self {
        self.dns = Some(dns);
        self
    }

    /// Validate the configuration and assemble the stage list.
    ///
    /// A pool created here gets a background cleanup task when a tokio runtime is running.
    pub fn build(self) -> Result<HttpClient> {
        ClientConfigValidator::validate(&self.config)
            .wrap_err("Invalid HTTP client configuration")?;
        let config = self.config;

        let pool = match self.pool {
            Some(pool) => pool,
            None => {
                let pool = Arc::new(ConnectionPool::new(
                    config.pool.max_idle_connections,
                    config.pool.keep_alive(),
                ));
                if tokio::runtime::Handle::try_current().is_ok() {
                    pool.spawn_cleanup();
                } else {
                    debug!("No tokio runtime; idle connections are swept on use only");
                }
                pool
            }
        };
        let connector: Arc<dyn Connector> = match self.connector {
            Some(connector) => connector,
            None => Arc::new(
                TcpConnector::new(&config.tls).wrap_err("Failed to set up TLS connector")?,
            ),
        };
        let dns: Arc<dyn Dns> = self.dns.unwrap_or_else(|| Arc::new(SystemDns));

        let allocator = Arc::new(ConnectionAllocator::new(
            pool,
            connector,
            dns,
            Arc::new(RouteDatabase::new()),
            config.proxy(),
            config.tls.to_settings(),
            config.discard.to_policy(),
        ));

        let mut stages: Vec<Stage> = self
            .interceptors
            .into_iter()
            .map(|i| Stage::new(StageKind::Application, i))
            .collect();
        stages.push(Stage::new(
            StageKind::BuiltIn,
            Arc::new(BridgeStage::new(config.user_agent.clone())),
        ));
        stages.push(Stage::new(
            StageKind::BuiltIn,
            Arc::new(ConnectStage::new(allocator.clone())),
        ));
        stages.extend(
            self.network_interceptors
                .into_iter()
                .map(|i| Stage::new(StageKind::Network, i)),
        );
        stages.push(Stage::new(StageKind::Terminal, Arc::new(CallServerStage)));

        Ok(HttpClient {
            inner: Arc::new(ClientInner {
                timeouts: config.timeouts.to_timeouts(),
                config,
                allocator,
                stages: stages.into(),
            }),
        })
    }
}
