//! The interceptor chain.
//!
//! A [`Chain`] is one position in the ordered stage list together with the
//! request at that point and the timeouts in effect. Calling
//! [`Chain::proceed`] runs the next stage with a fresh chain positioned after
//! it. The chain enforces the pipeline rules on every step: a chain proceeds
//! at most once, stages after the connection is bound proceed exactly once and
//! keep the bound host and port, and every response carries a body.
use std::{
    fmt,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use crate::{
    core::{
        call::Call,
        connection::ConnectionId,
        error::{HttpError, HttpResult},
        exchange::Exchange,
        request::Request,
        response::Response,
        route::Route,
    },
    ports::interceptor::Interceptor,
};

/// Where a stage sits in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StageKind {
    /// Caller-supplied, runs once per attempt before any connection exists
    Application,
    /// Library stage between the application and network sections
    BuiltIn,
    /// Caller-supplied, runs with a connection bound
    Network,
    /// Performs the exchange; never proceeds
    Terminal,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StageKind::Application => f.write_str("interceptor"),
            StageKind::BuiltIn => f.write_str("built-in stage"),
            StageKind::Network => f.write_str("network interceptor"),
            StageKind::Terminal => f.write_str("terminal stage"),
        }
    }
}

#[derive(Clone)]
pub struct Stage {
    kind: StageKind,
    interceptor: Arc<dyn Interceptor>,
}

impl Stage {
    pub fn new(kind: StageKind, interceptor: Arc<dyn Interceptor>) -> Self {
        Self { kind, interceptor }
    }

    pub fn kind(&self) -> StageKind {
        self.kind
    }

    /// Kind and interceptor name, as used in error attribution
    pub fn name(&self) -> String {
        format!("{} {}", self.kind, self.interceptor.name())
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Connect, read and write timeouts carried by a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub write: Duration,
}

/// The connection bound to a chain past the allocator boundary.
#[derive(Clone)]
struct BoundConnection {
    route: Route,
    id: ConnectionId,
    /// Taken by the terminal stage
    exchange: Arc<Mutex<Option<Exchange>>>,
}

pub struct Chain {
    stages: Arc<[Stage]>,
    index: usize,
    request: Request,
    call: Call,
    timeouts: Timeouts,
    bound: Option<BoundConnection>,
    /// Shared with every chain derived through the `with_*_timeout` methods
    calls: Arc<AtomicUsize>,
}

impl Chain {
    pub(crate) fn new(stages: Arc<[Stage]>, request: Request, call: Call, timeouts: Timeouts) -> Self {
        Self {
            stages,
            index: 0,
            request,
            call,
            timeouts,
            bound: None,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// The request as seen by the stage holding this chain
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn call(&self) -> &Call {
        &self.call
    }

    pub fn connect_timeout(&self) -> Duration {
        self.timeouts.connect
    }

    pub fn read_timeout(&self) -> Duration {
        self.timeouts.read
    }

    pub fn write_timeout(&self) -> Duration {
        self.timeouts.write
    }

    pub fn timeouts(&self) -> Timeouts {
        self.timeouts
    }

    /// Id of the bound connection; `None` before the allocator boundary
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.bound.as_ref().map(|b| b.id)
    }

    /// Route of the bound connection; `None` before the allocator boundary
    pub fn route(&self) -> Option<&Route> {
        self.bound.as_ref().map(|b| &b.route)
    }

    fn derive(&self, timeouts: Timeouts) -> Chain {
        Chain {
            stages: self.stages.clone(),
            index: self.index,
            request: self.request.clone(),
            call: self.call.clone(),
            timeouts,
            bound: self.bound.clone(),
            calls: self.calls.clone(),
        }
    }

    /// A copy of this chain with another connect timeout. Proceeding on the
    /// copy counts as proceeding on this chain.
    pub fn with_connect_timeout(&self, timeout: Duration) -> Chain {
        self.derive(Timeouts {
            connect: timeout,
            ..self.timeouts
        })
    }

    pub fn with_read_timeout(&self, timeout: Duration) -> Chain {
        self.derive(Timeouts {
            read: timeout,
            ..self.timeouts
        })
    }

    pub fn with_write_timeout(&self, timeout: Duration) -> Chain {
        self.derive(Timeouts {
            write: timeout,
            ..self.timeouts
        })
    }

    /// The stage that owns this chain, i.e. the one allowed to call `proceed`
    fn owner(&self) -> String {
        match self.index {
            0 => "call engine".to_string(),
            i => self.stages[i - 1].name(),
        }
    }

    /// Run the rest of the pipeline with `request`.
    pub async fn proceed(&self, request: Request) -> HttpResult<Response> {
        self.proceed_bound(request, self.bound.clone()).await
    }

    /// Run the rest of the pipeline with `exchange` bound to it. Used at the
    /// allocator boundary.
    pub(crate) async fn proceed_with_exchange(
        &self,
        request: Request,
        exchange: Exchange,
    ) -> HttpResult<Response> {
        if self.bound.is_some() {
            return Err(HttpError::violation(
                self.owner(),
                "a connection is already bound to this chain",
            ));
        }
        let bound = BoundConnection {
            route: exchange.route().clone(),
            id: exchange.connection_id(),
            exchange: Arc::new(Mutex::new(Some(exchange))),
        };
        self.proceed_bound(request, Some(bound)).await
    }

    async fn proceed_bound(
        &self,
        request: Request,
        bound: Option<BoundConnection>,
    ) -> HttpResult<Response> {
        let Some(stage) = self.stages.get(self.index) else {
            return Err(HttpError::violation(
                self.owner(),
                "proceed called past the terminal stage",
            ));
        };
        if self.calls.fetch_add(1, Ordering::SeqCst) > 0 {
            return Err(HttpError::violation(
                self.owner(),
                "proceed() must be called at most once",
            ));
        }
        if let Some(bound) = &bound {
            if !bound.route.address.supports_url(request.url()) {
                return Err(HttpError::violation(
                    self.owner(),
                    format!(
                        "must retain the same host and port; connection is bound to {} but request targets {}",
                        bound.route.address.authority(),
                        request.url().authority()
                    ),
                ));
            }
        }
        self.call.check_canceled()?;

        let stage_name = stage.name();
        let terminal = self.index + 1 == self.stages.len();
        let has_bound = bound.is_some();
        let next = Chain {
            stages: self.stages.clone(),
            index: self.index + 1,
            request,
            call: self.call.clone(),
            timeouts: self.timeouts,
            bound,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let next_calls = next.calls.clone();

        let response = stage
            .interceptor
            .intercept(next)
            .await
            .map_err(|e| e.in_stage(&stage_name))?;

        if has_bound && !terminal && next_calls.load(Ordering::SeqCst) != 1 {
            return Err(HttpError::violation(
                stage_name,
                "must call proceed() exactly once",
            ));
        }
        if !response.has_body() {
            return Err(HttpError::violation(
                stage_name,
                "returned a response with no body",
            ));
        }
        Ok(response)
    }

    /// Take the bound exchange. Only the terminal stage does this.
    pub(crate) fn take_exchange(&self) -> Option<Exchange> {
        self.bound.as_ref().and_then(|bound| {
            bound
                .exchange
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .take()
        })
    }
}

impl fmt::Debug for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("index", &self.index)
            .field("stages", &self.stages)
            .field("url", &self.request.url().as_str())
            .field("timeouts", &self.timeouts)
            .field("connection_id", &self.connection_id())
            .finish()
    }
}
