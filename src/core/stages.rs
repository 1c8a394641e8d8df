//! Built-in chain stages.
use std::sync::Arc;

use async_trait::async_trait;
use http::Method;
use tracing::debug;

use crate::{
    core::{
        allocator::ConnectionAllocator,
        chain::Chain,
        error::{HttpError, HttpResult},
        exchange::Exchange,
        response::Response,
    },
    ports::interceptor::Interceptor,
};

/// Turns the caller's request into a network request by filling in the
/// headers the wire needs, then restores the caller's request on the response.
#[derive(Debug, Clone)]
pub struct BridgeStage {
    user_agent: String,
}

impl BridgeStage {
    pub fn new(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: user_agent.into(),
        }
    }
}

#[async_trait]
impl Interceptor for BridgeStage {
    fn name(&self) -> &str {
        "bridge"
    }

    async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
        let user_request = chain.request().clone();
        let mut builder = user_request.to_builder();

        match user_request.body() {
            Some(body) => {
                if let Some(content_type) = body.content_type() {
                    if !user_request.headers().contains("content-type") {
                        builder = builder.set_header("Content-Type", content_type);
                    }
                }
                builder = match body.content_length() {
                    Some(length) => builder
                        .set_header("Content-Length", &length.to_string())
                        .remove_header("Transfer-Encoding"),
                    None => builder
                        .set_header("Transfer-Encoding", "chunked")
                        .remove_header("Content-Length"),
                };
            }
            None => {
                if matches!(
                    *user_request.method(),
                    Method::POST | Method::PUT | Method::PATCH
                ) {
                    builder = builder.set_header("Content-Length", "0");
                }
            }
        }
        if !user_request.headers().contains("host") {
            builder = builder.set_header("Host", &user_request.url().authority());
        }
        if !user_request.headers().contains("connection") {
            builder = builder.set_header("Connection", "keep-alive");
        }
        if !user_request.headers().contains("user-agent") {
            builder = builder.set_header("User-Agent", &self.user_agent);
        }

        let network_response = chain.proceed(builder.build()?).await?;
        Ok(network_response.into_builder().request(user_request).build())
    }
}

/// Allocator boundary: leases a connection and binds it to the rest of the chain.
#[derive(Debug)]
pub struct ConnectStage {
    allocator: Arc<ConnectionAllocator>,
}

impl ConnectStage {
    pub fn new(allocator: Arc<ConnectionAllocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl Interceptor for ConnectStage {
    fn name(&self) -> &str {
        "connect"
    }

    async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
        let request = chain.request().clone();
        let call = chain.call();
        let lease = self
            .allocator
            .allocate(call, request.url(), chain.connect_timeout())
            .await?;
        call.bind_route(lease.route().clone(), lease.is_reused());
        let exchange = Exchange::new(
            lease,
            call.cancel_token().clone(),
            self.allocator.discard_policy(),
        )?;
        debug!(
            connection.id = exchange.connection_id(),
            reused = exchange.is_reused(),
            "Connection bound to call"
        );
        chain.proceed_with_exchange(request, exchange).await
    }
}

/// Terminal stage: writes the request and reads the response head.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallServerStage;

#[async_trait]
impl Interceptor for CallServerStage {
    fn name(&self) -> &str {
        "call-server"
    }

    async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
        let mut exchange = chain.take_exchange().ok_or_else(|| {
            HttpError::violation(
                "terminal stage call-server",
                "no connection is bound to the chain",
            )
        })?;
        exchange.set_timeouts(chain.read_timeout(), chain.write_timeout());
        let request = chain.request().clone();

        let head = async {
            exchange.write_request_headers(&request).await?;
            exchange.write_request_body(&request).await?;
            exchange.read_response_headers().await
        }
        .await;

        match head {
            Ok(head) => {
                debug!(
                    status = head.status.as_u16(),
                    connection.id = exchange.connection_id(),
                    "Response headers received"
                );
                exchange.into_response(request, head).await
            }
            Err(error) => {
                exchange.fail(&error);
                Err(error)
            }
        }
    }
}
