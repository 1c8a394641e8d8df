use async_trait::async_trait;

use crate::core::{chain::Chain, error::HttpResult, response::Response};

/// Interceptor is one processing stage of a call.
///
/// A stage receives the chain positioned just after itself. It may inspect or
/// rewrite `chain.request()`, forward with [`Chain::proceed`], inspect or rewrite
/// the response on the way back, or short-circuit with a synthetic response.
/// Stages registered as network interceptors run after a connection is bound and
/// must forward exactly once, to the same host and port.
#[async_trait]
pub trait Interceptor: Send + Sync + 'static {
    /// Name used when attributing errors and protocol violations to this stage
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn intercept(&self, chain: Chain) -> HttpResult<Response>;
}
