//! Tether - an interceptor-driven HTTP/1.1 client core.
//!
//! Tether executes HTTP calls through an ordered chain of interceptors and keeps
//! connections in a route-aware pool so later calls to the same origin reuse them.
//! The crate follows a **hexagonal architecture**: collaborator traits live in
//! `ports`, tokio/rustls implementations in `adapters`, and the call machinery in
//! `core`.
//!
//! # Features
//! - Application and network interceptors with enforced pipeline rules
//!   (single `proceed`, host/port retention, non-empty responses)
//! - Connection pool keyed by route, with keep-alive expiry, idle caps and a
//!   background sweep
//! - Route fallback across resolved addresses with suppressed-failure reporting
//! - Retries of recoverable failures, redirects and `408` follow-ups
//! - Cooperative cancellation and per-phase connect/read/write timeouts
//! - HTTP proxies (absolute-form requests and `CONNECT` tunnels) and TLS via rustls
//! - Structured tracing via `tracing`
//!
//! # Quick Example
//! ```no_run
//! use tether::{HttpClient, Request};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let client = HttpClient::new()?;
//! let response = client.execute(Request::get("http://example.com/")?).await?;
//! let status = response.status();
//! println!("{status} {}", response.text().await?);
//! # Ok(()) }
//! ```
//!
//! # Interceptors
//! ```no_run
//! use async_trait::async_trait;
//! use tether::{Chain, HttpClient, HttpResult, Interceptor, Response};
//!
//! struct Logging;
//!
//! #[async_trait]
//! impl Interceptor for Logging {
//!     async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
//!         tracing::info!(url = %chain.request().url(), "Sending request");
//!         chain.proceed(chain.request().clone()).await
//!     }
//! }
//!
//! # fn main() -> eyre::Result<()> {
//! let client = HttpClient::builder().add_network_interceptor(Logging).build()?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Call execution returns [`HttpResult`] with the [`HttpError`] taxonomy. Client
//! construction and configuration loading return `eyre::Result<T>` with context
//! attached using `WrapErr`.
pub mod config;
pub mod ports;
pub mod tracing_setup;

pub mod adapters;
pub mod core;

// Re-export the types most callers need
pub use crate::{
    config::ClientConfig,
    core::{
        BytesBody, Call, CallState, Chain, ConnectionPool, FormBody, Headers, HttpClient,
        HttpError, HttpResult, HttpUrl, Request, RequestBody, Response, ResponseBody,
    },
    ports::Interceptor,
};
