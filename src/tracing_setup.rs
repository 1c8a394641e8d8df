use eyre::{Result, WrapErr};
use http::Method;
use tracing_subscriber::{EnvFilter, Registry, layer::SubscriberExt, util::SubscriberInitExt};
use uuid::Uuid;

use crate::core::{connection::ConnectionId, route::Route, url::HttpUrl};

/// `RUST_LOG` when set, warnings only otherwise
fn default_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
}

/// Initialize structured logging with JSON output on stderr, filtered by `RUST_LOG`
pub fn init_tracing() -> Result<()> {
    Registry::default()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(true)
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .wrap_err("Failed to install JSON tracing subscriber")?;

    tracing::debug!("Tether structured logging initialized");
    Ok(())
}

/// Initialize human-readable logging on stderr, filtered by `RUST_LOG`
pub fn init_console_tracing() -> Result<()> {
    Registry::default()
        .with(default_filter())
        .with(
            tracing_subscriber::fmt::layer()
                .pretty()
                .with_target(true)
                .with_thread_ids(true)
                .with_file(true)
                .with_line_number(true)
                .with_writer(std::io::stderr),
        )
        .try_init()
        .wrap_err("Failed to install console tracing subscriber")?;

    tracing::debug!("Tether console logging initialized");
    Ok(())
}

/// Initialize tracing with custom configuration
pub fn init_tracing_with_config(level: &str, json_format: bool, include_spans: bool) -> Result<()> {
    let env_filter =
        EnvFilter::try_new(level).wrap_err_with(|| format!("Invalid log level: {level}"))?;

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let installed = if json_format {
        Registry::default()
            .with(env_filter)
            .with(
                fmt_layer
                    .json()
                    .with_current_span(include_spans)
                    .with_span_list(include_spans),
            )
            .try_init()
    } else {
        Registry::default()
            .with(env_filter)
            .with(fmt_layer.compact().with_writer(std::io::stderr))
            .try_init()
    };
    installed.wrap_err("Failed to install tracing subscriber")?;

    tracing::debug!(level, json_format, include_spans, "Tether logging initialized");
    Ok(())
}

/// Span covering one call from `execute` to its final response or error.
/// `http.status_code` is recorded once the call completes.
pub fn create_call_span(call_id: Uuid, method: &Method, url: &HttpUrl) -> tracing::Span {
    tracing::info_span!(
        "call",
        call.id = %call_id,
        http.method = %method,
        http.url = url.as_str(),
        http.status_code = tracing::field::Empty,
    )
}

/// Span covering the establishment of one connection
pub fn create_connection_span(id: ConnectionId, route: &Route) -> tracing::Span {
    tracing::debug_span!(
        "connect",
        connection.id = id,
        net.peer = %route.socket_addr,
        server.address = %route.address.host,
        server.port = route.address.port,
        tls = route.address.https,
        proxy = %route.address.proxy,
    )
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;
    use crate::core::route::{Address, Proxy};

    #[test]
    fn test_init_tracing_with_config() {
        let result = init_tracing_with_config("debug", true, true);
        assert!(result.is_ok());
    }

    #[test]
    fn test_invalid_level_rejected() {
        assert!(init_tracing_with_config("tether=verbose", false, false).is_err());
    }

    #[test]
    fn test_create_call_span() {
        let url = HttpUrl::parse("https://example.com/a").unwrap();
        let span = create_call_span(Uuid::new_v4(), &Method::GET, &url);
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "call");
        }
    }

    #[test]
    fn test_create_connection_span() {
        let url = HttpUrl::parse("http://example.com/").unwrap();
        let addr: SocketAddr = "127.0.0.1:80".parse().unwrap();
        let route = Route::new(Address::new(&url, Proxy::Direct), addr);
        let span = create_connection_span(42, &route);
        if let Some(metadata) = span.metadata() {
            assert_eq!(metadata.name(), "connect");
        }
    }
}
