// Integration tests for interceptor ordering and the rules the chain enforces
mod common;

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use async_trait::async_trait;
    use http::StatusCode;
    use tether::{
        Chain, HttpClient, HttpError, HttpResult, Interceptor, Request, Response, ResponseBody,
    };

    use crate::common::{Reply, ScriptedServer, ok};

    /// Records its name on the way in and out
    struct Trace {
        name: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Interceptor for Trace {
        fn name(&self) -> &str {
            self.name
        }

        async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
            self.log.lock().unwrap().push(format!(
                "> {} bound={}",
                self.name,
                chain.connection_id().is_some()
            ));
            let response = chain.proceed(chain.request().clone()).await?;
            self.log.lock().unwrap().push(format!("< {}", self.name));
            Ok(response)
        }
    }

    /// Network interceptor that sends the request somewhere else
    struct Retarget(String);

    #[async_trait]
    impl Interceptor for Retarget {
        fn name(&self) -> &str {
            "retarget"
        }

        async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
            let request = chain.request().to_builder().url(&self.0).build()?;
            chain.proceed(request).await
        }
    }

    /// Answers without touching the network
    struct Canned {
        with_body: bool,
    }

    #[async_trait]
    impl Interceptor for Canned {
        fn name(&self) -> &str {
            "canned"
        }

        async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
            let builder = Response::builder(chain.request().clone()).status(StatusCode::OK);
            Ok(if self.with_body {
                builder
                    .body(ResponseBody::from_bytes("cached", Some("text/plain")))
                    .build()
            } else {
                builder.no_body().build()
            })
        }
    }

    /// Calls proceed twice on the same chain
    struct Twice;

    #[async_trait]
    impl Interceptor for Twice {
        fn name(&self) -> &str {
            "twice"
        }

        async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
            let first = chain.proceed(chain.request().clone()).await?;
            first.bytes().await?;
            chain.proceed(chain.request().clone()).await
        }
    }

    /// Shortens the read timeout for everything downstream
    struct FastReads;

    #[async_trait]
    impl Interceptor for FastReads {
        async fn intercept(&self, chain: Chain) -> HttpResult<Response> {
            let chain = chain.with_read_timeout(Duration::from_millis(100));
            chain.proceed(chain.request().clone()).await
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_interceptors_run_in_order_around_the_network() {
        let server = ScriptedServer::start(|_, _| Reply::Respond(ok("ordered"))).await;
        let log = Arc::new(Mutex::new(Vec::new()));
        let client = HttpClient::builder()
            .add_interceptor(Trace {
                name: "app1",
                log: log.clone(),
            })
            .add_network_interceptor(Trace {
                name: "net",
                log: log.clone(),
            })
            .add_interceptor(Trace {
                name: "app2",
                log: log.clone(),
            })
            .build()
            .unwrap();

        let response = client
            .execute(Request::get(&server.url("/")).unwrap())
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "ordered");
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "> app1 bound=false",
                "> app2 bound=false",
                "> net bound=true",
                "< net",
                "< app2",
                "< app1",
            ]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_application_interceptor_may_short_circuit() {
        let client = HttpClient::builder()
            .add_interceptor(Canned { with_body: true })
            .build()
            .unwrap();

        // Nothing listens here; the interceptor answers first
        let response = client
            .execute(Request::get("http://127.0.0.1:9/").unwrap())
            .await
            .unwrap();
        assert_eq!(response.connection_id(), None);
        assert_eq!(response.text().await.unwrap(), "cached");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_application_interceptor_may_change_host() {
        let server = ScriptedServer::start(|_, _| Reply::Respond(ok("rewritten"))).await;
        let client = HttpClient::builder()
            .add_interceptor(Retarget(server.url("/elsewhere")))
            .build()
            .unwrap();

        let response = client
            .execute(Request::get("http://127.0.0.1:9/").unwrap())
            .await
            .unwrap();
        assert_eq!(response.text().await.unwrap(), "rewritten");
        assert!(server.heads()[0].starts_with("GET /elsewhere HTTP/1.1\r\n"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_network_interceptor_must_keep_host_and_port() {
        let server = ScriptedServer::start(|_, _| Reply::Respond(ok("unreachable"))).await;
        let other = ScriptedServer::start(|_, _| Reply::Respond(ok("other"))).await;
        let client = HttpClient::builder()
            .add_network_interceptor(Retarget(other.url("/")))
            .build()
            .unwrap();

        let error = client
            .execute(Request::get(&server.url("/")).unwrap())
            .await
            .unwrap_err();
        assert!(error.is_protocol_violation(), "{error}");
        assert_eq!(error.stage(), Some("network interceptor retarget"));
        assert!(error.to_string().contains("must retain the same host and port"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.heads().is_empty());
        assert_eq!(other.connection_count(), 0);
        assert_eq!(client.pool().connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_network_interceptor_must_proceed() {
        let server = ScriptedServer::start(|_, _| Reply::Respond(ok("skipped"))).await;
        let client = HttpClient::builder()
            .add_network_interceptor(Canned { with_body: true })
            .build()
            .unwrap();

        let error = client
            .execute(Request::get(&server.url("/")).unwrap())
            .await
            .unwrap_err();
        assert!(error.is_protocol_violation(), "{error}");
        assert_eq!(error.stage(), Some("network interceptor canned"));
        assert!(error.to_string().contains("exactly once"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_second_proceed_is_rejected() {
        let server = ScriptedServer::start(|_, _| Reply::Respond(ok("first"))).await;
        let client = HttpClient::builder().add_interceptor(Twice).build().unwrap();

        let error = client
            .execute(Request::get(&server.url("/")).unwrap())
            .await
            .unwrap_err();
        assert!(error.is_protocol_violation(), "{error}");
        assert_eq!(error.stage(), Some("interceptor twice"));
        assert!(error.to_string().contains("at most once"));
        assert_eq!(server.heads().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_response_without_body_is_rejected() {
        let client = HttpClient::builder()
            .add_interceptor(Canned { with_body: false })
            .build()
            .unwrap();

        let error = client
            .execute(Request::get("http://127.0.0.1:9/").unwrap())
            .await
            .unwrap_err();
        assert!(error.is_protocol_violation(), "{error}");
        assert_eq!(error.stage(), Some("interceptor canned"));
        assert!(error.to_string().contains("no body"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_timeout_override_applies_downstream() {
        let server = ScriptedServer::start(|_, _| Reply::Hang).await;
        let client = HttpClient::builder()
            .config(
                tether::ClientConfig::builder()
                    .retry_on_connection_failure(false)
                    .build(),
            )
            .add_network_interceptor(FastReads)
            .build()
            .unwrap();

        let started = std::time::Instant::now();
        let error = client
            .execute(Request::get(&server.url("/")).unwrap())
            .await
            .unwrap_err();
        assert!(error.is_timeout(), "{error}");
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
