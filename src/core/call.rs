//! Calls and the call engine.
//!
//! A [`Call`] is the execution handle for one logical request. Executing it
//! runs the interceptor chain in a loop: each iteration is one attempt with a
//! freshly built chain. Recoverable failures are retried and redirects or 408
//! responses are followed up here, so application interceptors see every
//! attempt and every chain proceeds at most once.
use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
};

use http::{Method, StatusCode};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};
use uuid::Uuid;

use crate::{
    core::{
        chain::Chain,
        client::HttpClient,
        error::{ConnectFailure, HttpError, HttpResult},
        request::Request,
        response::Response,
        route::Route,
    },
    tracing_setup::create_call_span,
};

/// Lifecycle of a call. Only `Created` may start executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallState {
    Created,
    Executing,
    Completed,
    Failed,
    Canceled,
}

struct CallInner {
    id: Uuid,
    client: HttpClient,
    original_request: Request,
    state: Mutex<CallState>,
    cancel: CancellationToken,
    suppressed: Mutex<Vec<ConnectFailure>>,
    /// Route of the connection bound by the current attempt, and whether it came from the pool
    bound_route: Mutex<Option<(Route, bool)>>,
}

/// Execution handle for one request. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Call {
    inner: Arc<CallInner>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl Call {
    pub(crate) fn new(client: HttpClient, request: Request) -> Self {
        Self {
            inner: Arc::new(CallInner {
                id: Uuid::new_v4(),
                client,
                original_request: request,
                state: Mutex::new(CallState::Created),
                cancel: CancellationToken::new(),
                suppressed: Mutex::new(Vec::new()),
                bound_route: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// The request as submitted, before any interceptor rewrote it
    pub fn request(&self) -> &Request {
        &self.inner.original_request
    }

    pub fn state(&self) -> CallState {
        *lock(&self.inner.state)
    }

    pub fn is_executed(&self) -> bool {
        self.state() != CallState::Created
    }

    /// Cancel the call. An execution in progress stops at its next
    /// checkpoint; a call not yet executed fails as soon as it starts.
    pub fn cancel(&self) {
        debug!(call.id = %self.inner.id, "Call canceled");
        self.inner.cancel.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.inner.cancel
    }

    pub(crate) fn check_canceled(&self) -> HttpResult<()> {
        if self.is_canceled() {
            Err(HttpError::Canceled)
        } else {
            Ok(())
        }
    }

    /// Connect failures of routes that were tried before a later route succeeded
    pub fn suppressed_failures(&self) -> Vec<ConnectFailure> {
        lock(&self.inner.suppressed).clone()
    }

    pub(crate) fn add_suppressed_failures(&self, failures: Vec<ConnectFailure>) {
        lock(&self.inner.suppressed).extend(failures);
    }

    pub(crate) fn bind_route(&self, route: Route, reused: bool) {
        *lock(&self.inner.bound_route) = Some((route, reused));
    }

    fn take_bound_route(&self) -> Option<(Route, bool)> {
        lock(&self.inner.bound_route).take()
    }

    /// Run the call to completion. A call executes at most once.
    pub async fn execute(&self) -> HttpResult<Response> {
        {
            let mut state = lock(&self.inner.state);
            if *state != CallState::Created {
                return Err(HttpError::Usage(format!(
                    "call {} already executed (state {:?})",
                    self.inner.id, *state
                )));
            }
            *state = CallState::Executing;
        }

        let request = &self.inner.original_request;
        let span = create_call_span(self.inner.id, request.method(), request.url());
        let result = self.run().instrument(span.clone()).await;

        let next_state = match &result {
            Ok(response) => {
                span.record("http.status_code", response.status().as_u16());
                CallState::Completed
            }
            Err(error) if error.is_canceled() => CallState::Canceled,
            Err(error) => {
                span.in_scope(|| warn!(error = %error, "Call failed"));
                CallState::Failed
            }
        };
        *lock(&self.inner.state) = next_state;
        result
    }

    /// Execute on a runtime worker and hand the outcome to `callback`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F>(&self, callback: F) -> JoinHandle<()>
    where
        F: FnOnce(&Call, HttpResult<Response>) + Send + 'static,
    {
        let call = self.clone();
        tokio::spawn(async move {
            let result = call.execute().await;
            callback(&call, result);
        })
    }

    async fn run(&self) -> HttpResult<Response> {
        let client = &self.inner.client;
        let config = client.config();
        let mut request = self.inner.original_request.clone();
        let mut prior: Option<Response> = None;
        let mut follow_ups: u32 = 0;
        let mut retries: u32 = 0;

        loop {
            self.check_canceled()?;
            let chain = Chain::new(
                client.stages(),
                request.clone(),
                self.clone(),
                client.timeouts(),
            );
            let response = match chain.proceed(request.clone()).await {
                Ok(response) => {
                    self.take_bound_route();
                    response
                }
                Err(error) => {
                    let bound = self.take_bound_route();
                    if !self.can_retry(&error, &request, retries) {
                        return Err(error);
                    }
                    retries += 1;
                    if let Some((route, false)) = &bound {
                        client.allocator().route_failed(route);
                    }
                    warn!(
                        attempt = retries,
                        error = %error,
                        "Recoverable failure; retrying request"
                    );
                    continue;
                }
            };
            let mut response = response.into_builder().prior_response(prior.take()).build();

            let Some(next) = self.follow_up(&request, &response) else {
                return Ok(response);
            };
            follow_ups += 1;
            if follow_ups > config.redirects.max_follow_ups {
                if let Some(body) = response.take_body() {
                    body.close().await;
                }
                return Err(HttpError::TooManyFollowUps(follow_ups));
            }
            if next.has_one_shot_body() {
                return Ok(response);
            }
            info!(
                status = response.status().as_u16(),
                location = %next.url(),
                "Following up"
            );
            if let Some(body) = response.take_body() {
                body.close().await;
            }
            prior = Some(response);
            request = next;
        }
    }

    fn can_retry(&self, error: &HttpError, request: &Request, retries: u32) -> bool {
        let retry = &self.inner.client.config().retry;
        retry.retry_on_connection_failure
            && retries < retry.max_retries
            && error.is_recoverable()
            && !self.is_canceled()
            && request.is_idempotent()
            && !request.has_one_shot_body()
    }

    /// The request to send after `response`, or `None` when the call is done.
    /// `request` is the request as the engine sent it, before interceptors.
    fn follow_up(&self, request: &Request, response: &Response) -> Option<Request> {
        let config = self.inner.client.config();
        match response.status().as_u16() {
            300..=303 | 307 | 308 if config.redirects.follow_redirects => {
                self.redirect(request, response)
            }
            408 => {
                if !config.retry.retry_on_connection_failure || request.has_one_shot_body() {
                    return None;
                }
                if response
                    .prior_response()
                    .is_some_and(|prior| prior.status() == StatusCode::REQUEST_TIMEOUT)
                {
                    return None;
                }
                if retry_after_secs(response) > 0 {
                    return None;
                }
                Some(request.clone())
            }
            _ => None,
        }
    }

    fn redirect(&self, request: &Request, response: &Response) -> Option<Request> {
        let location = response.header("location")?;
        let from = response.request().url();
        let url = from.resolve(location)?;
        if url.scheme() != from.scheme() && !self.inner.client.config().redirects.follow_ssl_redirects
        {
            return None;
        }

        let status = response.status().as_u16();
        let mut builder = request.to_builder();
        let method = request.method();
        // 307 and 308 keep the method and body; other redirects of a request with a body become GET
        let maintain_body = status == 307 || status == 308;
        if *method != Method::GET && *method != Method::HEAD && !maintain_body {
            builder = builder
                .get()
                .remove_header("Transfer-Encoding")
                .remove_header("Content-Length")
                .remove_header("Content-Type");
        }
        let same_origin = url.scheme() == from.scheme()
            && url.port() == from.port()
            && url.host().eq_ignore_ascii_case(from.host());
        if !same_origin {
            builder = builder.remove_header("Authorization");
        }
        builder.http_url(url).build().ok()
    }
}

/// `Retry-After` in seconds. Absent means 0; anything but a number means "do not retry".
fn retry_after_secs(response: &Response) -> u64 {
    match response.header("retry-after") {
        None => 0,
        Some(value) => value.trim().parse().unwrap_or(u64::MAX),
    }
}

impl fmt::Debug for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Call")
            .field("id", &self.inner.id)
            .field("request", &self.inner.original_request)
            .field("state", &self.state())
            .field("canceled", &self.is_canceled())
            .finish()
    }
}
