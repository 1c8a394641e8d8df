use std::{fmt, sync::Arc};

use http::Method;

use crate::core::{
    body::RequestBody,
    error::{HttpError, HttpResult},
    headers::Headers,
    url::HttpUrl,
};

/// An immutable outbound request.
///
/// Rewriting a request means building a new one from [`Request::to_builder`];
/// the body is shared, not copied.
#[derive(Clone)]
pub struct Request {
    method: Method,
    url: HttpUrl,
    headers: Headers,
    body: Option<Arc<dyn RequestBody>>,
}

impl Request {
    pub fn builder() -> RequestBuilder {
        RequestBuilder::default()
    }

    /// Shorthand for a GET request without headers
    pub fn get(url: &str) -> HttpResult<Request> {
        Request::builder().url(url).build()
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &HttpUrl {
        &self.url
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&Arc<dyn RequestBody>> {
        self.body.as_ref()
    }

    /// Safe or idempotent per RFC 9110: repeating the request has no extra effect
    pub fn is_idempotent(&self) -> bool {
        matches!(
            self.method,
            Method::GET
                | Method::HEAD
                | Method::OPTIONS
                | Method::TRACE
                | Method::PUT
                | Method::DELETE
        )
    }

    /// Whether the body can only be written once
    pub fn has_one_shot_body(&self) -> bool {
        self.body.as_ref().is_some_and(|body| body.is_one_shot())
    }

    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            method: self.method.clone(),
            url: Some(self.url.clone()),
            headers: self.headers.clone(),
            body: self.body.clone(),
            error: None,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("body", &self.body)
            .finish()
    }
}

/// Builder for [`Request`].
///
/// Invalid input (a bad URL or header) is remembered and reported by `build`,
/// so calls can be chained without intermediate `?`.
pub struct RequestBuilder {
    method: Method,
    url: Option<HttpUrl>,
    headers: Headers,
    body: Option<Arc<dyn RequestBody>>,
    error: Option<HttpError>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self {
            method: Method::GET,
            url: None,
            headers: Headers::new(),
            body: None,
            error: None,
        }
    }
}

impl RequestBuilder {
    fn fail(mut self, error: HttpError) -> Self {
        if self.error.is_none() {
            self.error = Some(error);
        }
        self
    }

    pub fn url(self, url: &str) -> Self {
        match HttpUrl::parse(url) {
            Ok(url) => self.http_url(url),
            Err(e) => self.fail(e.into()),
        }
    }

    pub fn http_url(mut self, url: HttpUrl) -> Self {
        self.url = Some(url);
        self
    }

    /// Append a header value
    pub fn header(mut self, name: &str, value: &str) -> Self {
        match self.headers.add(name, value) {
            Ok(()) => self,
            Err(e) => self.fail(e),
        }
    }

    /// Replace every value of a header
    pub fn set_header(mut self, name: &str, value: &str) -> Self {
        match self.headers.set(name, value) {
            Ok(()) => self,
            Err(e) => self.fail(e),
        }
    }

    pub fn remove_header(mut self, name: &str) -> Self {
        self.headers.remove(name);
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn method(mut self, method: Method, body: Option<Arc<dyn RequestBody>>) -> Self {
        self.method = method;
        self.body = body;
        self
    }

    pub fn get(self) -> Self {
        self.method(Method::GET, None)
    }

    pub fn head(self) -> Self {
        self.method(Method::HEAD, None)
    }

    pub fn delete(self) -> Self {
        self.method(Method::DELETE, None)
    }

    pub fn post(self, body: impl RequestBody + 'static) -> Self {
        self.method(Method::POST, Some(Arc::new(body)))
    }

    pub fn put(self, body: impl RequestBody + 'static) -> Self {
        self.method(Method::PUT, Some(Arc::new(body)))
    }

    pub fn patch(self, body: impl RequestBody + 'static) -> Self {
        self.method(Method::PATCH, Some(Arc::new(body)))
    }

    pub fn build(self) -> HttpResult<Request> {
        if let Some(error) = self.error {
            return Err(error);
        }
        let url = self
            .url
            .ok_or_else(|| HttpError::Usage("request has no URL".to_string()))?;
        if self.body.is_some() && matches!(self.method, Method::GET | Method::HEAD) {
            return Err(HttpError::InvalidRequest(format!(
                "method {} must not have a request body",
                self.method
            )));
        }
        Ok(Request {
            method: self.method,
            url,
            headers: self.headers,
            body: self.body,
        })
    }
}
