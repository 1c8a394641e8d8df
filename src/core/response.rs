use std::fmt;

use bytes::Bytes;
use http::StatusCode;

use crate::core::{
    body::ResponseBody,
    connection::ConnectionId,
    error::HttpResult,
    headers::Headers,
    request::Request,
};

/// Wire protocol a response was received with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Protocol {
    Http10,
    #[default]
    Http11,
}

impl Protocol {
    pub fn parse(version: &str) -> Option<Protocol> {
        match version {
            "HTTP/1.0" => Some(Protocol::Http10),
            "HTTP/1.1" => Some(Protocol::Http11),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http10 => "HTTP/1.0",
            Protocol::Http11 => "HTTP/1.1",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An HTTP response.
///
/// Responses read from the network carry a streaming body that holds the
/// connection until it is consumed, closed or dropped.
pub struct Response {
    request: Request,
    protocol: Protocol,
    status: StatusCode,
    message: String,
    headers: Headers,
    body: Option<ResponseBody>,
    prior_response: Option<Box<Response>>,
    connection_id: Option<ConnectionId>,
}

impl Response {
    /// Start a response for `request`, status 200 and an empty header set
    pub fn builder(request: Request) -> ResponseBuilder {
        ResponseBuilder {
            request,
            protocol: Protocol::default(),
            status: StatusCode::OK,
            message: String::new(),
            headers: Headers::new(),
            body: None,
            prior_response: None,
            connection_id: None,
        }
    }

    /// The request that produced this response, as last rewritten by the chain
    pub fn request(&self) -> &Request {
        &self.request
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Reason phrase as sent by the server
    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn body(&self) -> Option<&ResponseBody> {
        self.body.as_ref()
    }

    pub fn body_mut(&mut self) -> Option<&mut ResponseBody> {
        self.body.as_mut()
    }

    pub fn has_body(&self) -> bool {
        self.body.is_some()
    }

    pub(crate) fn take_body(&mut self) -> Option<ResponseBody> {
        self.body.take()
    }

    /// Take the body, dropping the rest of the response
    pub fn into_body(self) -> ResponseBody {
        self.body.unwrap_or_else(ResponseBody::empty)
    }

    /// The response that triggered the redirect or retry leading to this one. It has no body.
    pub fn prior_response(&self) -> Option<&Response> {
        self.prior_response.as_deref()
    }

    /// Pool id of the connection that carried this response; `None` when synthetic
    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn is_redirect(&self) -> bool {
        matches!(self.status.as_u16(), 300..=303 | 307 | 308)
    }

    pub async fn bytes(self) -> HttpResult<Bytes> {
        self.into_body().bytes().await
    }

    pub async fn text(self) -> HttpResult<String> {
        self.into_body().text().await
    }

    pub fn into_builder(self) -> ResponseBuilder {
        ResponseBuilder {
            request: self.request,
            protocol: self.protocol,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: self.body,
            prior_response: self.prior_response,
            connection_id: self.connection_id,
        }
    }

    /// Copy of the response head without a body, for linking as a prior response
    pub(crate) fn strip_body(&self) -> Response {
        Response {
            request: self.request.clone(),
            protocol: self.protocol,
            status: self.status,
            message: self.message.clone(),
            headers: self.headers.clone(),
            body: None,
            prior_response: None,
            connection_id: self.connection_id,
        }
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Response")
            .field("protocol", &self.protocol)
            .field("status", &self.status)
            .field("message", &self.message)
            .field("url", &self.request.url().as_str())
            .field("headers", &self.headers)
            .field("body", &self.body)
            .field("connection_id", &self.connection_id)
            .finish()
    }
}

pub struct ResponseBuilder {
    request: Request,
    protocol: Protocol,
    status: StatusCode,
    message: String,
    headers: Headers,
    body: Option<ResponseBody>,
    prior_response: Option<Box<Response>>,
    connection_id: Option<ConnectionId>,
}

impl ResponseBuilder {
    pub fn request(mut self, request: Request) -> Self {
        self.request = request;
        self
    }

    pub fn protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> HttpResult<Self> {
        self.headers.add(name, value)?;
        Ok(self)
    }

    pub fn body(mut self, body: ResponseBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn no_body(mut self) -> Self {
        self.body = None;
        self
    }

    /// Link the previous response; its body is dropped
    pub fn prior_response(mut self, prior: Option<Response>) -> Self {
        self.prior_response = prior.map(|p| Box::new(p.strip_body()));
        self
    }

    pub(crate) fn connection_id(mut self, id: Option<ConnectionId>) -> Self {
        self.connection_id = id;
        self
    }

    pub fn build(self) -> Response {
        Response {
            request: self.request,
            protocol: self.protocol,
            status: self.status,
            message: self.message,
            headers: self.headers,
            body: self.body,
            prior_response: self.prior_response,
            connection_id: self.connection_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> Request {
        Request::get("http://example.com/").unwrap()
    }

    #[test]
    fn test_protocol_parse() {
        assert_eq!(Protocol::parse("HTTP/1.0"), Some(Protocol::Http10));
        assert_eq!(Protocol::parse("HTTP/1.1"), Some(Protocol::Http11));
        assert_eq!(Protocol::parse("HTTP/2"), None);
        assert_eq!(Protocol::Http11.to_string(), "HTTP/1.1");
    }

    #[tokio::test]
    async fn test_into_builder_keeps_body() {
        let response = Response::builder(request())
            .status(StatusCode::CREATED)
            .body(ResponseBody::from_bytes("ok", None))
            .build();
        let rewritten = response
            .into_builder()
            .header("X-Cache", "hit")
            .unwrap()
            .build();

        assert_eq!(rewritten.status(), StatusCode::CREATED);
        assert_eq!(rewritten.header("x-cache"), Some("hit"));
        assert_eq!(rewritten.text().await.unwrap(), "ok");
    }

    #[test]
    fn test_prior_response_has_no_body() {
        let first = Response::builder(request())
            .status(StatusCode::FOUND)
            .body(ResponseBody::from_bytes("moved", None))
            .build();
        let second = Response::builder(request()).prior_response(Some(first)).build();

        let prior = second.prior_response().unwrap();
        assert_eq!(prior.status(), StatusCode::FOUND);
        assert!(!prior.has_body());
        assert!(prior.is_redirect());
        assert!(!second.has_body());
    }
}
