//! Request and response bodies.
//!
//! Request bodies are producers: they report their length (or that it is
//! unknown) and write themselves into a [`BodySink`]. Response bodies are
//! single-consumer streams; a streaming body is bound to the connection that
//! produced it and gives that connection back when it is exhausted.
use std::{fmt, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use serde::Serialize;

use crate::{
    core::{
        error::{HttpError, HttpResult},
        url::HttpUrl,
    },
    ports::codec::{BodySink, BodySource},
};

/// How long [`ResponseBody::close`] keeps reading so the connection can be reused.
const DISCARD_DEADLINE: Duration = Duration::from_millis(100);

pub const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// A producer of request body bytes.
#[async_trait]
pub trait RequestBody: Send + Sync + fmt::Debug {
    fn content_type(&self) -> Option<&str> {
        None
    }

    /// Exact length in bytes, or `None` when unknown (sent chunked)
    fn content_length(&self) -> Option<u64>;

    /// Bodies that can only be written once are never retried or redirected
    fn is_one_shot(&self) -> bool {
        false
    }

    async fn write_to(&self, sink: &mut dyn BodySink) -> HttpResult<()>;
}

/// In-memory body.
#[derive(Debug, Clone)]
pub struct BytesBody {
    content_type: Option<String>,
    bytes: Bytes,
}

impl BytesBody {
    pub fn new(bytes: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            bytes: bytes.into(),
        }
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::new(text.into(), Some("text/plain; charset=utf-8"))
    }

    pub fn json<T: Serialize>(value: &T) -> HttpResult<Self> {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| HttpError::InvalidRequest(format!("failed to encode JSON body: {e}")))?;
        Ok(Self::new(bytes, Some("application/json")))
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }
}

#[async_trait]
impl RequestBody for BytesBody {
    fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.bytes.len() as u64)
    }

    async fn write_to(&self, sink: &mut dyn BodySink) -> HttpResult<()> {
        sink.write_all(&self.bytes).await
    }
}

/// `application/x-www-form-urlencoded` body.
///
/// Names and values are stored encoded; the length is counted from the same
/// encoding that is written.
#[derive(Debug, Clone, Default)]
pub struct FormBody {
    encoded_names: Vec<String>,
    encoded_values: Vec<String>,
}

impl FormBody {
    pub fn builder() -> FormBodyBuilder {
        FormBodyBuilder::default()
    }

    pub fn size(&self) -> usize {
        self.encoded_names.len()
    }

    pub fn encoded_name(&self, index: usize) -> Option<&str> {
        self.encoded_names.get(index).map(String::as_str)
    }

    pub fn encoded_value(&self, index: usize) -> Option<&str> {
        self.encoded_values.get(index).map(String::as_str)
    }

    pub fn name(&self, index: usize) -> Option<String> {
        self.encoded_name(index).map(HttpUrl::percent_decode_form)
    }

    pub fn value(&self, index: usize) -> Option<String> {
        self.encoded_value(index).map(HttpUrl::percent_decode_form)
    }

    fn encode(&self) -> String {
        self.encoded_names
            .iter()
            .zip(&self.encoded_values)
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join("&")
    }
}

#[async_trait]
impl RequestBody for FormBody {
    fn content_type(&self) -> Option<&str> {
        Some(FORM_CONTENT_TYPE)
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.encode().len() as u64)
    }

    async fn write_to(&self, sink: &mut dyn BodySink) -> HttpResult<()> {
        sink.write_all(self.encode().as_bytes()).await
    }
}

#[derive(Debug, Default)]
pub struct FormBodyBuilder {
    names: Vec<String>,
    values: Vec<String>,
}

impl FormBodyBuilder {
    /// Add a pair, form-encoding both parts
    pub fn add(mut self, name: &str, value: &str) -> Self {
        self.names.push(form_encode(name));
        self.values.push(form_encode(value));
        self
    }

    /// Add a pair that is already encoded
    pub fn add_encoded(mut self, name: &str, value: &str) -> Self {
        self.names.push(name.to_string());
        self.values.push(value.to_string());
        self
    }

    pub fn build(self) -> FormBody {
        FormBody {
            encoded_names: self.names,
            encoded_values: self.values,
        }
    }
}

fn form_encode(input: &str) -> String {
    url::form_urlencoded::byte_serialize(input.as_bytes()).collect()
}

enum BodyState {
    Buffered(Bytes),
    Streaming(Box<dyn BodySource>),
    Done,
}

/// Single-consumer response body.
///
/// Once a body has been consumed or closed its bytes are gone; further reads
/// yield nothing.
pub struct ResponseBody {
    content_type: Option<String>,
    content_length: Option<u64>,
    state: BodyState,
}

impl ResponseBody {
    /// A zero-length body
    pub fn empty() -> Self {
        Self {
            content_type: None,
            content_length: Some(0),
            state: BodyState::Done,
        }
    }

    /// An in-memory body, as returned by interceptors that short-circuit
    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: Option<&str>) -> Self {
        let bytes = bytes.into();
        Self {
            content_type: content_type.map(str::to_string),
            content_length: Some(bytes.len() as u64),
            state: BodyState::Buffered(bytes),
        }
    }

    pub(crate) fn streaming(
        source: Box<dyn BodySource>,
        content_type: Option<&str>,
        content_length: Option<u64>,
    ) -> Self {
        Self {
            content_type: content_type.map(str::to_string),
            content_length,
            state: BodyState::Streaming(source),
        }
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// Declared length, when the peer announced one
    pub fn content_length(&self) -> Option<u64> {
        self.content_length
    }

    pub fn is_exhausted(&self) -> bool {
        matches!(self.state, BodyState::Done)
    }

    /// Read the next chunk, or `None` once the body is exhausted
    pub async fn chunk(&mut self) -> HttpResult<Option<Bytes>> {
        match std::mem::replace(&mut self.state, BodyState::Done) {
            BodyState::Done => Ok(None),
            BodyState::Buffered(bytes) if bytes.is_empty() => Ok(None),
            BodyState::Buffered(bytes) => Ok(Some(bytes)),
            BodyState::Streaming(mut source) => match source.read_chunk().await? {
                Some(chunk) => {
                    self.state = BodyState::Streaming(source);
                    Ok(Some(chunk))
                }
                None => Ok(None),
            },
        }
    }

    /// Read the whole body
    pub async fn bytes(mut self) -> HttpResult<Bytes> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await? {
            buf.extend_from_slice(&chunk);
        }
        Ok(buf.freeze())
    }

    /// Read the whole body as UTF-8, replacing invalid sequences
    pub async fn text(self) -> HttpResult<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Close the body. Unread bytes are drained for a short while so the
    /// connection can be reused; if that does not finish, the connection is evicted.
    pub async fn close(mut self) {
        if self.is_exhausted() {
            return;
        }
        let drained = tokio::time::timeout(DISCARD_DEADLINE, async {
            while self.chunk().await?.is_some() {}
            Ok::<(), HttpError>(())
        })
        .await;
        if !matches!(drained, Ok(Ok(()))) {
            tracing::debug!("Response body not drained on close; its connection will be evicted");
        }
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            BodyState::Buffered(_) => "buffered",
            BodyState::Streaming(_) => "streaming",
            BodyState::Done => "done",
        };
        f.debug_struct("ResponseBody")
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("state", &state)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink(Vec<u8>);

    #[async_trait]
    impl BodySink for VecSink {
        async fn write_all(&mut self, buf: &[u8]) -> HttpResult<()> {
            self.0.extend_from_slice(buf);
            Ok(())
        }
    }

    struct Chunks(Vec<&'static str>);

    #[async_trait]
    impl BodySource for Chunks {
        async fn read_chunk(&mut self) -> HttpResult<Option<Bytes>> {
            if self.0.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Bytes::from_static(self.0.remove(0).as_bytes())))
            }
        }
    }

    #[tokio::test]
    async fn test_form_body_length_matches_written_bytes() {
        let form = FormBody::builder()
            .add("name", "Jane Doe")
            .add("q", "a&b=c")
            .add_encoded("raw", "x%20y")
            .build();

        let mut sink = VecSink::default();
        form.write_to(&mut sink).await.unwrap();
        let written = String::from_utf8(sink.0).unwrap();

        assert_eq!(written, "name=Jane+Doe&q=a%26b%3Dc&raw=x%20y");
        assert_eq!(form.content_length(), Some(written.len() as u64));
        assert_eq!(form.content_type(), Some(FORM_CONTENT_TYPE));
    }

    #[test]
    fn test_form_body_accessors_decode() {
        let form = FormBody::builder().add("full name", "a+b").build();
        assert_eq!(form.size(), 1);
        assert_eq!(form.encoded_name(0), Some("full+name"));
        assert_eq!(form.name(0).as_deref(), Some("full name"));
        assert_eq!(form.value(0).as_deref(), Some("a+b"));
        assert_eq!(form.name(1), None);
    }

    #[tokio::test]
    async fn test_json_body() {
        let body = BytesBody::json(&serde_json::json!({"a": 1})).unwrap();
        assert_eq!(body.content_type(), Some("application/json"));
        assert_eq!(body.bytes().as_ref(), br#"{"a":1}"#);
    }

    #[tokio::test]
    async fn test_response_body_single_consumer() {
        let mut body = ResponseBody::streaming(Box::new(Chunks(vec!["he", "llo"])), None, None);
        assert_eq!(body.chunk().await.unwrap().unwrap().as_ref(), b"he");
        assert_eq!(body.chunk().await.unwrap().unwrap().as_ref(), b"llo");
        assert!(body.chunk().await.unwrap().is_none());
        assert!(body.is_exhausted());
        assert!(body.chunk().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_buffered_body_text() {
        let body = ResponseBody::from_bytes("cached", Some("text/plain"));
        assert_eq!(body.content_length(), Some(6));
        assert_eq!(body.text().await.unwrap(), "cached");
        assert!(ResponseBody::empty().bytes().await.unwrap().is_empty());
    }
}
