use std::{fmt, str::FromStr};

use thiserror::Error;
use url::Url;

/// Errors related to request URLs
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum UrlError {
    /// The input is not a URL at all
    #[error("Invalid URL '{input}': {reason}")]
    Parse { input: String, reason: String },

    /// Only http and https are supported
    #[error("Unsupported URL scheme '{0}', expected http or https")]
    UnsupportedScheme(String),

    /// The URL has no host component
    #[error("URL has no host: {0}")]
    MissingHost(String),
}

/// A validated http(s) URL.
///
/// Wraps [`url::Url`] and only exposes the parts the call pipeline needs: scheme,
/// host, effective port, the encoded path and query.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HttpUrl {
    url: Url,
}

impl HttpUrl {
    /// Parse and validate an http or https URL
    pub fn parse(input: &str) -> Result<Self, UrlError> {
        let url = Url::parse(input).map_err(|e| UrlError::Parse {
            input: input.to_string(),
            reason: e.to_string(),
        })?;
        Self::from_url(url)
    }

    fn from_url(url: Url) -> Result<Self, UrlError> {
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(UrlError::UnsupportedScheme(other.to_string())),
        }
        match url.host_str() {
            Some(host) if !host.is_empty() => Ok(Self { url }),
            _ => Err(UrlError::MissingHost(url.to_string())),
        }
    }

    pub fn scheme(&self) -> &str {
        self.url.scheme()
    }

    pub fn is_https(&self) -> bool {
        self.url.scheme() == "https"
    }

    /// Host as it appears in the URL (IPv6 literals keep their brackets)
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or_default()
    }

    /// Host without IPv6 brackets, suitable for name resolution and TLS SNI
    pub fn host_for_connect(&self) -> &str {
        self.host().trim_start_matches('[').trim_end_matches(']')
    }

    /// Explicit port, or the scheme default
    pub fn port(&self) -> u16 {
        self.url
            .port_or_known_default()
            .unwrap_or(if self.is_https() { 443 } else { 80 })
    }

    pub fn encoded_path(&self) -> &str {
        self.url.path()
    }

    pub fn encoded_query(&self) -> Option<&str> {
        self.url.query()
    }

    /// Origin-form request target: the path plus `?query` when present. Never empty.
    pub fn request_target(&self) -> String {
        let path = match self.encoded_path() {
            "" => "/",
            path => path,
        };
        match self.encoded_query() {
            Some(query) => format!("{path}?{query}"),
            None => path.to_string(),
        }
    }

    /// Value for the `Host` header: the port is omitted when it is the scheme default
    pub fn authority(&self) -> String {
        match self.url.port() {
            Some(port) => format!("{}:{port}", self.host()),
            None => self.host().to_string(),
        }
    }

    /// Resolve a (possibly relative) redirect target against this URL
    pub fn resolve(&self, location: &str) -> Option<HttpUrl> {
        self.url
            .join(location)
            .ok()
            .and_then(|url| Self::from_url(url).ok())
    }

    pub fn as_str(&self) -> &str {
        self.url.as_str()
    }

    /// Decode `%xx` escapes; invalid UTF-8 is replaced rather than rejected
    pub fn percent_decode(encoded: &str) -> String {
        match urlencoding::decode(encoded) {
            Ok(decoded) => decoded.into_owned(),
            Err(_) => String::from_utf8_lossy(&urlencoding::decode_binary(encoded.as_bytes()))
                .into_owned(),
        }
    }

    /// Decode a form-encoded component, where `+` stands for a space
    pub fn percent_decode_form(encoded: &str) -> String {
        Self::percent_decode(&encoded.replace('+', " "))
    }
}

impl FromStr for HttpUrl {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HttpUrl::parse(s)
    }
}

impl fmt::Display for HttpUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.url.as_str())
    }
}
