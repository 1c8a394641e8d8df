//! Ordered, multi-valued header set.
//!
//! `http::HeaderMap` does not promise insertion order, so headers are kept as a
//! plain list of validated `(HeaderName, HeaderValue)` pairs. Header names are
//! lower-cased by `http`, which makes every lookup case-insensitive.
use std::fmt;

use http::{HeaderName, HeaderValue};

use crate::core::error::{HttpError, HttpResult};

#[derive(Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: Vec<(HeaderName, HeaderValue)>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate a name/value pair
    pub fn parse_pair(name: &str, value: &str) -> HttpResult<(HeaderName, HeaderValue)> {
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| HttpError::InvalidRequest(format!("invalid header name: {name:?}")))?;
        let value = HeaderValue::from_str(value.trim()).map_err(|_| {
            HttpError::InvalidRequest(format!("invalid value for header {name}: {value:?}"))
        })?;
        Ok((name, value))
    }

    /// Append a value, keeping any existing values for the same name
    pub fn append(&mut self, name: HeaderName, value: HeaderValue) {
        self.entries.push((name, value));
    }

    pub fn add(&mut self, name: &str, value: &str) -> HttpResult<()> {
        let (name, value) = Self::parse_pair(name, value)?;
        self.append(name, value);
        Ok(())
    }

    /// Replace every value of `name` with `value`, keeping the position of the first one
    pub fn insert(&mut self, name: HeaderName, value: HeaderValue) {
        match self.entries.iter().position(|(n, _)| *n == name) {
            Some(first) => {
                self.entries[first].1 = value;
                let mut index = 0;
                self.entries.retain(|(n, _)| {
                    let keep = index <= first || *n != name;
                    index += 1;
                    keep
                });
            }
            None => self.entries.push((name, value)),
        }
    }

    pub fn set(&mut self, name: &str, value: &str) -> HttpResult<()> {
        let (name, value) = Self::parse_pair(name, value)?;
        self.insert(name, value);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) {
        self.entries
            .retain(|(n, _)| !n.as_str().eq_ignore_ascii_case(name));
    }

    /// First value of `name`, if it is visible ASCII
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .and_then(|(_, v)| v.to_str().ok())
    }

    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries
            .iter()
            .filter(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
            .filter_map(|(_, v)| v.to_str().ok())
            .collect()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries
            .iter()
            .any(|(n, _)| n.as_str().eq_ignore_ascii_case(name))
    }

    /// Whether any comma-separated value of `name` equals `token` (case-insensitive)
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.get_all(name)
            .iter()
            .flat_map(|v| v.split(','))
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&HeaderName, &HeaderValue)> {
        self.entries.iter().map(|(n, v)| (n, v))
    }
}

impl fmt::Debug for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insertion_order_preserved() {
        let mut headers = Headers::new();
        headers.add("X-B", "2").unwrap();
        headers.add("X-A", "1").unwrap();
        headers.add("x-b", "3").unwrap();

        let names: Vec<&str> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["x-b", "x-a", "x-b"]);
        assert_eq!(headers.get_all("X-b"), vec!["2", "3"]);
        assert_eq!(headers.get("X-B"), Some("2"));
    }

    #[test]
    fn test_set_replaces_in_place() {
        let mut headers = Headers::new();
        headers.add("accept", "a").unwrap();
        headers.add("host", "h").unwrap();
        headers.add("Accept", "b").unwrap();

        headers.set("ACCEPT", "c").unwrap();
        let pairs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(n, v)| (n.as_str(), v.to_str().unwrap()))
            .collect();
        assert_eq!(pairs, vec![("accept", "c"), ("host", "h")]);
    }

    #[test]
    fn test_remove_is_case_insensitive() {
        let mut headers = Headers::new();
        headers.add("Connection", "close").unwrap();
        assert!(headers.contains("connection"));
        headers.remove("CONNECTION");
        assert!(headers.is_empty());
    }

    #[test]
    fn test_has_token() {
        let mut headers = Headers::new();
        headers.add("Transfer-Encoding", "gzip, Chunked").unwrap();
        assert!(headers.has_token("transfer-encoding", "chunked"));
        assert!(!headers.has_token("transfer-encoding", "deflate"));
    }

    #[test]
    fn test_invalid_header_rejected() {
        let mut headers = Headers::new();
        assert!(headers.add("bad name", "x").is_err());
        assert!(headers.add("ok", "line\nbreak").is_err());
    }
}
