//! HTTP-like request and response records stored by the cache engine

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::SystemTime;
use url::Url;

/// Ordered header list with ASCII case-insensitive lookup.
///
/// Names keep the spelling they were inserted with, so a stored record
/// round-trips byte for byte.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set `name` to `value`, replacing any existing value for the same name
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self
            .0
            .iter_mut()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(&name))
        {
            Some(slot) => slot.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(existing, _)| existing.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn estimated_size(&self) -> u64 {
        self.0
            .iter()
            .map(|(n, v)| (n.len() + v.len()) as u64)
            .sum()
    }
}

impl<K, V> FromIterator<(K, V)> for Headers
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.insert(name, value);
        }
        headers
    }
}

/// A request as seen by the cache: method, absolute URL and headers.
///
/// Request bodies are never stored, so the type does not carry one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub method: String,
    pub url: Url,
    pub headers: Headers,
}

impl Request {
    /// Create a request with an explicit method
    pub fn new(method: impl Into<String>, url: &str) -> Result<Self> {
        let url = Url::parse(url)?;
        if url.cannot_be_a_base() {
            return Err(Error::invalid_argument(
                "request",
                format!("'{url}' is not a hierarchical URL"),
            ));
        }
        Ok(Self {
            method: method.into(),
            url,
            headers: Headers::new(),
        })
    }

    /// Create a GET request
    pub fn get(url: &str) -> Result<Self> {
        Self::new("GET", url)
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Entry-store key: the exact absolute URL
    pub fn cache_key(&self) -> &str {
        self.url.as_str()
    }

    /// URL with its query component removed, for search-insensitive matching
    pub fn url_without_query(&self) -> String {
        strip_query(&self.url)
    }

    pub fn is_get(&self) -> bool {
        self.method.eq_ignore_ascii_case("GET")
    }

    /// Rough serialized size used to bound query results
    pub fn estimated_size(&self) -> u64 {
        (self.url.as_str().len() + self.method.len()) as u64 + self.headers.estimated_size()
    }
}

/// Remove the query component of `url`, keeping everything else
pub fn strip_query(url: &Url) -> String {
    let mut stripped = url.clone();
    stripped.set_query(None);
    stripped.into()
}

/// Response tainting as exposed to the web platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ResponseType {
    Basic,
    Cors,
    #[default]
    Default,
    Error,
    Opaque,
    OpaqueRedirect,
}

/// A stored response's metadata. The body travels separately as a blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub url: Option<Url>,
    pub status_code: u16,
    pub status_text: String,
    pub response_type: ResponseType,
    pub headers: Headers,
    pub response_time: SystemTime,
    pub cors_exposed_header_names: Vec<String>,
}

impl Response {
    pub fn new(status_code: u16, status_text: impl Into<String>) -> Self {
        Self {
            url: None,
            status_code,
            status_text: status_text.into(),
            response_type: ResponseType::Default,
            headers: Headers::new(),
            response_time: SystemTime::now(),
            cors_exposed_header_names: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_url(mut self, url: Url) -> Self {
        self.url = Some(url);
        self
    }

    pub fn with_type(mut self, response_type: ResponseType) -> Self {
        self.response_type = response_type;
        self
    }

    pub fn with_response_time(mut self, response_time: SystemTime) -> Self {
        self.response_time = response_time;
        self
    }

    pub fn with_cors_exposed_headers<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cors_exposed_header_names = names.into_iter().map(Into::into).collect();
        self
    }

    /// Redirect responses may not carry a body
    pub fn is_redirect(&self) -> bool {
        self.response_type == ResponseType::OpaqueRedirect
            || matches!(self.status_code, 301 | 302 | 303 | 307 | 308)
    }

    /// Rough serialized size used to bound query results
    pub fn estimated_size(&self) -> u64 {
        // status code, type tag and timestamp
        const FIXED_FIELDS: u64 = 32;
        let url_len = self.url.as_ref().map_or(0, |u| u.as_str().len());
        let cors_len: usize = self.cors_exposed_header_names.iter().map(String::len).sum();
        FIXED_FIELDS
            + (url_len + self.status_text.len() + cors_len) as u64
            + self.headers.estimated_size()
    }
}
