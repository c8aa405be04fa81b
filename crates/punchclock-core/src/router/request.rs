use std::fmt;

use chrono::{DateTime, Utc};
use reqwest::{Method, Url};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const JSON_CONTENT_TYPE: &str = "application/json";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// How the request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
    /// Top-level page load
    Navigate,
    /// Programmatic request (API call, asset)
    Fetch,
}

/// Whether the request may be answered from, or written to, the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheMode {
    Default,
    /// Always go to the network and never store the result
    NoStore,
}

/// An outgoing HTTP request as seen by the router.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub cache: CacheMode,
    pub content_type: Option<String>,
    pub body: Option<Vec<u8>>,
}

impl Request {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::Fetch,
            cache: CacheMode::Default,
            content_type: None,
            body: None,
        }
    }

    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    pub fn navigate(url: Url) -> Self {
        Self {
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    pub fn post_json<B: Serialize>(url: Url, body: &B) -> Result<Self, serde_json::Error> {
        Ok(Self {
            content_type: Some(JSON_CONTENT_TYPE.to_string()),
            body: Some(serde_json::to_vec(body)?),
            ..Self::new(Method::POST, url)
        })
    }

    pub fn no_store(mut self) -> Self {
        self.cache = CacheMode::NoStore;
        self
    }

    pub fn path(&self) -> &str {
        self.url.path()
    }

    pub fn cache_key(&self) -> CacheKey {
        CacheKey::new(&self.method, &self.url)
    }
}

/// Normalized request identity: upper-case method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self(format!("{} {}", method.as_str().to_uppercase(), url))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseSource {
    #[default]
    Network,
    Cache,
    /// Produced by the router itself (offline fallbacks)
    Synthesized,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u16,
    #[serde(default)]
    pub content_type: Option<String>,
    #[serde(with = "hex::serde")]
    pub body: Vec<u8>,
    #[serde(skip)]
    pub source: ResponseSource,
    /// When the stored copy was written; set on cache hits only
    #[serde(skip)]
    pub cached_at: Option<DateTime<Utc>>,
}

impl Response {
    pub fn new(status: u16, content_type: Option<&str>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            content_type: content_type.map(str::to_string),
            body: body.into(),
            source: ResponseSource::Network,
            cached_at: None,
        }
    }

    pub fn json<T: Serialize>(status: u16, value: &T) -> Self {
        // Serializing plain data structs to a Vec cannot fail
        let body = serde_json::to_vec(value).unwrap_or_default();
        Self::new(status, Some(JSON_CONTENT_TYPE), body)
    }

    pub fn synthesized(mut self) -> Self {
        self.source = ResponseSource::Synthesized;
        self
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
