use std::time::Duration;

use reqwest::{header, Client};
use thiserror::Error;
use tracing::debug;

use super::request::{Request, Response, ResponseSource};

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Network unavailable")]
    Offline,
}

/// The network seam of the router. A non-2xx status is a successful fetch;
/// only transport failures are errors.
#[trait_variant::make(Fetcher: Send)]
pub trait LocalFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError>;
}

/// Fetcher backed by reqwest, with a cookie store for the server session.
/// Clone is cheap - reqwest::Client uses Arc internally for connection pooling.
#[derive(Clone)]
pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;
        Ok(Self { client })
    }
}

impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        let mut builder = self
            .client
            .request(request.method.clone(), request.url.clone());
        if let Some(ref content_type) = request.content_type {
            builder = builder.header(header::CONTENT_TYPE, content_type.as_str());
        }
        if let Some(ref body) = request.body {
            builder = builder.body(body.clone());
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = response.bytes().await?.to_vec();
        debug!(method = %request.method, url = %request.url, status, bytes = body.len(), "Fetched");

        Ok(Response {
            status,
            content_type,
            body,
            source: ResponseSource::Network,
            cached_at: None,
        })
    }
}
