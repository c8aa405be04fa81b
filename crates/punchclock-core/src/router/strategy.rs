use std::sync::Arc;

use reqwest::Method;
use serde_json::json;
use tracing::{debug, warn};

use super::fetch::Fetcher;
use super::request::{CacheMode, Request, Response, HTML_CONTENT_TYPE};
use super::{lock_epoch, RequestRouter};
use crate::models::OfflineAck;

/// Page served for navigations when neither the network nor the cache can answer.
pub const OFFLINE_PAGE_HTML: &str = "<!DOCTYPE html>\n<html lang=\"en\">\n<head><meta charset=\"utf-8\"><title>Offline</title></head>\n<body>\n<h1>You are offline</h1>\n<p>Punches cannot be confirmed until the connection returns.</p>\n</body>\n</html>\n";

/// How a request is resolved between the cache and the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Punch submissions: network, or a synthesized "pending" acknowledgement
    NetworkOnlyWithFallback,
    /// Cacheable API reads: cached copy now, refreshed in the background
    CacheFirstWithRefresh,
    /// Page loads: network, then cached copy, then the offline page
    NetworkFirst,
    /// Static assets and everything else
    CacheFirst,
}

impl Strategy {
    pub fn name(&self) -> &'static str {
        match self {
            Strategy::NetworkOnlyWithFallback => "network-only-with-fallback",
            Strategy::CacheFirstWithRefresh => "cache-first-with-refresh",
            Strategy::NetworkFirst => "network-first",
            Strategy::CacheFirst => "cache-first",
        }
    }
}

pub(crate) fn service_unavailable() -> Response {
    Response::json(
        503,
        &json!({
            "error": "Network unavailable and no cached response",
            "offline": true,
        }),
    )
    .synthesized()
}

pub(crate) fn offline_page() -> Response {
    Response::new(200, Some(HTML_CONTENT_TYPE), OFFLINE_PAGE_HTML)
}

impl<F> RequestRouter<F>
where
    F: Fetcher + Send + Sync + 'static,
{
    pub(super) async fn network_only_with_fallback(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if response.is_success() {
                    self.invalidate(&self.config.invalidate_on_submit);
                }
                response
            }
            Err(e) => {
                // Not queued for retry: the pending flag is informational only
                warn!(url = %request.url, error = %e, "Submission did not reach the server, acknowledging as pending");
                Response::json(202, &OfflineAck::QUEUED).synthesized()
            }
        }
    }

    pub(super) async fn cache_first_with_refresh(&self, request: Request) -> Response {
        if let Some(hit) = self.cached(&request) {
            self.spawn_refresh(request);
            return hit;
        }
        self.fetch_and_store(&request)
            .await
            .unwrap_or_else(service_unavailable)
    }

    pub(super) async fn network_first(&self, request: &Request) -> Response {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_response(request, &response);
                response
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Navigation failed, falling back to cache");
                if let Some(hit) = self.cached(request) {
                    return hit;
                }
                let offline = self.offline_request().ok();
                offline
                    .and_then(|r| self.cached(&r))
                    .unwrap_or_else(|| offline_page().synthesized())
            }
        }
    }

    pub(super) async fn cache_first(&self, request: &Request) -> Response {
        if let Some(hit) = self.cached(request) {
            return hit;
        }
        self.fetch_and_store(request)
            .await
            .unwrap_or_else(service_unavailable)
    }

    /// Fetch from the network and store successful GET responses.
    /// `None` means the network could not be reached at all.
    async fn fetch_and_store(&self, request: &Request) -> Option<Response> {
        match self.fetcher.fetch(request).await {
            Ok(response) => {
                self.store_response(request, &response);
                Some(response)
            }
            Err(e) => {
                debug!(url = %request.url, error = %e, "Fetch failed and nothing cached");
                None
            }
        }
    }

    fn cached(&self, request: &Request) -> Option<Response> {
        if request.method != Method::GET || request.cache == CacheMode::NoStore {
            return None;
        }
        match self.store.lookup(request) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Failed to read cache entry");
                None
            }
        }
    }

    fn store_response(&self, request: &Request, response: &Response) {
        if request.method != Method::GET
            || request.cache == CacheMode::NoStore
            || !response.is_success()
        {
            return;
        }
        if let Err(e) = self.store.put(request, response) {
            warn!(url = %request.url, error = %e, "Failed to cache response");
        }
    }

    /// Re-fetch in the background and overwrite the cached entry on success.
    /// Failures are discarded, as is a result that lands after an
    /// invalidation.
    fn spawn_refresh(&self, request: Request) {
        let fetcher = Arc::clone(&self.fetcher);
        let store = self.store.clone();
        let epoch = Arc::clone(&self.epoch);
        let started = *lock_epoch(&epoch);

        tokio::spawn(async move {
            match fetcher.fetch(&request).await {
                Ok(response) if response.is_success() => {
                    let current = lock_epoch(&epoch);
                    if *current != started {
                        debug!(url = %request.url, "Cache invalidated during background refresh, discarding result");
                        return;
                    }
                    if let Err(e) = store.put(&request, &response) {
                        debug!(url = %request.url, error = %e, "Background refresh could not update cache");
                    }
                }
                Ok(response) => {
                    debug!(url = %request.url, status = response.status, "Background refresh not successful, keeping cached copy");
                }
                Err(e) => {
                    debug!(url = %request.url, error = %e, "Background refresh failed");
                }
            }
        });
    }
}
