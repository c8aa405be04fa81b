//! Offline request router.
//!
//! Every request the client makes goes through [`RequestRouter::handle`],
//! which classifies it and resolves it with one of four [`Strategy`]s
//! against the network and a persistent [`CacheStore`]. `handle` never
//! fails: network and cache failures become synthesized responses.
//!
//! Lifecycle: `install` pre-populates the current store with the essential
//! assets and an offline page; `activate` purges stores from older cache
//! versions so only one generation is ever live.

pub mod fetch;
pub mod request;
pub mod strategy;

#[cfg(test)]
pub(crate) mod testing;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use futures::future::join_all;
use reqwest::{Method, Url};
use tracing::{debug, info, warn};

use crate::cache::{CacheStorage, CacheStore};

pub use fetch::{FetchError, Fetcher, HttpFetcher, LocalFetcher};
pub use request::{CacheKey, CacheMode, Request, RequestMode, Response, ResponseSource};
pub use strategy::{Strategy, OFFLINE_PAGE_HTML};

/// Endpoint that records punches
pub const SUBMIT_PATH: &str = "/api/attendance/mark";

/// Endpoint returning today's attendance record
pub const TODAY_PATH: &str = "/api/attendance/today";

/// Path under which the synthesized offline page is stored
pub const OFFLINE_PAGE_PATH: &str = "/offline.html";

/// Default cache store prefix; the store name is `{prefix}-{version}`
pub const DEFAULT_CACHE_PREFIX: &str = "punchclock";

/// Bump to purge every previously cached response on next activation
pub const DEFAULT_CACHE_VERSION: &str = "v1";

/// API reads that may be answered from cache while being refreshed
const CACHEABLE_API_PATHS: &[&str] = &[TODAY_PATH, "/api/user", "/api/config"];

/// Pages and assets needed to open the app with no connection
const ESSENTIAL_ASSETS: &[&str] = &["/", "/login", "/dashboard", "/manifest.json"];

#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub base_url: Url,
    pub cache_prefix: String,
    pub cache_version: String,
    pub submit_path: String,
    pub cacheable_api: Vec<String>,
    /// Cached reads dropped after a punch is accepted
    pub invalidate_on_submit: Vec<String>,
    pub essential_assets: Vec<String>,
    pub offline_page_path: String,
}

impl RouterConfig {
    pub fn new(base_url: Url) -> Self {
        Self {
            base_url,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            submit_path: SUBMIT_PATH.to_string(),
            cacheable_api: CACHEABLE_API_PATHS.iter().map(|p| p.to_string()).collect(),
            invalidate_on_submit: vec![TODAY_PATH.to_string()],
            essential_assets: ESSENTIAL_ASSETS.iter().map(|p| p.to_string()).collect(),
            offline_page_path: OFFLINE_PAGE_PATH.to_string(),
        }
    }

    pub fn store_name(&self) -> String {
        format!("{}-{}", self.cache_prefix, self.cache_version)
    }

    pub fn resolve(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .with_context(|| format!("Invalid path {:?} for {}", path, self.base_url))
    }
}

/// `pattern` matches itself and anything below it.
fn path_matches(path: &str, pattern: &str) -> bool {
    let pattern = pattern.trim_end_matches('/');
    path == pattern
        || path
            .strip_prefix(pattern)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub struct RequestRouter<F> {
    fetcher: Arc<F>,
    storage: CacheStorage,
    store: CacheStore,
    config: RouterConfig,
    /// Bumped on every invalidation. A background refresh only writes if
    /// the epoch it started under is still current.
    epoch: Arc<Mutex<u64>>,
}

fn lock_epoch(epoch: &Mutex<u64>) -> MutexGuard<'_, u64> {
    epoch.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<F> RequestRouter<F>
where
    F: Fetcher + Send + Sync + 'static,
{
    /// Open (or create) the store for the configured cache version.
    pub fn new(fetcher: F, storage: CacheStorage, config: RouterConfig) -> Result<Self> {
        let store = storage.open(&config.store_name())?;
        debug!(store = store.name(), "Opened cache store");
        Ok(Self {
            fetcher: Arc::new(fetcher),
            storage,
            store,
            config,
            epoch: Arc::new(Mutex::new(0)),
        })
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn storage(&self) -> &CacheStorage {
        &self.storage
    }

    pub fn classify(&self, request: &Request) -> Strategy {
        let path = request.path();
        if request.method == Method::POST && path == self.config.submit_path {
            Strategy::NetworkOnlyWithFallback
        } else if request.method == Method::GET
            && self
                .config
                .cacheable_api
                .iter()
                .any(|pattern| path_matches(path, pattern))
        {
            Strategy::CacheFirstWithRefresh
        } else if request.mode == RequestMode::Navigate {
            Strategy::NetworkFirst
        } else {
            Strategy::CacheFirst
        }
    }

    /// Resolve a request. Always produces a response.
    pub async fn handle(&self, request: Request) -> Response {
        let strategy = self.classify(&request);
        debug!(method = %request.method, url = %request.url, strategy = strategy.name(), "Routing request");

        match strategy {
            Strategy::NetworkOnlyWithFallback => self.network_only_with_fallback(&request).await,
            Strategy::CacheFirstWithRefresh => self.cache_first_with_refresh(request).await,
            Strategy::NetworkFirst => self.network_first(&request).await,
            Strategy::CacheFirst => self.cache_first(&request).await,
        }
    }

    pub fn offline_request(&self) -> Result<Request> {
        Ok(Request::get(self.config.resolve(&self.config.offline_page_path)?))
    }

    /// Pre-populate the current store with the essential assets and the
    /// offline page. All assets are fetched before anything is written; if
    /// any fetch fails the store is left untouched.
    pub async fn install(&self) -> Result<usize> {
        let requests = self
            .config
            .essential_assets
            .iter()
            .map(|path| self.config.resolve(path).map(Request::get))
            .collect::<Result<Vec<_>>>()?;

        let results = join_all(requests.iter().map(|r| self.fetcher.fetch(r))).await;

        let mut fetched = Vec::with_capacity(requests.len());
        for (request, result) in requests.iter().zip(results) {
            let response = result
                .with_context(|| format!("Failed to fetch essential asset {}", request.url))?;
            if !response.is_success() {
                bail!(
                    "Essential asset {} returned status {}",
                    request.url,
                    response.status
                );
            }
            fetched.push((request, response));
        }

        for (request, response) in &fetched {
            self.store.put(request, response)?;
        }
        self.store
            .put(&self.offline_request()?, &strategy::offline_page())?;

        info!(store = self.store.name(), assets = fetched.len(), "Installed essential assets");
        Ok(fetched.len() + 1)
    }

    /// Drop the cached GET entries for `paths` and stop background
    /// refreshes already in flight from writing them back. Returns how many
    /// entries were removed.
    pub fn invalidate<S: AsRef<str>>(&self, paths: &[S]) -> usize {
        let mut epoch = lock_epoch(&self.epoch);
        *epoch += 1;

        let mut removed = 0;
        for path in paths {
            let path = path.as_ref();
            let request = match self.config.resolve(path) {
                Ok(url) => Request::get(url),
                Err(e) => {
                    warn!(path = %path, error = %e, "Invalid invalidation path");
                    continue;
                }
            };
            match self.store.delete(&request) {
                Ok(true) => {
                    debug!(url = %request.url, "Invalidated cached entry");
                    removed += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(url = %request.url, error = %e, "Failed to invalidate cached entry"),
            }
        }
        removed
    }

    /// Drop every cached API read. Used when the logged-in user goes away
    /// or changes, since those entries belong to one person.
    pub fn invalidate_api_reads(&self) -> usize {
        let removed = self.invalidate(&self.config.cacheable_api);
        info!(removed, "Cleared cached API reads");
        removed
    }

    /// Delete every store other than the current one. Returns the purged names.
    pub fn activate(&self) -> Result<Vec<String>> {
        let mut purged = Vec::new();
        for name in self.storage.list()? {
            if name != self.store.name() && self.storage.delete(&name)? {
                info!(store = %name, "Purged stale cache store");
                purged.push(name);
            }
        }
        Ok(purged)
    }
}

// ============================================================================
// Tests
// ============================================================================
