//! In-memory fetcher used by tests across the crate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use reqwest::Url;
use tokio::sync::Notify;

use super::fetch::{FetchError, Fetcher};
use super::request::{Request, Response};
use super::RouterConfig;

pub const BASE_URL: &str = "https://punch.example.com";

pub fn url(path: &str) -> Url {
    Url::parse(BASE_URL)
        .and_then(|base| base.join(path))
        .expect("valid test url")
}

pub fn test_config() -> RouterConfig {
    RouterConfig {
        essential_assets: vec!["/".to_string(), "/static/app.js".to_string()],
        ..RouterConfig::new(Url::parse(BASE_URL).expect("valid base url"))
    }
}

#[derive(Default)]
struct StubState {
    routes: Mutex<HashMap<String, Response>>,
    offline: AtomicBool,
    calls: AtomicUsize,
    requests: Mutex<Vec<Request>>,
    gates: Mutex<HashMap<String, Arc<Notify>>>,
}

/// Serves canned responses keyed by "METHOD path". Clones share state so a
/// test can flip connectivity after handing the fetcher to a router.
#[derive(Clone, Default)]
pub struct StubFetcher {
    state: Arc<StubState>,
}

impl StubFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, method: &str, path: &str, response: Response) -> &Self {
        self.state
            .routes
            .lock()
            .expect("routes lock")
            .insert(format!("{} {}", method, path), response);
        self
    }

    pub fn json(&self, method: &str, path: &str, status: u16, body: serde_json::Value) -> &Self {
        self.route(method, path, Response::json(status, &body))
    }

    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    /// Make fetches of "METHOD path" wait for `release`. The response is
    /// picked when the fetch starts, not when it is released.
    pub fn hold(&self, method: &str, path: &str) {
        self.state
            .gates
            .lock()
            .expect("gates lock")
            .insert(format!("{} {}", method, path), Arc::new(Notify::new()));
    }

    pub fn release(&self, method: &str, path: &str) {
        let gate = self
            .state
            .gates
            .lock()
            .expect("gates lock")
            .remove(&format!("{} {}", method, path));
        if let Some(gate) = gate {
            gate.notify_one();
        }
    }

    pub fn calls(&self) -> usize {
        self.state.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Request> {
        self.state.requests.lock().expect("requests lock").clone()
    }
}

impl Fetcher for StubFetcher {
    async fn fetch(&self, request: &Request) -> Result<Response, FetchError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .requests
            .lock()
            .expect("requests lock")
            .push(request.clone());

        if self.state.offline.load(Ordering::SeqCst) {
            return Err(FetchError::Offline);
        }

        let key = format!("{} {}", request.method, request.path());
        let response = self
            .state
            .routes
            .lock()
            .expect("routes lock")
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Response::new(404, Some("text/plain"), "not found"));

        let gate = self.state.gates.lock().expect("gates lock").get(&key).cloned();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        Ok(response)
    }
}
