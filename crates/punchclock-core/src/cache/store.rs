use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::router::{CacheKey, Request, Response, ResponseSource};

/// Extension used for stored entries
const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedData<T> {
    pub data: T,
    pub cached_at: DateTime<Utc>,
}

impl<T> CachedData<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            cached_at: Utc::now(),
        }
    }

    /// Time since the entry was written. Never negative.
    pub fn age(&self) -> Duration {
        (Utc::now() - self.cached_at).max(Duration::zero())
    }

    /// Coarse age for listings: the largest whole unit only.
    pub fn age_display(&self) -> String {
        let age = self.age();
        match (age.num_days(), age.num_hours(), age.num_minutes()) {
            (0, 0, 0) => "just now".to_string(),
            (0, 0, m) => format!("{} min", m),
            (0, h, _) => format!("{} h", h),
            (1, _, _) => "1 day".to_string(),
            (d, _, _) => format!("{} days", d),
        }
    }
}

/// What is written to disk for each request.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    key: CacheKey,
    response: Response,
}

/// Summary of one stored entry, for listings.
#[derive(Debug, Clone)]
pub struct EntryInfo {
    pub key: CacheKey,
    pub status: u16,
    pub size: usize,
    pub age: String,
}

/// A directory of named cache stores. Each store is one generation of
/// cached responses.
#[derive(Debug, Clone)]
pub struct CacheStorage {
    root: PathBuf,
}

impl CacheStorage {
    pub fn new(root: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create cache directory {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_name(name: &str) -> Result<()> {
        let valid = !name.is_empty()
            && !name.starts_with('.')
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            bail!("Invalid cache store name: {:?}", name);
        }
        Ok(())
    }

    /// Open a store, creating it if needed.
    pub fn open(&self, name: &str) -> Result<CacheStore> {
        Self::validate_name(name)?;
        let dir = self.root.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache store {}", name))?;
        Ok(CacheStore {
            name: name.to_string(),
            dir,
        })
    }

    /// Delete a store and everything in it. Returns `false` if it did not exist.
    pub fn delete(&self, name: &str) -> Result<bool> {
        Self::validate_name(name)?;
        let dir = self.root.join(name);
        if !dir.is_dir() {
            return Ok(false);
        }
        std::fs::remove_dir_all(&dir)
            .with_context(|| format!("Failed to delete cache store {}", name))?;
        debug!(store = name, "Deleted cache store");
        Ok(true)
    }

    /// Names of all stores, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&self.root)
            .with_context(|| format!("Failed to list {}", self.root.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

/// One named store of request → response pairs.
#[derive(Debug, Clone)]
pub struct CacheStore {
    name: String,
    dir: PathBuf,
}

impl CacheStore {
    pub fn name(&self) -> &str {
        &self.name
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        let digest = Sha256::digest(key.as_str().as_bytes());
        self.dir
            .join(format!("{}.{}", hex::encode(digest), ENTRY_EXTENSION))
    }

    fn load(&self, path: &Path) -> Result<CachedData<StoredEntry>> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read cache entry: {}", path.display()))?;
        serde_json::from_str(&contents)
            .with_context(|| format!("Failed to parse cache entry: {}", path.display()))
    }

    /// Look up the stored response for a request.
    pub fn lookup(&self, request: &Request) -> Result<Option<Response>> {
        let key = request.cache_key();
        let path = self.entry_path(&key);
        if !path.exists() {
            return Ok(None);
        }

        let cached = self.load(&path)?;
        if cached.data.key != key {
            // Digest collision or a foreign file; never serve it
            warn!(store = %self.name, key = %key, "Cache entry key mismatch");
            return Ok(None);
        }

        let mut response = cached.data.response;
        response.source = ResponseSource::Cache;
        response.cached_at = Some(cached.cached_at);
        Ok(Some(response))
    }

    /// Store a response for a GET request, replacing any previous entry.
    pub fn put(&self, request: &Request, response: &Response) -> Result<()> {
        if request.method != Method::GET {
            bail!("Only GET requests can be cached, got {}", request.method);
        }

        let key = request.cache_key();
        let path = self.entry_path(&key);
        let entry = CachedData::new(StoredEntry {
            key,
            response: response.clone(),
        });
        let contents = serde_json::to_string(&entry)?;

        // Each write gets its own temp file, renamed over the entry when
        // complete, so readers and concurrent writers never see a partial one
        let mut tmp = NamedTempFile::new_in(&self.dir)
            .with_context(|| format!("Failed to create temp file in {}", self.dir.display()))?;
        tmp.write_all(contents.as_bytes())
            .context("Failed to write cache entry")?;
        tmp.persist(&path)
            .with_context(|| format!("Failed to commit cache entry {}", path.display()))?;
        Ok(())
    }

    pub fn delete(&self, request: &Request) -> Result<bool> {
        let path = self.entry_path(&request.cache_key());
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(&path)?;
        Ok(true)
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXTENSION) {
                paths.push(path);
            }
        }
        Ok(paths)
    }

    /// Keys of every stored entry, sorted.
    pub fn keys(&self) -> Result<Vec<CacheKey>> {
        Ok(self.entries()?.into_iter().map(|info| info.key).collect())
    }

    /// Describe every stored entry. Unreadable entries are skipped.
    pub fn entries(&self) -> Result<Vec<EntryInfo>> {
        let mut infos = Vec::new();
        for path in self.entry_paths()? {
            match self.load(&path) {
                Ok(cached) => infos.push(EntryInfo {
                    age: cached.age_display(),
                    key: cached.data.key,
                    status: cached.data.response.status,
                    size: cached.data.response.body.len(),
                }),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "Skipping unreadable cache entry");
                }
            }
        }
        infos.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        Ok(infos)
    }

    pub fn len(&self) -> Result<usize> {
        Ok(self.entry_paths()?.len())
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reqwest::Url;

    fn request(path: &str) -> Request {
        let url = Url::parse("https://punch.example.com")
            .and_then(|base| base.join(path))
            .expect("valid test url");
        Request::get(url)
    }

    #[test]
    fn test_cached_data_age_display() {
        let mut cached = CachedData::new(1);
        assert_eq!(cached.age_display(), "just now");

        cached.cached_at = Utc::now() - Duration::minutes(5);
        assert_eq!(cached.age_display(), "5 min");

        cached.cached_at = Utc::now() - Duration::minutes(95);
        assert_eq!(cached.age_display(), "1 h");

        cached.cached_at = Utc::now() - Duration::hours(30);
        assert_eq!(cached.age_display(), "1 day");

        cached.cached_at = Utc::now() - Duration::days(3);
        assert_eq!(cached.age_display(), "3 days");

        // Clock moved backwards
        cached.cached_at = Utc::now() + Duration::minutes(10);
        assert_eq!(cached.age(), Duration::zero());
        assert_eq!(cached.age_display(), "just now");
    }

    #[test]
    fn test_put_and_lookup() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = CacheStorage::new(dir.path().to_path_buf()).expect("storage");
        let store = storage.open("punchclock-v1").expect("open store");

        let req = request("/static/app.css");
        assert!(store.lookup(&req).expect("lookup").is_none());

        store
            .put(&req, &Response::new(200, Some("text/css"), "body{}"))
            .expect("put");
        let hit = store.lookup(&req).expect("lookup").expect("entry present");
        assert_eq!(hit.body, b"body{}");
        assert_eq!(hit.source, ResponseSource::Cache);
        assert!(hit.cached_at.is_some());
        assert_eq!(store.len().expect("len"), 1);
    }

    #[test]
    fn test_put_replaces_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStorage::new(dir.path().to_path_buf())
            .and_then(|s| s.open("v1"))
            .expect("store");
        let req = request("/api/user");
        store.put(&req, &Response::new(200, None, "old")).expect("put old");
        store.put(&req, &Response::new(200, None, "new")).expect("put new");
        let hit = store.lookup(&req).expect("lookup").expect("entry");
        assert_eq!(hit.text(), "new");
        assert_eq!(store.keys().expect("keys").len(), 1);
    }

    #[test]
    fn test_concurrent_puts_leave_a_whole_entry() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStorage::new(dir.path().to_path_buf())
            .and_then(|s| s.open("v1"))
            .expect("store");
        let req = request("/api/attendance/today");

        std::thread::scope(|scope| {
            for writer in 0..8 {
                let (store, req) = (&store, &req);
                scope.spawn(move || {
                    let body = format!("{{\"writer\":{},\"pad\":\"{}\"}}", writer, "x".repeat(64 * 1024));
                    for _ in 0..10 {
                        store.put(req, &Response::new(200, None, body.clone())).expect("put");
                    }
                });
            }
        });

        let hit = store.lookup(&req).expect("entry parses").expect("entry present");
        let body: serde_json::Value = serde_json::from_slice(&hit.body).expect("body is whole");
        assert!(body["writer"].is_number());
        // No temp files left behind
        let files = std::fs::read_dir(dir.path().join("v1")).expect("read_dir").count();
        assert_eq!(files, 1);
    }

    #[test]
    fn test_put_rejects_non_get() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStorage::new(dir.path().to_path_buf())
            .and_then(|s| s.open("v1"))
            .expect("store");
        let url = Url::parse("https://punch.example.com/api/attendance/mark").expect("url");
        let post = Request::new(Method::POST, url);
        assert!(store.put(&post, &Response::new(200, None, "x")).is_err());
        assert!(store.is_empty().expect("is_empty"));
    }

    #[test]
    fn test_storage_list_and_delete() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = CacheStorage::new(dir.path().to_path_buf()).expect("storage");
        storage.open("punchclock-v1").expect("open v1");
        storage.open("punchclock-v2").expect("open v2");
        assert_eq!(storage.list().expect("list"), vec!["punchclock-v1", "punchclock-v2"]);

        assert!(storage.delete("punchclock-v1").expect("delete"));
        assert!(!storage.delete("punchclock-v1").expect("delete again"));
        assert_eq!(storage.list().expect("list"), vec!["punchclock-v2"]);
    }

    #[test]
    fn test_invalid_store_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = CacheStorage::new(dir.path().to_path_buf()).expect("storage");
        assert!(storage.open("../escape").is_err());
        assert!(storage.open("").is_err());
        assert!(storage.open(".hidden").is_err());
    }

    #[test]
    fn test_entries_skip_corrupt_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = CacheStorage::new(dir.path().to_path_buf())
            .and_then(|s| s.open("v1"))
            .expect("store");
        store
            .put(&request("/"), &Response::new(200, Some("text/html"), "<html>"))
            .expect("put");
        std::fs::write(dir.path().join("v1").join("garbage.json"), "not json").expect("write");

        let entries = store.entries().expect("entries");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key.as_str(), "GET https://punch.example.com/");
        assert_eq!(entries[0].size, 6);
    }
}
