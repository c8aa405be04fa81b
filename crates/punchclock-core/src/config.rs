//! Client configuration.
//!
//! Stored at `~/.config/punchclock/config.json`. A missing file means
//! defaults; any field missing from the file takes its default too.
//! `PUNCHCLOCK_SERVER_URL` and `PUNCHCLOCK_EMAIL` override the file.
//! The GPS limits here are fallbacks; the server's `/api/config` wins when
//! it can be fetched.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::Url;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::flow::DEFAULT_SCAN_TIMEOUT;
use crate::models::DEFAULT_MAX_ACCURACY_METERS;
use crate::qr::DEFAULT_MAX_DISTANCE_METERS;
use crate::router::{RouterConfig, DEFAULT_CACHE_PREFIX, DEFAULT_CACHE_VERSION};

/// Application name used for config/cache directory paths
pub const APP_NAME: &str = "punchclock";

/// Config file name
const CONFIG_FILE: &str = "config.json";

const DEFAULT_SERVER_URL: &str = "http://localhost:5000";

/// HTTP request timeout in seconds.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

pub const ENV_SERVER_URL: &str = "PUNCHCLOCK_SERVER_URL";
pub const ENV_EMAIL: &str = "PUNCHCLOCK_EMAIL";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server_url: String,
    pub last_email: Option<String>,
    pub cache_prefix: String,
    pub cache_version: String,
    /// Overrides the built-in list of pages cached by `install` when set
    pub essential_assets: Option<Vec<String>>,
    pub scan_timeout_secs: u64,
    pub request_timeout_secs: u64,
    /// GPS limits used until the server publishes its own
    pub max_distance_meters: f64,
    pub max_accuracy_meters: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            last_email: None,
            cache_prefix: DEFAULT_CACHE_PREFIX.to_string(),
            cache_version: DEFAULT_CACHE_VERSION.to_string(),
            essential_assets: None,
            scan_timeout_secs: DEFAULT_SCAN_TIMEOUT.as_secs(),
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            max_distance_meters: DEFAULT_MAX_DISTANCE_METERS,
            max_accuracy_meters: DEFAULT_MAX_ACCURACY_METERS,
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse config file {}", path.display()))
        } else {
            debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find config directory"))?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    pub fn cache_dir(&self) -> Result<PathBuf> {
        let cache_dir = dirs::cache_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not find cache directory"))?;
        Ok(cache_dir.join(APP_NAME))
    }

    /// Apply `PUNCHCLOCK_*` environment overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(url) = non_empty(ENV_SERVER_URL) {
            debug!(server_url = %url, "Server URL overridden from environment");
            self.server_url = url.trim().to_string();
        }
        if let Some(email) = non_empty(ENV_EMAIL) {
            self.last_email = Some(email.trim().to_string());
        }
    }

    pub fn scan_timeout(&self) -> Duration {
        Duration::from_secs(self.scan_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn server_url(&self) -> Result<Url> {
        Url::parse(&self.server_url)
            .with_context(|| format!("Invalid server URL: {}", self.server_url))
    }

    pub fn router_config(&self) -> Result<RouterConfig> {
        let mut config = RouterConfig::new(self.server_url()?);
        config.cache_prefix = self.cache_prefix.clone();
        config.cache_version = self.cache_version.clone();
        if let Some(ref assets) = self.essential_assets {
            config.essential_assets = assets.clone();
        }
        Ok(config)
    }
}
