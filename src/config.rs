use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::{path::Path, time::Duration};

/// Maximum config file size (1 MB).
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Runtime configuration for a watch.
///
/// Every field has a default so a partial JSON file only overrides what it
/// names. Token fields hold environment variable *names*; the tokens
/// themselves are never part of the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    pub poll_interval_secs: u64,
    pub download_workers: usize,
    pub http_timeout_secs: u64,
    pub github_api_url: String,
    pub cloudbuild_api_url: String,
    pub gcs_api_url: String,
    pub registry_scheme: String,
    pub github_token_env: String,
    pub google_token_env: String,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 3,
            download_workers: 4,
            http_timeout_secs: 60,
            github_api_url: "https://api.github.com".to_string(),
            cloudbuild_api_url: "https://cloudbuild.googleapis.com".to_string(),
            gcs_api_url: "https://storage.googleapis.com".to_string(),
            registry_scheme: "https".to_string(),
            github_token_env: "GITHUB_TOKEN".to_string(),
            google_token_env: "GOOGLE_OAUTH_ACCESS_TOKEN".to_string(),
        }
    }
}

impl WatchConfig {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => crate::fs_guard::read_json(p, MAX_CONFIG_BYTES),
            None => Ok(Self::default()),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Download pool size, never zero.
    pub fn workers(&self) -> usize {
        self.download_workers.max(1)
    }

    /// Reads a bearer token from the environment variable named by `var`.
    /// Empty values count as unset.
    pub fn token_from_env(var: &str) -> Option<String> {
        std::env::var(var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}
