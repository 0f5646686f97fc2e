//! Configuration for coordstore

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// etcd client endpoints, tried in order
    #[serde(default = "default_endpoints")]
    pub endpoints: Vec<String>,

    /// Per-request timeout in milliseconds
    #[serde(rename = "request-timeout-ms", default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_endpoints() -> Vec<String> {
    vec![crate::DEFAULT_ENDPOINT.to_string()]
}

fn default_request_timeout_ms() -> u64 {
    crate::DEFAULT_REQUEST_TIMEOUT_MS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl Config {
    /// Load config from file, or use defaults
    pub fn load(path: Option<&PathBuf>) -> Result<Self> {
        if let Some(config_path) = path {
            return Self::load_from_file(config_path)
                .context(format!("Failed to load config from {}", config_path.display()));
        }

        // Try default locations
        let default_paths = [
            dirs::config_dir().map(|p| p.join("coordstore").join("coordstore.yml")),
            Some(PathBuf::from("coordstore.yml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                return Self::load_from_file(path);
            }
        }

        Ok(Config::default())
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        let config: Config = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Per-request timeout as a Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
