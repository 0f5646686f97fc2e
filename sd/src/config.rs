//! SipDispatch configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::dispatcher::{ArtifactFormat, EmptyPolicy};
use crate::domain::{validate_endpoint, validate_identity};
use crate::retry::RetryPolicy;

/// Which side of the system this process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Announce,
    Dispatch,
    Probe,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Main SipDispatch configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[serde(rename = "log-level")]
    pub log_level: Option<String>,

    /// Log output format
    #[serde(rename = "log-format")]
    pub log_format: LogFormat,

    /// Coordination store connection
    pub store: StoreConfig,

    /// Startup connectivity probe
    pub probe: ProbeConfig,

    /// Announcer role settings
    pub announce: AnnounceConfig,

    /// Dispatcher role settings
    pub dispatch: DispatchConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        debug!(?config_path, "Config::load: called");
        // If explicit config path provided, try to load it
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        for candidate in Self::search_paths() {
            if candidate.exists() {
                match Self::load_from_file(&candidate) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        warn!("Failed to load config from {}: {}", candidate.display(), e);
                    }
                }
            }
        }

        // No config file found, use defaults
        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    /// Read only the log level and format, before logging is initialized
    pub fn load_log_settings(config_path: Option<&PathBuf>) -> (Option<String>, LogFormat) {
        let path = match config_path {
            Some(p) => Some(p.clone()),
            None => Self::search_paths().into_iter().find(|p| p.exists()),
        };
        let config: Option<Self> = path
            .and_then(|p| fs::read_to_string(p).ok())
            .and_then(|content| serde_yaml::from_str(&content).ok());
        match config {
            Some(config) => (config.log_level, config.log_format),
            None => (None, LogFormat::default()),
        }
    }

    /// Project-local `.sipdispatch.yml`, then `~/.config/sipdispatch/sipdispatch.yml`
    fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".sipdispatch.yml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("sipdispatch").join("sipdispatch.yml"));
        }
        paths
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;

        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;

        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate configuration for `role` before anything touches the network
    pub fn validate(&self, role: Role) -> Result<()> {
        debug!(?role, "Config::validate: called");
        self.store.validate()?;

        if self.probe.timeout_ms == 0 {
            return Err(eyre::eyre!("probe.timeout-ms must be greater than zero"));
        }

        match role {
            Role::Announce => self.announce.validate(),
            Role::Dispatch => self.dispatch.validate(),
            Role::Probe => Ok(()),
        }
    }
}

/// Coordination store connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// etcd client endpoints, tried in order
    pub endpoints: Vec<String>,

    /// Key prefix holding one record per worker
    pub namespace: String,

    /// Per-request timeout in milliseconds
    #[serde(rename = "request-timeout-ms")]
    pub request_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            endpoints: vec![coordstore::DEFAULT_ENDPOINT.to_string()],
            namespace: "/sipdispatch/members".to_string(),
            request_timeout_ms: coordstore::DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.endpoints.is_empty() {
            return Err(eyre::eyre!("store.endpoints must list at least one etcd endpoint"));
        }
        for endpoint in &self.endpoints {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(eyre::eyre!(
                    "store endpoint '{}' must start with http:// or https://",
                    endpoint
                ));
            }
        }
        if !self.namespace.starts_with('/') || self.namespace.trim_end_matches('/').is_empty() {
            return Err(eyre::eyre!(
                "store.namespace '{}' must be an absolute, non-root key prefix",
                self.namespace
            ));
        }
        Ok(())
    }
}

/// Startup connectivity probe
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Timeout for a single probe in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Number of probe attempts before giving up
    pub attempts: u32,

    /// Delay between probe attempts in milliseconds
    #[serde(rename = "retry-delay-ms")]
    pub retry_delay_ms: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            attempts: 1,
            retry_delay_ms: 1000,
        }
    }
}

impl ProbeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

/// Announcer role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnnounceConfig {
    /// Unique worker identity (generated when unset)
    pub identity: Option<String>,

    /// Routable host:port of this worker
    pub endpoint: Option<String>,

    /// Lease TTL in seconds
    #[serde(rename = "ttl-secs")]
    pub ttl_secs: u64,

    /// Renewal cadence in seconds (must be shorter than the TTL)
    #[serde(rename = "renew-interval-secs")]
    pub renew_interval_secs: u64,

    /// Renewal attempts per cycle before logging a liveness risk
    #[serde(rename = "max-renew-attempts")]
    pub max_renew_attempts: u32,

    /// Bound on the best-effort delete at shutdown, in milliseconds
    #[serde(rename = "shutdown-timeout-ms")]
    pub shutdown_timeout_ms: u64,

    /// Backoff and escalation across failed renewal cycles
    pub retry: RetryPolicy,
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            identity: None,
            endpoint: None,
            ttl_secs: 10,
            renew_interval_secs: 3,
            max_renew_attempts: 3,
            shutdown_timeout_ms: 2000,
            retry: RetryPolicy::default(),
        }
    }
}

impl AnnounceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn renew_interval(&self) -> Duration {
        Duration::from_secs(self.renew_interval_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_deref()
            .ok_or_else(|| eyre::eyre!("announce.endpoint is required (host:port of this worker)"))?;
        validate_endpoint(endpoint)?;

        if let Some(identity) = &self.identity {
            validate_identity(identity)?;
        }

        if self.ttl_secs == 0 {
            return Err(eyre::eyre!("announce.ttl-secs must be greater than zero"));
        }
        if self.renew_interval_secs == 0 || self.renew_interval_secs >= self.ttl_secs {
            return Err(eyre::eyre!(
                "announce.renew-interval-secs ({}) must be between 1 and ttl-secs ({}) exclusive",
                self.renew_interval_secs,
                self.ttl_secs
            ));
        }
        if self.renew_interval_secs * 3 > self.ttl_secs {
            warn!(
                renew_interval_secs = self.renew_interval_secs,
                ttl_secs = self.ttl_secs,
                "Renewal interval exceeds a third of the TTL; a single missed renewal may drop this worker"
            );
        }
        if self.max_renew_attempts == 0 {
            return Err(eyre::eyre!("announce.max-renew-attempts must be at least 1"));
        }
        Ok(())
    }
}

/// How the router is told to re-read its artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ReloadConfig {
    /// Do nothing (the router watches the file itself)
    None,

    /// Run a command, e.g. `kamcmd dispatcher.reload`
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(rename = "timeout-ms", default = "default_reload_timeout_ms")]
        timeout_ms: u64,
    },

    /// Signal the process whose pid is in `pid-file`
    Signal {
        #[serde(rename = "pid-file")]
        pid_file: PathBuf,
        #[serde(default = "default_reload_signal")]
        signal: String,
    },

    /// Call an HTTP endpoint, e.g. Kamailio's JSONRPC
    Http {
        url: String,
        #[serde(default = "default_http_method")]
        method: String,
        #[serde(default)]
        body: Option<String>,
        #[serde(rename = "timeout-ms", default = "default_reload_timeout_ms")]
        timeout_ms: u64,
    },
}

fn default_reload_timeout_ms() -> u64 {
    5000
}

fn default_reload_signal() -> String {
    "SIGHUP".to_string()
}

fn default_http_method() -> String {
    "POST".to_string()
}

impl Default for ReloadConfig {
    fn default() -> Self {
        ReloadConfig::Command {
            program: "kamcmd".to_string(),
            args: vec!["dispatcher.reload".to_string()],
            timeout_ms: default_reload_timeout_ms(),
        }
    }
}

/// Dispatcher role settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Router artifact written atomically on membership changes
    #[serde(rename = "artifact-path")]
    pub artifact_path: PathBuf,

    /// Artifact layout
    pub format: ArtifactFormat,

    /// Kamailio dispatcher set id
    #[serde(rename = "set-id")]
    pub set_id: u32,

    /// What to do when no worker is alive
    #[serde(rename = "empty-policy")]
    pub empty_policy: EmptyPolicy,

    /// How long a membership change must persist before it is published, in ms
    #[serde(rename = "stability-window-ms")]
    pub stability_window_ms: u64,

    /// How long an in-flight write may run after shutdown is requested, in ms
    #[serde(rename = "shutdown-grace-ms")]
    pub shutdown_grace_ms: u64,

    /// Backoff and escalation for watch reconnection
    pub retry: RetryPolicy,

    /// Router reload hook
    pub reload: ReloadConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            artifact_path: PathBuf::from("/etc/kamailio/dispatcher.list"),
            format: ArtifactFormat::Kamailio,
            set_id: 1,
            empty_policy: EmptyPolicy::KeepLast,
            stability_window_ms: 2000,
            shutdown_grace_ms: 3000,
            retry: RetryPolicy::default(),
            reload: ReloadConfig::default(),
        }
    }
}

impl DispatchConfig {
    pub fn stability_window(&self) -> Duration {
        Duration::from_millis(self.stability_window_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.artifact_path.file_name().is_none() {
            return Err(eyre::eyre!(
                "dispatch.artifact-path '{}' must name a file",
                self.artifact_path.display()
            ));
        }
        if self.format == ArtifactFormat::Kamailio && self.set_id == 0 {
            return Err(eyre::eyre!("dispatch.set-id must be greater than zero"));
        }
        match &self.reload {
            ReloadConfig::Command { program, .. } if program.trim().is_empty() => {
                Err(eyre::eyre!("dispatch.reload.program must not be empty"))
            }
            ReloadConfig::Http { url, .. } if !(url.starts_with("http://") || url.starts_with("https://")) => {
                Err(eyre::eyre!("dispatch.reload.url '{}' must be an http(s) URL", url))
            }
            _ => Ok(()),
        }
    }
}
