//! Router reload hooks
//!
//! After a new artifact is in place the router has to be told to re-read it.
//! Kamailio accepts `kamcmd dispatcher.reload`, a JSONRPC call, or a signal
//! depending on how it is deployed, so the hook is pluggable.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::ReloadConfig;
use crate::error::WriteError;

/// Tells the router to pick up a freshly written artifact
#[async_trait]
pub trait Reloader: Send + Sync {
    /// Trigger one reload
    async fn reload(&self) -> Result<(), WriteError>;

    /// Short description for logs
    fn describe(&self) -> String;
}

/// Build the reloader selected by `dispatch.reload`
pub fn from_config(config: &ReloadConfig) -> Result<Arc<dyn Reloader>, WriteError> {
    debug!(?config, "reload::from_config: called");
    let reloader: Arc<dyn Reloader> = match config {
        ReloadConfig::None => Arc::new(NoopReloader),
        ReloadConfig::Command {
            program,
            args,
            timeout_ms,
        } => Arc::new(CommandReloader::new(
            program.clone(),
            args.clone(),
            Duration::from_millis(*timeout_ms),
        )),
        ReloadConfig::Signal { pid_file, signal } => Arc::new(SignalReloader::new(pid_file.clone(), signal)?),
        ReloadConfig::Http {
            url,
            method,
            body,
            timeout_ms,
        } => Arc::new(HttpReloader::new(
            url.clone(),
            method,
            body.clone(),
            Duration::from_millis(*timeout_ms),
        )?),
    };
    info!(reloader = %reloader.describe(), "Configured router reload hook");
    Ok(reloader)
}

/// Does nothing; for routers that watch the file themselves
pub struct NoopReloader;

#[async_trait]
impl Reloader for NoopReloader {
    async fn reload(&self) -> Result<(), WriteError> {
        debug!("NoopReloader::reload: called");
        Ok(())
    }

    fn describe(&self) -> String {
        "none".to_string()
    }
}

/// Runs a command such as `kamcmd dispatcher.reload`
pub struct CommandReloader {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandReloader {
    pub fn new(program: String, args: Vec<String>, timeout: Duration) -> Self {
        Self { program, args, timeout }
    }
}

#[async_trait]
impl Reloader for CommandReloader {
    async fn reload(&self) -> Result<(), WriteError> {
        debug!(program = %self.program, args = ?self.args, "CommandReloader::reload: called");
        let child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, child)
            .await
            .map_err(|_| WriteError::Reload(format!("{} timed out after {:?}", self.describe(), self.timeout)))?
            .map_err(|e| WriteError::Reload(format!("failed to run {}: {}", self.program, e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(WriteError::Reload(format!(
                "{} exited with {}: {}",
                self.describe(),
                output.status,
                stderr.trim()
            )));
        }
        debug!(stdout = %String::from_utf8_lossy(&output.stdout).trim(), "CommandReloader::reload: done");
        Ok(())
    }

    fn describe(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Sends a signal to the process named by a pid file
pub struct SignalReloader {
    pid_file: PathBuf,
    signal: nix::sys::signal::Signal,
}

impl SignalReloader {
    pub fn new(pid_file: PathBuf, signal: &str) -> Result<Self, WriteError> {
        let name = signal.trim().to_ascii_uppercase();
        let name = if name.starts_with("SIG") { name } else { format!("SIG{}", name) };
        let signal = name
            .parse::<nix::sys::signal::Signal>()
            .map_err(|_| WriteError::Reload(format!("unknown signal '{}'", signal)))?;
        Ok(Self { pid_file, signal })
    }
}

#[async_trait]
impl Reloader for SignalReloader {
    async fn reload(&self) -> Result<(), WriteError> {
        use nix::sys::signal::kill;
        use nix::unistd::Pid;

        debug!(pid_file = %self.pid_file.display(), signal = ?self.signal, "SignalReloader::reload: called");
        // The artifact is already replaced by now, so any failure here is a reload failure
        let content = tokio::fs::read_to_string(&self.pid_file)
            .await
            .map_err(|e| WriteError::Reload(format!("cannot read pid file {}: {}", self.pid_file.display(), e)))?;
        let pid: i32 = content
            .trim()
            .parse()
            .map_err(|_| WriteError::Reload(format!("invalid pid in {}", self.pid_file.display())))?;

        kill(Pid::from_raw(pid), self.signal)
            .map_err(|e| WriteError::Reload(format!("failed to send {:?} to {}: {}", self.signal, pid, e)))?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{:?} -> {}", self.signal, self.pid_file.display())
    }
}

/// Calls an HTTP endpoint, e.g. Kamailio's JSONRPC `dispatcher.reload`
pub struct HttpReloader {
    client: reqwest::Client,
    url: String,
    method: reqwest::Method,
    body: Option<String>,
}

impl HttpReloader {
    pub fn new(url: String, method: &str, body: Option<String>, timeout: Duration) -> Result<Self, WriteError> {
        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| WriteError::Reload(format!("invalid HTTP method '{}'", method)))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| WriteError::Reload(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            url,
            method,
            body,
        })
    }
}

#[async_trait]
impl Reloader for HttpReloader {
    async fn reload(&self) -> Result<(), WriteError> {
        debug!(url = %self.url, method = %self.method, "HttpReloader::reload: called");
        let mut request = self.client.request(self.method.clone(), &self.url);
        if let Some(body) = &self.body {
            request = request.header("content-type", "application/json").body(body.clone());
        }

        let response = request
            .send()
            .await
            .map_err(|e| WriteError::Reload(format!("{} failed: {}", self.describe(), e)))?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(WriteError::Reload(format!("{} returned {}: {}", self.describe(), status, text)));
        }
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{} {}", self.method, self.url)
    }
}
