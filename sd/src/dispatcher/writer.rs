//! ConfigWriter - renders the alive-set and replaces the router artifact atomically

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::{debug, error, info, warn};

use super::reload::Reloader;
use crate::domain::AliveSet;
use crate::error::WriteError;

/// Artifact layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactFormat {
    /// One `host:port` per line
    Plain,
    /// Kamailio `dispatcher.list`: `<setid> sip:<host:port>` per line
    Kamailio,
}

/// What to do with an empty alive-set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmptyPolicy {
    /// Leave the last good artifact alone
    KeepLast,
    /// Write an artifact with no targets
    WriteEmpty,
}

/// Result of applying one alive-set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// New content written and the router reloaded
    Written,
    /// Content matches what is already on disk
    Unchanged,
    /// Empty set ignored under [`EmptyPolicy::KeepLast`]
    SkippedEmpty,
    /// Older than an alive-set already applied
    Stale,
    /// Content already on disk; only a reload left over from a failed attempt ran
    Reloaded,
}

/// Render `alive` in `format`; deterministic and newline-terminated
pub fn render(alive: &AliveSet, format: ArtifactFormat, set_id: u32) -> String {
    let mut out = String::new();
    match format {
        ArtifactFormat::Plain => {
            for target in alive.targets() {
                out.push_str(&target.endpoint);
                out.push('\n');
            }
        }
        ArtifactFormat::Kamailio => {
            out.push_str("# dispatcher.list generated by sipdispatch; manual edits are overwritten\n");
            out.push_str("# setid destination\n");
            for target in alive.targets() {
                out.push_str(&format!("{} sip:{}\n", set_id, target.endpoint));
            }
        }
    }
    out
}

/// Writes the router artifact and triggers a reload after each change
pub struct ConfigWriter {
    path: PathBuf,
    format: ArtifactFormat,
    set_id: u32,
    empty_policy: EmptyPolicy,
    reloader: Arc<dyn Reloader>,
    last_version: Option<u64>,
    /// Content known to be on disk
    current: Option<String>,
    /// The artifact on disk has not been picked up by the router yet
    reload_pending: bool,
}

impl ConfigWriter {
    /// Create a writer, reading any existing artifact so an unchanged restart
    /// does not reload the router
    pub async fn new(
        path: impl Into<PathBuf>,
        format: ArtifactFormat,
        set_id: u32,
        empty_policy: EmptyPolicy,
        reloader: Arc<dyn Reloader>,
    ) -> Self {
        let path = path.into();
        debug!(path = %path.display(), ?format, set_id, ?empty_policy, "ConfigWriter::new: called");
        let current = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Could not read existing artifact");
                None
            }
        };
        Self {
            path,
            format,
            set_id,
            empty_policy,
            reloader,
            last_version: None,
            current,
            reload_pending: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Content this writer believes is on disk
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Whether the last written artifact still waits for a successful reload
    pub fn reload_pending(&self) -> bool {
        self.reload_pending
    }

    /// Forget what is on disk so the next non-empty apply rewrites and reloads
    pub fn invalidate(&mut self) {
        debug!("ConfigWriter::invalidate: called");
        self.current = None;
    }

    /// Apply one alive-set
    ///
    /// On a write error the previous artifact stays in place. On a reload
    /// error the new artifact is already in place, the error is returned and
    /// every later apply retries the reload until it succeeds.
    pub async fn apply(&mut self, alive: &AliveSet) -> Result<WriteOutcome, WriteError> {
        debug!(version = alive.version, targets = alive.len(), "ConfigWriter::apply: called");

        if let Some(last) = self.last_version
            && alive.version < last
        {
            debug!(version = alive.version, last, "ConfigWriter::apply: stale alive-set dropped");
            return Ok(WriteOutcome::Stale);
        }

        if alive.is_empty() && self.empty_policy == EmptyPolicy::KeepLast {
            self.last_version = Some(alive.version);
            if self.current.is_some() {
                warn!(
                    path = %self.path.display(),
                    "Alive-set is empty; keeping the last artifact (empty-policy: keep-last)"
                );
            }
            if self.reload_pending {
                self.reload().await?;
            }
            return Ok(WriteOutcome::SkippedEmpty);
        }

        let content = render(alive, self.format, self.set_id);
        if self.current.as_deref() == Some(content.as_str()) {
            self.last_version = Some(alive.version);
            if self.reload_pending {
                debug!("ConfigWriter::apply: content unchanged, retrying the pending reload");
                self.reload().await?;
                return Ok(WriteOutcome::Reloaded);
            }
            debug!("ConfigWriter::apply: content unchanged");
            return Ok(WriteOutcome::Unchanged);
        }

        let path = self.path.clone();
        let bytes = content.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, bytes.as_bytes()))
            .await
            .map_err(|e| WriteError::Io {
                path: self.path.clone(),
                source: std::io::Error::other(e),
            })??;

        self.current = Some(content);
        self.last_version = Some(alive.version);
        self.reload_pending = true;
        info!(
            path = %self.path.display(),
            version = alive.version,
            targets = alive.len(),
            "Wrote dispatcher artifact"
        );

        self.reload().await?;
        Ok(WriteOutcome::Written)
    }

    async fn reload(&mut self) -> Result<(), WriteError> {
        debug!(reloader = %self.reloader.describe(), "ConfigWriter::reload: called");
        if let Err(e) = self.reloader.reload().await {
            error!(reloader = %self.reloader.describe(), error = %e, "Router reload failed");
            return Err(e);
        }
        self.reload_pending = false;
        info!(reloader = %self.reloader.describe(), "Router reloaded");
        Ok(())
    }
}

/// Write `bytes` to a temp file beside `path`, fsync it, rename over `path`,
/// then fsync the directory so the rename survives a crash
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), WriteError> {
    debug!(path = %path.display(), len = bytes.len(), "write_atomic: called");
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    let io_err = |source: std::io::Error| WriteError::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = NamedTempFile::new_in(&dir).map_err(io_err)?;
    tmp.write_all(bytes).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|e| WriteError::Persist {
        path: path.to_path_buf(),
        source: e.error,
    })?;

    #[cfg(unix)]
    {
        let handle = std::fs::File::open(&dir).map_err(io_err)?;
        handle.sync_all().map_err(io_err)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::reload::tests::CountingReloader;
    use crate::domain::Target;
    use std::sync::atomic::Ordering;
    use tempfile::TempDir;

    fn alive(version: u64, members: &[(&str, &str)]) -> AliveSet {
        AliveSet::new(
            version,
            members.iter().map(|(id, ep)| Target {
                identity: id.to_string(),
                endpoint: ep.to_string(),
            }),
        )
    }

    async fn writer(dir: &TempDir, policy: EmptyPolicy) -> (ConfigWriter, Arc<CountingReloader>) {
        let reloader = Arc::new(CountingReloader::default());
        let writer = ConfigWriter::new(
            dir.path().join("dispatcher.list"),
            ArtifactFormat::Kamailio,
            1,
            policy,
            reloader.clone(),
        )
        .await;
        (writer, reloader)
    }

    #[test]
    fn test_render_kamailio() {
        let set = alive(1, &[("w2", "10.0.0.6:5060"), ("w1", "10.0.0.5:5060")]);
        let text = render(&set, ArtifactFormat::Kamailio, 4);
        let lines: Vec<&str> = text.lines().filter(|l| !l.starts_with('#')).collect();
        assert_eq!(lines, vec!["4 sip:10.0.0.5:5060", "4 sip:10.0.0.6:5060"]);
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_render_plain() {
        let set = alive(1, &[("w1", "10.0.0.5:5060"), ("w2", "10.0.0.6:5060")]);
        assert_eq!(render(&set, ArtifactFormat::Plain, 1), "10.0.0.5:5060\n10.0.0.6:5060\n");
        assert_eq!(render(&alive(1, &[]), ArtifactFormat::Plain, 1), "");
    }

    #[tokio::test]
    async fn test_write_then_reload_once() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;

        let set = alive(1, &[("w1", "10.0.0.5:5060")]);
        assert_eq!(writer.apply(&set).await.unwrap(), WriteOutcome::Written);
        assert_eq!(reloader.calls(), 1);

        let on_disk = std::fs::read_to_string(writer.path()).unwrap();
        assert!(on_disk.contains("1 sip:10.0.0.5:5060"));
    }

    #[tokio::test]
    async fn test_identical_content_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;

        let set = alive(1, &[("w1", "10.0.0.5:5060")]);
        writer.apply(&set).await.unwrap();
        let again = alive(2, &[("w1", "10.0.0.5:5060")]);
        assert_eq!(writer.apply(&again).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(reloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_stale_version_dropped() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;

        writer.apply(&alive(5, &[("w1", "10.0.0.5:5060")])).await.unwrap();
        let outcome = writer.apply(&alive(4, &[("w2", "10.0.0.6:5060")])).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Stale);
        assert_eq!(reloader.calls(), 1);
        assert!(!std::fs::read_to_string(writer.path()).unwrap().contains("10.0.0.6"));
    }

    #[tokio::test]
    async fn test_same_version_new_content_is_written() {
        let dir = TempDir::new().unwrap();
        let (mut writer, _) = writer(&dir, EmptyPolicy::KeepLast).await;

        writer.apply(&alive(3, &[("w1", "10.0.0.5:5060")])).await.unwrap();
        let outcome = writer
            .apply(&alive(3, &[("w1", "10.0.0.5:5060"), ("w2", "10.0.0.6:5060")]))
            .await
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Written);
    }

    #[tokio::test]
    async fn test_keep_last_skips_empty() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;

        writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await.unwrap();
        assert_eq!(writer.apply(&alive(2, &[])).await.unwrap(), WriteOutcome::SkippedEmpty);

        assert!(std::fs::read_to_string(writer.path()).unwrap().contains("10.0.0.5:5060"));
        assert_eq!(reloader.calls(), 1);
    }

    #[tokio::test]
    async fn test_write_empty_policy() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::WriteEmpty).await;

        writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await.unwrap();
        assert_eq!(writer.apply(&alive(2, &[])).await.unwrap(), WriteOutcome::Written);

        assert!(!std::fs::read_to_string(writer.path()).unwrap().contains("sip:"));
        assert_eq!(reloader.calls(), 2);
    }

    #[tokio::test]
    async fn test_restart_with_same_content_does_not_reload() {
        let dir = TempDir::new().unwrap();
        let set = alive(1, &[("w1", "10.0.0.5:5060")]);
        {
            let (mut first, _) = writer(&dir, EmptyPolicy::KeepLast).await;
            first.apply(&set).await.unwrap();
        }

        let (mut second, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;
        assert_eq!(second.apply(&set).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(reloader.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalidate_forces_rewrite() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;

        let set = alive(1, &[("w1", "10.0.0.5:5060")]);
        writer.apply(&set).await.unwrap();
        writer.invalidate();
        assert_eq!(writer.apply(&set).await.unwrap(), WriteOutcome::Written);
        assert_eq!(reloader.calls(), 2);
    }

    #[tokio::test]
    async fn test_reload_failure_is_reported_after_write() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;
        reloader.fail.store(true, Ordering::SeqCst);

        let result = writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await;
        assert!(matches!(result, Err(WriteError::Reload(_))));
        // The artifact is in place regardless
        assert!(std::fs::read_to_string(writer.path()).unwrap().contains("10.0.0.5:5060"));
        assert!(writer.reload_pending());
    }

    #[tokio::test]
    async fn test_failed_reload_retried_on_unchanged_content() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;
        reloader.fail.store(true, Ordering::SeqCst);

        let set = alive(1, &[("w1", "10.0.0.5:5060")]);
        assert!(writer.apply(&set).await.is_err());
        assert_eq!(reloader.calls(), 1);

        reloader.fail.store(false, Ordering::SeqCst);
        let again = alive(2, &[("w1", "10.0.0.5:5060")]);
        assert_eq!(writer.apply(&again).await.unwrap(), WriteOutcome::Reloaded);
        assert_eq!(reloader.calls(), 2);
        assert!(!writer.reload_pending());

        // Once the router has it, identical content is a no-op again
        assert_eq!(writer.apply(&alive(3, &[("w1", "10.0.0.5:5060")])).await.unwrap(), WriteOutcome::Unchanged);
        assert_eq!(reloader.calls(), 2);
    }

    #[tokio::test]
    async fn test_failed_reload_retried_when_set_goes_empty() {
        let dir = TempDir::new().unwrap();
        let (mut writer, reloader) = writer(&dir, EmptyPolicy::KeepLast).await;
        reloader.fail.store(true, Ordering::SeqCst);
        assert!(writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await.is_err());

        reloader.fail.store(false, Ordering::SeqCst);
        assert_eq!(writer.apply(&alive(2, &[])).await.unwrap(), WriteOutcome::SkippedEmpty);
        assert_eq!(reloader.calls(), 2);
        assert!(!writer.reload_pending());
    }

    #[tokio::test]
    async fn test_missing_pid_file_is_a_reload_failure() {
        use crate::dispatcher::reload::SignalReloader;

        let dir = TempDir::new().unwrap();
        let reloader = Arc::new(SignalReloader::new(dir.path().join("missing.pid"), "usr1").unwrap());
        let mut writer = ConfigWriter::new(
            dir.path().join("dispatcher.list"),
            ArtifactFormat::Plain,
            1,
            EmptyPolicy::KeepLast,
            reloader,
        )
        .await;

        let result = writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await;
        assert!(matches!(result, Err(WriteError::Reload(_))));
        assert_eq!(std::fs::read_to_string(writer.path()).unwrap(), "10.0.0.5:5060\n");
        assert!(writer.reload_pending());
    }

    #[tokio::test]
    async fn test_write_failure_keeps_previous_state() {
        let dir = TempDir::new().unwrap();
        let reloader = Arc::new(CountingReloader::default());
        let mut writer = ConfigWriter::new(
            dir.path().join("missing-dir").join("dispatcher.list"),
            ArtifactFormat::Plain,
            1,
            EmptyPolicy::KeepLast,
            reloader.clone(),
        )
        .await;

        let result = writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await;
        assert!(matches!(result, Err(WriteError::Io { .. })));
        assert_eq!(reloader.calls(), 0);
        assert!(writer.current().is_none());
    }

    #[tokio::test]
    async fn test_no_temp_files_left_behind() {
        let dir = TempDir::new().unwrap();
        let (mut writer, _) = writer(&dir, EmptyPolicy::KeepLast).await;

        writer.apply(&alive(1, &[("w1", "10.0.0.5:5060")])).await.unwrap();
        writer.apply(&alive(2, &[("w2", "10.0.0.6:5060")])).await.unwrap();

        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec!["dispatcher.list"]);
    }
}
