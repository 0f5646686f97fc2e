//! Dispatcher role
//!
//! Watches the membership namespace and keeps the router artifact in step:
//!
//! ```text
//! MembershipWatcher --(latest snapshot)--> AliveSetReducer --> ConfigWriter --> Reloader
//! ```
//!
//! The watcher publishes through a latest-value channel, so a burst of
//! changes collapses into one reduction and the writer never sees an older
//! alive-set after a newer one.

mod reducer;
pub mod reload;
mod snapshot;
mod watcher;
mod writer;

use std::sync::Arc;

use coordstore::CoordinationStore;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use reducer::{AliveSetReducer, Reduction};
pub use reload::{CommandReloader, HttpReloader, NoopReloader, Reloader, SignalReloader};
pub use snapshot::{MembershipChangeEvent, MembershipSnapshot};
pub use watcher::{MembershipWatcher, ResyncHandle};
pub use writer::{ArtifactFormat, ConfigWriter, EmptyPolicy, WriteOutcome, render};

use crate::config::DispatchConfig;
use crate::domain::{AliveSet, NodeRecord, Target};
use crate::error::{SyncError, WriteError};

/// Read the namespace once and return every decodable record as an alive-set
///
/// No stability window is applied; this is what a dispatcher would publish
/// on a fresh start.
pub async fn list_alive(store: &dyn CoordinationStore, namespace: &str) -> Result<AliveSet, SyncError> {
    debug!(%namespace, "list_alive: called");
    let listing = store.get(namespace).await?;
    let targets = listing
        .entries
        .iter()
        .filter_map(|kv| match NodeRecord::from_value(&kv.key, &kv.value) {
            Ok(record) => Some(Target {
                identity: record.identity,
                endpoint: record.endpoint,
            }),
            Err(e) => {
                warn!(key = %kv.key, error = %e, "Skipping undecodable membership record");
                None
            }
        });
    Ok(AliveSet::new(listing.revision, targets))
}

/// The dispatcher pipeline: watcher, reducer and writer under one loop
pub struct Dispatcher {
    watcher: MembershipWatcher,
    config: DispatchConfig,
    reloader: Arc<dyn Reloader>,
    resync: ResyncHandle,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: impl Into<String>,
        config: DispatchConfig,
        reloader: Arc<dyn Reloader>,
    ) -> Self {
        let namespace = namespace.into();
        debug!(%namespace, artifact = %config.artifact_path.display(), "Dispatcher::new: called");
        let watcher = MembershipWatcher::new(store, namespace, config.retry.clone());
        Self {
            watcher,
            config,
            reloader,
            resync: ResyncHandle::default(),
        }
    }

    /// Handle that forces a re-list and a rewrite of the artifact
    pub fn resync_handle(&self) -> ResyncHandle {
        self.resync.clone()
    }

    /// Run until `shutdown_rx` fires or the watcher gives up
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), SyncError> {
        info!(
            artifact = %self.config.artifact_path.display(),
            format = ?self.config.format,
            stability_window = ?self.config.stability_window(),
            "Dispatcher started"
        );

        let watcher_resync = self.watcher.resync_handle();
        let (mut rx, mut watch_task) = self.watcher.subscribe();
        let mut reducer = AliveSetReducer::new(self.config.stability_window());
        let mut writer = ConfigWriter::new(
            &self.config.artifact_path,
            self.config.format,
            self.config.set_id,
            self.config.empty_policy,
            self.reloader.clone(),
        )
        .await;
        let mut deadline: Option<Instant> = None;
        let mut write_failures: u32 = 0;

        'pipeline: loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Dispatcher shutting down");
                    break 'pipeline;
                }
                res = &mut watch_task => {
                    return finish_watch(res);
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return finish_watch((&mut watch_task).await);
                    }
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    debug!("Dispatcher::run: deadline reached");
                }
                _ = self.resync.requested() => {
                    info!("Resync requested; re-listing and rewriting the artifact");
                    writer.invalidate();
                    watcher_resync.force_resync();
                    continue 'pipeline;
                }
            }

            let snapshot = rx.borrow_and_update().clone();
            if snapshot.version == 0 {
                // Initial listing not in yet
                continue;
            }

            let reduction = reducer.reduce(&snapshot, Instant::now());
            deadline = reduction.next_deadline;

            let write = writer.apply(&reduction.alive);
            tokio::pin!(write);
            let result = tokio::select! {
                res = &mut write => res,
                _ = shutdown_rx.recv() => {
                    let grace = self.config.shutdown_grace();
                    info!(?grace, "Shutdown requested during a write; letting it finish");
                    match tokio::time::timeout(grace, &mut write).await {
                        Ok(res) => log_outcome(&res),
                        Err(_) => warn!(?grace, "Write did not finish within the shutdown grace period"),
                    }
                    break 'pipeline;
                }
            };

            log_outcome(&result);
            if result.is_ok() {
                write_failures = 0;
            } else {
                // Either the artifact was not replaced or the router has not
                // picked it up; try again without waiting for a membership change
                write_failures += 1;
                let retry_at = Instant::now() + self.config.retry.delay(write_failures);
                deadline = Some(deadline.map_or(retry_at, |d| d.min(retry_at)));
            }
        }

        info!("Dispatcher stopped");
        Ok(())
    }
}

fn finish_watch(res: Result<Result<(), SyncError>, tokio::task::JoinError>) -> Result<(), SyncError> {
    match res {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(SyncError::TransportExhausted {
            role: "dispatcher",
            attempts: 0,
            last_error: format!("watch task aborted: {}", e),
        }),
    }
}

fn log_outcome(result: &Result<WriteOutcome, WriteError>) {
    match result {
        Ok(outcome) => debug!(?outcome, "Dispatcher::run: write outcome"),
        Err(WriteError::Reload(e)) => {
            warn!(error = %e, "Artifact written but the router did not reload; retrying")
        }
        Err(e) => error!(error = %e, "Failed to write artifact; previous artifact left in place"),
    }
}
