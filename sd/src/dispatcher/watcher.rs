//! MembershipWatcher - mirrors the membership namespace into a snapshot
//!
//! Re-lists the namespace, then follows the store watch from the listing's
//! revision. Any break in the watch leads to a fresh re-list, so the
//! published snapshot always converges on what `get(prefix)` returns.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use coordstore::{CoordinationStore, EventKind, Listing, StoreError, WatchEvent};
use futures::StreamExt;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::snapshot::{MembershipChangeEvent, MembershipSnapshot};
use crate::domain::{NodeRecord, identity_from_key};
use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// Requests an immediate re-list from a running watcher
#[derive(Clone, Default)]
pub struct ResyncHandle {
    notify: Arc<Notify>,
}

impl ResyncHandle {
    pub fn force_resync(&self) {
        debug!("ResyncHandle::force_resync: called");
        self.notify.notify_one();
    }

    pub(crate) async fn requested(&self) {
        self.notify.notified().await;
    }
}

/// Why a watch session ended
enum SessionEnd {
    /// Every receiver is gone
    Closed,
    /// Re-list requested
    Resync,
    Failed(StoreError),
}

/// Watches `<namespace>/` and publishes the latest MembershipSnapshot
pub struct MembershipWatcher {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    retry: RetryPolicy,
    resync: ResyncHandle,
}

impl MembershipWatcher {
    pub fn new(store: Arc<dyn CoordinationStore>, namespace: impl Into<String>, retry: RetryPolicy) -> Self {
        let namespace = namespace.into();
        debug!(%namespace, "MembershipWatcher::new: called");
        Self {
            store,
            namespace,
            retry,
            resync: ResyncHandle::default(),
        }
    }

    /// Handle for requesting a re-list after the watcher has been spawned
    pub fn resync_handle(&self) -> ResyncHandle {
        self.resync.clone()
    }

    pub fn force_resync(&self) {
        self.resync.force_resync();
    }

    /// Spawn the watch task
    ///
    /// The receiver only ever holds the latest snapshot; the task stops once
    /// every receiver is dropped, or fails with
    /// [`SyncError::TransportExhausted`] if the retry budget runs out.
    pub fn subscribe(self) -> (watch::Receiver<MembershipSnapshot>, JoinHandle<Result<(), SyncError>>) {
        debug!(namespace = %self.namespace, "MembershipWatcher::subscribe: called");
        let (tx, rx) = watch::channel(MembershipSnapshot::default());
        let handle = tokio::spawn(self.run(tx));
        (rx, handle)
    }

    async fn run(self, tx: watch::Sender<MembershipSnapshot>) -> Result<(), SyncError> {
        info!(namespace = %self.namespace, "Membership watch started");
        let mut state = WatchState::default();
        let mut failures: u32 = 0;
        // Consecutive compactions with no new revision in between
        let mut relists: u32 = 0;
        let mut relist_revision: u64 = 0;

        loop {
            match self.session(&mut state, &tx, &mut failures).await {
                SessionEnd::Closed => {
                    info!(namespace = %self.namespace, "Membership watch stopped");
                    return Ok(());
                }
                SessionEnd::Resync => {
                    info!("Forced resync requested");
                }
                SessionEnd::Failed(e) if e.needs_relist() => {
                    relists = if state.snapshot.revision > relist_revision { 1 } else { relists + 1 };
                    relist_revision = state.snapshot.revision;
                    let delay = self.retry.delay(relists);
                    warn!(error = %e, relists, ?delay, "Watch history compacted, re-listing");
                    if !self.pause(delay, &tx).await {
                        return Ok(());
                    }
                }
                SessionEnd::Failed(e) => {
                    failures += 1;
                    if self.retry.is_exhausted(failures) {
                        error!(failures, error = %e, "Membership watch exhausted its retry budget");
                        return Err(SyncError::TransportExhausted {
                            role: "dispatcher",
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    if self.retry.is_liveness_risk(failures) {
                        warn!(
                            condition = "liveness_risk",
                            failures,
                            error = %e,
                            "Membership watch keeps failing; the artifact may be going stale"
                        );
                    } else {
                        warn!(failures, error = %e, "Membership watch broke, reconnecting");
                    }

                    let delay = self.retry.delay(failures);
                    if !self.pause(delay, &tx).await {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Wait out `delay` before the next session; false once every receiver is gone
    async fn pause(&self, delay: Duration, tx: &watch::Sender<MembershipSnapshot>) -> bool {
        debug!(?delay, "MembershipWatcher::pause: backing off");
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            _ = self.resync.requested() => true,
            _ = tx.closed() => false,
        }
    }

    /// Re-list, publish, then follow the watch until it breaks
    async fn session(
        &self,
        state: &mut WatchState,
        tx: &watch::Sender<MembershipSnapshot>,
        failures: &mut u32,
    ) -> SessionEnd {
        let listing = tokio::select! {
            res = self.store.get(&self.namespace) => match res {
                Ok(listing) => listing,
                Err(e) => return SessionEnd::Failed(e),
            },
            _ = tx.closed() => return SessionEnd::Closed,
        };
        let after = listing.revision;
        state.resync(listing, &self.namespace);
        tx.send_replace(state.snapshot.clone());
        info!(
            version = state.snapshot.version,
            revision = state.snapshot.revision,
            records = state.snapshot.len(),
            "Membership resynced"
        );

        let mut stream = tokio::select! {
            res = self.store.watch(&self.namespace, after) => match res {
                Ok(stream) => stream,
                Err(e) => return SessionEnd::Failed(e),
            },
            _ = tx.closed() => return SessionEnd::Closed,
        };
        if *failures > 0 {
            info!(failures = *failures, "Membership watch re-established");
            *failures = 0;
        }

        loop {
            tokio::select! {
                _ = tx.closed() => return SessionEnd::Closed,
                _ = self.resync.requested() => return SessionEnd::Resync,
                item = stream.next() => match item {
                    Some(Ok(event)) => {
                        if state.apply_watch_event(event, &self.namespace) {
                            tx.send_replace(state.snapshot.clone());
                        }
                    }
                    Some(Err(e)) => return SessionEnd::Failed(e),
                    None => return SessionEnd::Failed(StoreError::Closed),
                },
            }
        }
    }
}

/// Snapshot plus the last revision applied per key
#[derive(Default)]
struct WatchState {
    snapshot: MembershipSnapshot,
    key_revisions: HashMap<String, u64>,
}

impl WatchState {
    fn resync(&mut self, listing: Listing, namespace: &str) {
        debug!(entries = listing.entries.len(), revision = listing.revision, "WatchState::resync: called");
        self.key_revisions.clear();
        let mut records = Vec::with_capacity(listing.entries.len());
        for kv in listing.entries {
            if !is_member_key(&kv.key, namespace) {
                continue;
            }
            self.key_revisions.insert(kv.key.clone(), kv.revision);
            match NodeRecord::from_value(&kv.key, &kv.value) {
                Ok(record) => records.push(record),
                Err(e) => warn!(key = %kv.key, error = %e, "Ignoring undecodable membership record"),
            }
        }
        self.snapshot.apply(MembershipChangeEvent::Resynced(records));
        self.snapshot.observe_revision(listing.revision);
    }

    /// Apply one store event; returns whether the snapshot changed version
    fn apply_watch_event(&mut self, event: WatchEvent, namespace: &str) -> bool {
        debug!(key = %event.key, kind = ?event.kind, revision = event.revision, "WatchState::apply_watch_event: called");
        if !is_member_key(&event.key, namespace) {
            return false;
        }
        if let Some(&seen) = self.key_revisions.get(&event.key)
            && event.revision <= seen
        {
            debug!(key = %event.key, revision = event.revision, seen, "Ignoring stale event");
            return false;
        }
        self.key_revisions.insert(event.key.clone(), event.revision);
        self.snapshot.observe_revision(event.revision);

        let identity = identity_from_key(&event.key).to_string();
        let change = match (event.kind, event.value) {
            (EventKind::Put, Some(value)) => match NodeRecord::from_value(&event.key, &value) {
                Ok(record) if self.snapshot.contains(&identity) => MembershipChangeEvent::Updated(record),
                Ok(record) => MembershipChangeEvent::Added(record),
                Err(e) => {
                    // A corrupt record must not stay routable
                    warn!(key = %event.key, error = %e, "Undecodable membership record, treating as removed");
                    if !self.snapshot.contains(&identity) {
                        return false;
                    }
                    MembershipChangeEvent::Removed(identity)
                }
            },
            (EventKind::Put, None) | (EventKind::Delete, _) => {
                if !self.snapshot.contains(&identity) {
                    return false;
                }
                MembershipChangeEvent::Removed(identity)
            }
        };

        debug!(?change, "WatchState::apply_watch_event: applying");
        self.snapshot.apply(change);
        true
    }
}

/// Direct children of the namespace only
fn is_member_key(key: &str, namespace: &str) -> bool {
    let prefix = namespace.trim_end_matches('/');
    key.strip_prefix(prefix)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|leaf| !leaf.is_empty() && !leaf.contains('/'))
}
