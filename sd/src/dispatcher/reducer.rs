//! AliveSetReducer - turns snapshots into a stable, routable alive-set

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use super::snapshot::MembershipSnapshot;
use crate::domain::{AliveSet, Target};

/// Output of one reduction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reduction {
    pub alive: AliveSet,
    /// When a pending change matures, if any is pending
    pub next_deadline: Option<Instant>,
}

/// Debounces membership flaps with a stability window
///
/// New identities stay pending until they have been present for the whole
/// window; published identities that disappear stay routable until they have
/// been absent for the whole window. Endpoint changes of published identities
/// apply at once.
#[derive(Debug)]
pub struct AliveSetReducer {
    window: Duration,
    seeded: bool,
    /// identity -> endpoint currently routable
    published: BTreeMap<String, String>,
    pending_adds: BTreeMap<String, Instant>,
    pending_removals: BTreeMap<String, Instant>,
}

impl AliveSetReducer {
    pub fn new(stability_window: Duration) -> Self {
        debug!(?stability_window, "AliveSetReducer::new: called");
        Self {
            window: stability_window,
            seeded: false,
            published: BTreeMap::new(),
            pending_adds: BTreeMap::new(),
            pending_removals: BTreeMap::new(),
        }
    }

    /// Compute the alive-set for `snapshot` as of `now`
    pub fn reduce(&mut self, snapshot: &MembershipSnapshot, now: Instant) -> Reduction {
        debug!(version = snapshot.version, records = snapshot.len(), "AliveSetReducer::reduce: called");

        if !self.seeded {
            // Records present at startup have unknown age; treat them as stable
            self.published = snapshot
                .records
                .iter()
                .map(|(id, r)| (id.clone(), r.endpoint.clone()))
                .collect();
            self.seeded = true;
            info!(targets = self.published.len(), "Seeded alive-set from initial snapshot");
        } else {
            self.step(snapshot, now);
        }

        Reduction {
            alive: AliveSet::new(
                snapshot.version,
                self.published.iter().map(|(identity, endpoint)| Target {
                    identity: identity.clone(),
                    endpoint: endpoint.clone(),
                }),
            ),
            next_deadline: self.next_deadline(),
        }
    }

    fn step(&mut self, snapshot: &MembershipSnapshot, now: Instant) {
        for (identity, record) in &snapshot.records {
            if let Some(endpoint) = self.published.get_mut(identity) {
                if self.pending_removals.remove(identity).is_some() {
                    debug!(%identity, "AliveSetReducer::step: removal cancelled, identity reappeared");
                }
                if *endpoint != record.endpoint {
                    info!(%identity, old = %endpoint, new = %record.endpoint, "Endpoint changed");
                    *endpoint = record.endpoint.clone();
                }
                continue;
            }

            let since = *self.pending_adds.entry(identity.clone()).or_insert(now);
            if now.saturating_duration_since(since) >= self.window {
                self.pending_adds.remove(identity);
                self.published.insert(identity.clone(), record.endpoint.clone());
                info!(%identity, endpoint = %record.endpoint, "Target became stable, adding");
            }
        }

        // Added then removed inside the window: never published
        self.pending_adds.retain(|identity, _| snapshot.contains(identity));

        let missing: Vec<String> = self
            .published
            .keys()
            .filter(|identity| !snapshot.contains(identity))
            .cloned()
            .collect();
        for identity in missing {
            let since = *self.pending_removals.entry(identity.clone()).or_insert(now);
            if now.saturating_duration_since(since) >= self.window {
                self.pending_removals.remove(&identity);
                self.published.remove(&identity);
                info!(%identity, "Target gone for the stability window, removing");
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.pending_adds
            .values()
            .chain(self.pending_removals.values())
            .map(|since| *since + self.window)
            .min()
    }

    /// Identities waiting to be added or removed
    pub fn pending(&self) -> usize {
        self.pending_adds.len() + self.pending_removals.len()
    }
}
