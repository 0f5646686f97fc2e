//! MembershipSnapshot - the dispatcher's local view of who is announced

use std::collections::BTreeMap;

use crate::domain::NodeRecord;

/// A change derived from the store, applied in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChangeEvent {
    Added(NodeRecord),
    Updated(NodeRecord),
    Removed(String),
    /// Full re-list; replaces every record
    Resynced(Vec<NodeRecord>),
}

impl MembershipChangeEvent {
    /// Identity the event touches (None for a resync)
    pub fn identity(&self) -> Option<&str> {
        match self {
            MembershipChangeEvent::Added(r) | MembershipChangeEvent::Updated(r) => Some(&r.identity),
            MembershipChangeEvent::Removed(identity) => Some(identity),
            MembershipChangeEvent::Resynced(_) => None,
        }
    }
}

/// Records keyed by identity plus the version and store revision they reflect
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipSnapshot {
    pub records: BTreeMap<String, NodeRecord>,
    /// Bumped once per applied change event
    pub version: u64,
    /// Highest store revision folded in
    pub revision: u64,
}

impl MembershipSnapshot {
    /// Apply one change event and bump the version
    pub fn apply(&mut self, event: MembershipChangeEvent) {
        match event {
            MembershipChangeEvent::Added(record) | MembershipChangeEvent::Updated(record) => {
                self.records.insert(record.identity.clone(), record);
            }
            MembershipChangeEvent::Removed(identity) => {
                self.records.remove(&identity);
            }
            MembershipChangeEvent::Resynced(records) => {
                self.records = records.into_iter().map(|r| (r.identity.clone(), r)).collect();
            }
        }
        self.version += 1;
    }

    /// Fold in an observed store revision
    pub fn observe_revision(&mut self, revision: u64) {
        self.revision = self.revision.max(revision);
    }

    pub fn contains(&self, identity: &str) -> bool {
        self.records.contains_key(identity)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
