//! AliveSet - the routable targets derived from membership

use serde::Serialize;

/// One routable worker
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Target {
    pub identity: String,
    pub endpoint: String,
}

/// Deduplicated, identity-ordered set of routable targets
///
/// `version` is the membership snapshot version it was computed from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AliveSet {
    pub version: u64,
    targets: Vec<Target>,
}

impl AliveSet {
    /// Build from any target collection; sorts by identity and keeps one entry per identity
    pub fn new(version: u64, targets: impl IntoIterator<Item = Target>) -> Self {
        let mut targets: Vec<Target> = targets.into_iter().collect();
        targets.sort();
        targets.dedup_by(|a, b| a.identity == b.identity);
        Self { version, targets }
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// Endpoints in target order
    pub fn endpoints(&self) -> Vec<&str> {
        self.targets.iter().map(|t| t.endpoint.as_str()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }
}
