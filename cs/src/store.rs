//! CoordinationStore trait and wire-neutral types

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

/// A key with its current value and the revision that last modified it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
    pub revision: u64,
}

/// Result of a recursive listing
///
/// `revision` is the store-wide revision the listing is consistent with;
/// a watch started after it observes every later change.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Listing {
    pub entries: Vec<KeyValue>,
    pub revision: u64,
}

/// Kind of change reported by a watch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Put,
    Delete,
}

/// One change notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    pub key: String,
    /// Present for puts; deletes and expiries carry no value
    pub value: Option<String>,
    pub revision: u64,
}

/// Stream of change notifications
///
/// Ends with an `Err` when the underlying transport breaks; callers
/// re-subscribe (and re-list on [`StoreError::Compacted`]).
pub type WatchStream = BoxStream<'static, Result<WatchEvent, StoreError>>;

/// Minimal capability set consumed from a coordination store
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Create or overwrite `key`, expiring after `ttl` when given
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError>;

    /// Extend the TTL of an existing key without touching its value
    ///
    /// Watchers are not notified. Fails with [`StoreError::KeyNotFound`] if the
    /// key has already expired or was deleted.
    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError>;

    /// Delete `key`; deleting a missing key succeeds
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// List every key under `prefix`
    async fn get(&self, prefix: &str) -> Result<Listing, StoreError>;

    /// Watch every key under `prefix` for changes after `after_revision`
    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<WatchStream, StoreError>;
}

/// Join a namespace prefix and a leaf name into a store key
pub fn join_key(prefix: &str, name: &str) -> String {
    format!("{}/{}", prefix.trim_end_matches('/'), name.trim_start_matches('/'))
}

/// Check whether `key` lives strictly under `prefix`
pub(crate) fn key_under(key: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    key.len() > prefix.len() && key.starts_with(prefix) && key.as_bytes()[prefix.len()] == b'/'
}
