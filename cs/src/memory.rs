//! In-process coordination store
//!
//! Mirrors the etcd semantics the membership engine relies on: a single
//! store-wide revision, TTL expiry, a bounded change history for watches
//! and fault injection for exercising reconnect paths.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::debug;

use crate::error::StoreError;
use crate::store::{CoordinationStore, EventKind, KeyValue, Listing, WatchEvent, WatchStream, key_under};

/// Default number of events retained for watch replay
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

struct Entry {
    value: String,
    revision: u64,
    expires_at: Option<Instant>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::UnboundedSender<Result<WatchEvent, StoreError>>,
}

struct Inner {
    entries: BTreeMap<String, Entry>,
    revision: u64,
    history: VecDeque<WatchEvent>,
    history_limit: usize,
    /// Highest revision evicted from `history`
    compacted_through: u64,
    watchers: Vec<Watcher>,
    reachable: bool,
}

impl Inner {
    fn check_reachable(&self) -> Result<(), StoreError> {
        if self.reachable {
            Ok(())
        } else {
            Err(StoreError::Transport("store unreachable".to_string()))
        }
    }

    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    fn publish(&mut self, event: WatchEvent) {
        self.history.push_back(event.clone());
        while self.history.len() > self.history_limit {
            if let Some(evicted) = self.history.pop_front() {
                self.compacted_through = evicted.revision;
            }
        }
        self.watchers.retain(|w| {
            if !key_under(&event.key, &w.prefix) {
                return !w.tx.is_closed();
            }
            w.tx.send(Ok(event.clone())).is_ok()
        });
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            self.entries.remove(&key);
            let revision = self.next_revision();
            debug!(%key, revision, "MemoryStore::sweep: key expired");
            self.publish(WatchEvent {
                kind: EventKind::Delete,
                key,
                value: None,
                revision,
            });
        }
    }

    fn disconnect(&mut self) {
        for w in self.watchers.drain(..) {
            let _ = w.tx.send(Err(StoreError::Transport("watch disconnected".to_string())));
        }
    }
}

/// In-process coordination store
///
/// Cheap to clone; clones share the same state.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store with the default history limit
    pub fn new() -> Self {
        Self::with_history_limit(DEFAULT_HISTORY_LIMIT)
    }

    /// Create an empty store retaining at most `history_limit` events
    pub fn with_history_limit(history_limit: usize) -> Self {
        debug!(history_limit, "MemoryStore::with_history_limit: called");
        Self {
            inner: Arc::new(Mutex::new(Inner {
                entries: BTreeMap::new(),
                revision: 0,
                history: VecDeque::new(),
                history_limit: history_limit.max(1),
                compacted_through: 0,
                watchers: Vec::new(),
                reachable: true,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the lock leaves plain data behind; keep serving it
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Current store-wide revision
    pub fn revision(&self) -> u64 {
        self.lock().revision
    }

    /// Expire every key whose TTL has elapsed, notifying watchers
    pub fn sweep_expired(&self) {
        self.lock().sweep(Instant::now());
    }

    /// Spawn a task that expires keys every `period`
    ///
    /// The task stops once every clone of the store has been dropped.
    pub fn spawn_reaper(&self, period: Duration) -> JoinHandle<()> {
        debug!(?period, "MemoryStore::spawn_reaper: called");
        let weak: Weak<Mutex<Inner>> = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(inner) = weak.upgrade() else {
                    debug!("MemoryStore reaper: store dropped, stopping");
                    break;
                };
                let mut guard = inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                guard.sweep(Instant::now());
            }
        })
    }

    /// Make every operation fail with a transport error (or recover)
    ///
    /// Going unreachable also breaks every open watch.
    pub fn set_reachable(&self, reachable: bool) {
        debug!(reachable, "MemoryStore::set_reachable: called");
        let mut inner = self.lock();
        inner.reachable = reachable;
        if !reachable {
            inner.disconnect();
        }
    }

    /// Break every open watch with a transport error
    pub fn disconnect_watchers(&self) {
        debug!("MemoryStore::disconnect_watchers: called");
        self.lock().disconnect();
    }

    /// Number of live watch subscriptions
    pub fn watcher_count(&self) -> usize {
        let mut inner = self.lock();
        inner.watchers.retain(|w| !w.tx.is_closed());
        inner.watchers.len()
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<u64, StoreError> {
        debug!(%key, ?ttl, "MemoryStore::put: called");
        let mut inner = self.lock();
        inner.check_reachable()?;
        let now = Instant::now();
        inner.sweep(now);

        let revision = inner.next_revision();
        inner.entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                revision,
                expires_at: ttl.map(|t| now + t),
            },
        );
        inner.publish(WatchEvent {
            kind: EventKind::Put,
            key: key.to_string(),
            value: Some(value.to_string()),
            revision,
        });
        Ok(revision)
    }

    async fn refresh(&self, key: &str, ttl: Duration) -> Result<u64, StoreError> {
        debug!(%key, ?ttl, "MemoryStore::refresh: called");
        let mut inner = self.lock();
        inner.check_reachable()?;
        let now = Instant::now();
        inner.sweep(now);

        if !inner.entries.contains_key(key) {
            return Err(StoreError::KeyNotFound(key.to_string()));
        }
        let revision = inner.next_revision();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.revision = revision;
            entry.expires_at = Some(now + ttl);
        }
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        debug!(%key, "MemoryStore::delete: called");
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.sweep(Instant::now());

        if inner.entries.remove(key).is_some() {
            let revision = inner.next_revision();
            inner.publish(WatchEvent {
                kind: EventKind::Delete,
                key: key.to_string(),
                value: None,
                revision,
            });
        }
        Ok(())
    }

    async fn get(&self, prefix: &str) -> Result<Listing, StoreError> {
        debug!(%prefix, "MemoryStore::get: called");
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.sweep(Instant::now());

        let entries = inner
            .entries
            .iter()
            .filter(|(k, _)| key_under(k, prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
                revision: e.revision,
            })
            .collect();

        Ok(Listing {
            entries,
            revision: inner.revision,
        })
    }

    async fn watch(&self, prefix: &str, after_revision: u64) -> Result<WatchStream, StoreError> {
        debug!(%prefix, after_revision, "MemoryStore::watch: called");
        let mut inner = self.lock();
        inner.check_reachable()?;
        inner.sweep(Instant::now());

        if after_revision < inner.compacted_through {
            return Err(StoreError::Compacted {
                requested: after_revision,
                oldest: inner.compacted_through + 1,
            });
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        for event in inner.history.iter() {
            if event.revision > after_revision && key_under(&event.key, prefix) {
                let _ = tx.send(Ok(event.clone()));
            }
        }
        inner.watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });

        let stream = futures::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(Box::pin(stream))
    }
}
