//! Integration tests for SipDispatch
//!
//! End-to-end membership scenarios against the in-process store: workers
//! announce, crash, flap and leave while a dispatcher keeps an artifact in a
//! temp directory up to date.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use coordstore::{CoordinationStore, MemoryStore, join_key};
use sipdispatch::config::{DispatchConfig, ReloadConfig};
use sipdispatch::{
    ArtifactFormat, Dispatcher, EmptyPolicy, LeaseRegistrar, MembershipWatcher, NodeRecord, RegistrarSettings,
    Reloader, ResyncHandle, RetryPolicy, WriteError,
};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const NS: &str = "/sipdispatch/members";
const WINDOW_MS: u64 = 300;

// =============================================================================
// Helpers
// =============================================================================

#[derive(Default)]
struct CountingReloader {
    calls: AtomicUsize,
    successes: AtomicUsize,
    fail: AtomicBool,
}

#[async_trait]
impl Reloader for CountingReloader {
    async fn reload(&self) -> Result<(), WriteError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(WriteError::Reload("router unavailable".to_string()));
        }
        self.successes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "counting".to_string()
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_backoff_ms: 20,
        max_backoff_ms: 100,
        liveness_risk_after: 3,
        escalate_after: None,
    }
}

struct Harness {
    dir: TempDir,
    reloader: Arc<CountingReloader>,
    resync: ResyncHandle,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<Result<(), sipdispatch::SyncError>>,
    _reaper: JoinHandle<()>,
}

impl Harness {
    async fn start(store: MemoryStore, policy: EmptyPolicy) -> Self {
        Self::start_with(store, policy, Arc::new(CountingReloader::default())).await
    }

    async fn start_with(store: MemoryStore, policy: EmptyPolicy, reloader: Arc<CountingReloader>) -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let config = DispatchConfig {
            artifact_path: dir.path().join("dispatcher.list"),
            format: ArtifactFormat::Plain,
            empty_policy: policy,
            stability_window_ms: WINDOW_MS,
            retry: fast_retry(),
            reload: ReloadConfig::None,
            ..DispatchConfig::default()
        };
        let reaper = store.spawn_reaper(Duration::from_millis(50));
        let dispatcher = Dispatcher::new(Arc::new(store.clone()), NS, config, reloader.clone());
        let resync = dispatcher.resync_handle();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let task = tokio::spawn(dispatcher.run(shutdown_rx));

        Self {
            dir,
            reloader,
            resync,
            shutdown_tx,
            task,
            _reaper: reaper,
        }
    }

    fn artifact_path(&self) -> std::path::PathBuf {
        self.dir.path().join("dispatcher.list")
    }

    fn artifact(&self) -> Option<String> {
        read_artifact(&self.artifact_path())
    }

    fn reloads(&self) -> usize {
        self.reloader.calls.load(Ordering::SeqCst)
    }

    async fn wait_for_artifact(&self, expected: &str) {
        let path = self.artifact_path();
        eventually(Duration::from_secs(10), || read_artifact(&path).as_deref() == Some(expected)).await;
    }

    /// The artifact is renamed into place before the reload runs, so wait
    /// for the counter rather than reading it right after the file appears
    async fn wait_for_reloads(&self, expected: usize) {
        let reloader = self.reloader.clone();
        eventually(Duration::from_secs(10), move || reloader.calls.load(Ordering::SeqCst) == expected).await;
    }

    async fn stop(self) {
        self.shutdown_tx.send(()).await.expect("Dispatcher already gone");
        let result = tokio::time::timeout(Duration::from_secs(5), self.task)
            .await
            .expect("Dispatcher did not stop")
            .expect("Dispatcher panicked");
        assert!(result.is_ok());
    }
}

fn read_artifact(path: &Path) -> Option<String> {
    std::fs::read_to_string(path).ok()
}

async fn eventually(timeout: Duration, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "Condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Put a record with a TTL and never renew it (a worker that crashes right away)
async fn announce_once(store: &MemoryStore, identity: &str, endpoint: &str, ttl: Duration) {
    let value = NodeRecord::new(identity, endpoint, ttl).to_value().unwrap();
    store.put(&join_key(NS, identity), &value, Some(ttl)).await.unwrap();
}

fn registrar_settings() -> RegistrarSettings {
    RegistrarSettings {
        ttl: Duration::from_secs(2),
        renew_interval: Duration::from_millis(400),
        max_renew_attempts: 2,
        shutdown_timeout: Duration::from_secs(1),
        retry: fast_retry(),
    }
}

// =============================================================================
// Dispatcher Scenarios
// =============================================================================

#[tokio::test]
async fn test_registration_appears_in_artifact() {
    let store = MemoryStore::new();
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;

    let handle = LeaseRegistrar::new(Arc::new(store.clone()), NS, registrar_settings())
        .start("w1", "10.0.0.5:5060")
        .await
        .expect("Failed to register");

    harness.wait_for_artifact("10.0.0.5:5060\n").await;
    harness.wait_for_reloads(1).await;

    handle.shutdown().await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_targets_sorted_regardless_of_registration_order() {
    let store = MemoryStore::new();
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;

    let w2 = LeaseRegistrar::new(Arc::new(store.clone()), NS, registrar_settings())
        .start("w2", "10.0.0.6:5060")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let w1 = LeaseRegistrar::new(Arc::new(store.clone()), NS, registrar_settings())
        .start("w1", "10.0.0.5:5060")
        .await
        .unwrap();

    harness.wait_for_artifact("10.0.0.5:5060\n10.0.0.6:5060\n").await;

    w1.shutdown().await.unwrap();
    w2.shutdown().await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_crashed_worker_expires_from_artifact() {
    let store = MemoryStore::new();
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;

    let w2 = LeaseRegistrar::new(Arc::new(store.clone()), NS, registrar_settings())
        .start("w2", "10.0.0.6:5060")
        .await
        .unwrap();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(1)).await;
    harness.wait_for_artifact("10.0.0.5:5060\n10.0.0.6:5060\n").await;

    // w1 never renews; its lease lapses and it leaves the artifact
    harness.wait_for_artifact("10.0.0.6:5060\n").await;
    assert!(store.get(NS).await.unwrap().entries.iter().all(|kv| !kv.key.ends_with("/w1")));

    w2.shutdown().await.unwrap();
    harness.stop().await;
}

#[tokio::test]
async fn test_keep_last_survives_total_outage() {
    let store = MemoryStore::new();
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;

    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(1)).await;
    harness.wait_for_artifact("10.0.0.5:5060\n").await;

    // Lease expires and the removal matures, but the last artifact stays
    let store_view = store.clone();
    eventually(Duration::from_secs(5), move || store_view.revision() >= 2).await;
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 3)).await;

    assert_eq!(harness.artifact().as_deref(), Some("10.0.0.5:5060\n"));
    assert_eq!(harness.reloads(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_write_empty_policy_empties_artifact() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(1)).await;
    let harness = Harness::start(store.clone(), EmptyPolicy::WriteEmpty).await;

    harness.wait_for_artifact("10.0.0.5:5060\n").await;
    harness.wait_for_artifact("").await;
    harness.wait_for_reloads(2).await;

    harness.stop().await;
}

#[tokio::test]
async fn test_flap_inside_window_never_reaches_artifact() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;
    harness.wait_for_artifact("10.0.0.5:5060\n").await;

    // w3 appears and disappears well inside the stability window
    announce_once(&store, "w3", "10.0.0.7:5060", Duration::from_secs(30)).await;
    tokio::time::sleep(Duration::from_millis(WINDOW_MS / 4)).await;
    store.delete(&join_key(NS, "w3")).await.unwrap();

    let path = harness.artifact_path();
    let deadline = tokio::time::Instant::now() + Duration::from_millis(WINDOW_MS * 4);
    while tokio::time::Instant::now() < deadline {
        let content = read_artifact(&path).unwrap_or_default();
        assert!(!content.contains("10.0.0.7"), "Flapping worker reached the artifact");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(harness.reloads(), 1);

    harness.stop().await;
}

#[tokio::test]
async fn test_identical_rewrite_does_not_reload() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;
    harness.wait_for_artifact("10.0.0.5:5060\n").await;

    // Same worker re-announces with the same endpoint
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 2)).await;

    assert_eq!(harness.reloads(), 1);
    harness.stop().await;
}

#[tokio::test]
async fn test_forced_resync_rewrites_and_reloads() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;
    let harness = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;
    harness.wait_for_artifact("10.0.0.5:5060\n").await;

    harness.wait_for_reloads(1).await;
    harness.resync.force_resync();
    harness.wait_for_reloads(2).await;
    assert_eq!(harness.artifact().as_deref(), Some("10.0.0.5:5060\n"));

    harness.stop().await;
}

#[tokio::test]
async fn test_failed_reload_retried_without_membership_change() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;
    let reloader = Arc::new(CountingReloader::default());
    reloader.fail.store(true, Ordering::SeqCst);
    let harness = Harness::start_with(store.clone(), EmptyPolicy::KeepLast, reloader.clone()).await;

    harness.wait_for_artifact("10.0.0.5:5060\n").await;
    let view = reloader.clone();
    eventually(Duration::from_secs(5), move || view.calls.load(Ordering::SeqCst) >= 2).await;
    assert_eq!(reloader.successes.load(Ordering::SeqCst), 0);

    // Router comes back; the pending reload goes through with no store activity
    reloader.fail.store(false, Ordering::SeqCst);
    let view = reloader.clone();
    eventually(Duration::from_secs(5), move || view.successes.load(Ordering::SeqCst) == 1).await;

    // Nothing left to do once the router has the artifact
    let calls = reloader.calls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 2)).await;
    assert_eq!(reloader.calls.load(Ordering::SeqCst), calls);
    assert_eq!(harness.artifact().as_deref(), Some("10.0.0.5:5060\n"));

    harness.stop().await;
}

#[tokio::test]
async fn test_restart_with_existing_artifact_does_not_reload() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;

    let first = Harness::start(store.clone(), EmptyPolicy::KeepLast).await;
    first.wait_for_artifact("10.0.0.5:5060\n").await;
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("dispatcher.list");
    std::fs::copy(first.artifact_path(), &path).unwrap();
    first.stop().await;

    let reloader = Arc::new(CountingReloader::default());
    let config = DispatchConfig {
        artifact_path: path.clone(),
        format: ArtifactFormat::Plain,
        stability_window_ms: WINDOW_MS,
        reload: ReloadConfig::None,
        ..DispatchConfig::default()
    };
    let dispatcher = Dispatcher::new(Arc::new(store.clone()), NS, config, reloader.clone());
    let (tx, rx) = mpsc::channel(1);
    let task = tokio::spawn(dispatcher.run(rx));

    tokio::time::sleep(Duration::from_millis(WINDOW_MS * 2)).await;
    assert_eq!(reloader.calls.load(Ordering::SeqCst), 0);
    assert_eq!(read_artifact(&path).as_deref(), Some("10.0.0.5:5060\n"));

    tx.send(()).await.unwrap();
    task.await.unwrap().unwrap();
}

// =============================================================================
// Watcher and Store Scenarios
// =============================================================================

#[tokio::test]
async fn test_disconnect_mid_watch_resyncs_to_store() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(30)).await;

    let watcher = MembershipWatcher::new(Arc::new(store.clone()), NS, fast_retry());
    let (mut rx, _task) = watcher.subscribe();
    rx.wait_for(|s| s.contains("w1")).await.unwrap();

    // Break the watch, then change membership behind its back
    store.disconnect_watchers();
    store.delete(&join_key(NS, "w1")).await.unwrap();
    announce_once(&store, "w2", "10.0.0.6:5060", Duration::from_secs(30)).await;

    let snapshot = tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.contains("w2") && !s.contains("w1")),
    )
    .await
    .expect("Watcher did not resync")
    .unwrap()
    .clone();

    let listing = store.get(NS).await.unwrap();
    let listed: Vec<NodeRecord> = listing
        .entries
        .iter()
        .map(|kv| NodeRecord::from_value(&kv.key, &kv.value).unwrap())
        .collect();
    let seen: Vec<NodeRecord> = snapshot.records.values().cloned().collect();
    assert_eq!(seen, listed);
}

#[tokio::test(start_paused = true)]
async fn test_unrenewed_lease_absent_from_next_listing() {
    let store = MemoryStore::new();
    announce_once(&store, "w1", "10.0.0.5:5060", Duration::from_secs(10)).await;
    assert_eq!(store.get(NS).await.unwrap().entries.len(), 1);

    tokio::time::advance(Duration::from_secs(11)).await;
    assert!(store.get(NS).await.unwrap().entries.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_renewed_lease_outlives_ttl() {
    let store = MemoryStore::new();
    let handle = LeaseRegistrar::new(Arc::new(store.clone()), NS, registrar_settings())
        .start("w1", "10.0.0.5:5060")
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(store.get(NS).await.unwrap().entries.len(), 1);

    handle.shutdown().await.unwrap();
    assert!(store.get(NS).await.unwrap().entries.is_empty());
}
