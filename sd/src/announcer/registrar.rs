//! LeaseRegistrar - keeps this worker's lease alive in the coordination store

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use coordstore::{CoordinationStore, StoreError, join_key};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::domain::NodeRecord;
use crate::error::SyncError;
use crate::retry::RetryPolicy;

/// Lease timing and retry settings
#[derive(Debug, Clone)]
pub struct RegistrarSettings {
    pub ttl: Duration,
    pub renew_interval: Duration,
    /// Attempts per renewal cycle
    pub max_renew_attempts: u32,
    /// Bound on the best-effort delete at shutdown
    pub shutdown_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RegistrarSettings {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            max_renew_attempts: 3,
            shutdown_timeout: Duration::from_secs(2),
            retry: RetryPolicy::default(),
        }
    }
}

/// Point-in-time renewal counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistrarStats {
    pub renewals: u64,
    pub reregistrations: u64,
    pub failed_cycles: u64,
    pub consecutive_failures: u32,
}

#[derive(Default)]
struct Counters {
    renewals: AtomicU64,
    reregistrations: AtomicU64,
    failed_cycles: AtomicU64,
    consecutive_failures: AtomicU32,
}

impl Counters {
    fn snapshot(&self) -> RegistrarStats {
        RegistrarStats {
            renewals: self.renewals.load(Ordering::Relaxed),
            reregistrations: self.reregistrations.load(Ordering::Relaxed),
            failed_cycles: self.failed_cycles.load(Ordering::Relaxed),
            consecutive_failures: self.consecutive_failures.load(Ordering::Relaxed),
        }
    }
}

/// Registers a NodeRecord under `<namespace>/<identity>` and renews its lease
pub struct LeaseRegistrar {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    settings: RegistrarSettings,
}

impl LeaseRegistrar {
    pub fn new(store: Arc<dyn CoordinationStore>, namespace: impl Into<String>, settings: RegistrarSettings) -> Self {
        let namespace = namespace.into();
        debug!(%namespace, ?settings, "LeaseRegistrar::new: called");
        Self {
            store,
            namespace,
            settings,
        }
    }

    /// Register `identity` at `endpoint` and spawn the renewal task
    ///
    /// The initial write is retried within one cycle's budget; if it still
    /// fails the error is returned and nothing is spawned.
    pub async fn start(self, identity: &str, endpoint: &str) -> Result<RegistrarHandle, SyncError> {
        debug!(%identity, %endpoint, "LeaseRegistrar::start: called");
        if self.settings.renew_interval.is_zero() || self.settings.renew_interval >= self.settings.ttl {
            return Err(SyncError::Config(format!(
                "renew interval {:?} must be non-zero and shorter than ttl {:?}",
                self.settings.renew_interval, self.settings.ttl
            )));
        }
        if self.settings.renew_interval * 3 > self.settings.ttl {
            warn!(
                renew_interval = ?self.settings.renew_interval,
                ttl = ?self.settings.ttl,
                "Renew interval is longer than ttl/3; one missed renewal may expire the lease"
            );
        }

        let record = NodeRecord::new(identity, endpoint, self.settings.ttl);
        record.validate()?;
        let key = join_key(&self.namespace, identity);
        let value = record.to_value()?;

        let counters = Arc::new(Counters::default());
        let registration = Registration {
            store: self.store,
            settings: self.settings,
            key: key.clone(),
            value,
            counters: counters.clone(),
        };

        registration.register().await?;
        info!(%identity, %endpoint, %key, ttl = ?registration.settings.ttl, "Registered worker lease");

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let join = tokio::spawn(registration.run(shutdown_rx));

        Ok(RegistrarHandle {
            identity: identity.to_string(),
            key,
            shutdown_tx,
            join,
            counters,
        })
    }
}

/// Handle to a running renewal task
pub struct RegistrarHandle {
    identity: String,
    key: String,
    shutdown_tx: mpsc::Sender<()>,
    join: JoinHandle<Result<(), SyncError>>,
    counters: Arc<Counters>,
}

impl RegistrarHandle {
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Store key holding this worker's record
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Renewal counters so far
    pub fn status(&self) -> RegistrarStats {
        self.counters.snapshot()
    }

    /// Sender that stops the renewal loop (and deletes the record) when signalled
    pub fn shutdown_sender(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Stop renewing and delete the record (best effort, bounded)
    pub async fn shutdown(self) -> Result<(), SyncError> {
        debug!(identity = %self.identity, "RegistrarHandle::shutdown: called");
        let _ = self.shutdown_tx.send(()).await;
        self.join().await
    }

    /// Wait for the renewal task to finish
    ///
    /// Returns an error only if renewal gave up or the task panicked.
    pub async fn join(self) -> Result<(), SyncError> {
        match self.join.await {
            Ok(result) => result,
            Err(e) => Err(SyncError::TransportExhausted {
                role: "announcer",
                attempts: 0,
                last_error: format!("renewal task aborted: {}", e),
            }),
        }
    }
}

/// State owned by the renewal task
struct Registration {
    store: Arc<dyn CoordinationStore>,
    settings: RegistrarSettings,
    key: String,
    value: String,
    counters: Arc<Counters>,
}

impl Registration {
    async fn register(&self) -> Result<(), SyncError> {
        debug!(key = %self.key, "Registration::register: called");
        let mut attempt = 1;
        loop {
            match self.store.put(&self.key, &self.value, Some(self.settings.ttl)).await {
                Ok(revision) => {
                    debug!(revision, "Registration::register: written");
                    return Ok(());
                }
                Err(e) if attempt < self.settings.max_renew_attempts => {
                    warn!(attempt, error = %e, "Initial registration failed, retrying");
                    tokio::time::sleep(self.settings.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(SyncError::Transport(e)),
            }
        }
    }

    /// Refresh the lease, re-writing the record if it already lapsed
    async fn renew_once(&self) -> Result<(), StoreError> {
        match self.store.refresh(&self.key, self.settings.ttl).await {
            Ok(revision) => {
                debug!(key = %self.key, revision, "Registration::renew_once: lease refreshed");
                Ok(())
            }
            Err(StoreError::KeyNotFound(_)) => {
                warn!(key = %self.key, "Lease lapsed before renewal, re-registering");
                self.store.put(&self.key, &self.value, Some(self.settings.ttl)).await?;
                self.counters.reregistrations.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// One renewal cycle: bounded attempts with backoff
    async fn renew_cycle(&self) -> Result<(), StoreError> {
        let attempts = self.settings.max_renew_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.renew_once().await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < attempts => {
                    debug!(attempt, error = %e, "Registration::renew_cycle: attempt failed");
                    tokio::time::sleep(self.settings.retry.delay(attempt)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn deregister(&self) {
        debug!(key = %self.key, "Registration::deregister: called");
        match tokio::time::timeout(self.settings.shutdown_timeout, self.store.delete(&self.key)).await {
            Ok(Ok(())) => info!(key = %self.key, "Deregistered worker lease"),
            Ok(Err(e)) => warn!(key = %self.key, error = %e, "Failed to delete lease; it will expire on its own"),
            Err(_) => warn!(
                key = %self.key,
                timeout = ?self.settings.shutdown_timeout,
                "Timed out deleting lease; it will expire on its own"
            ),
        }
    }

    async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), SyncError> {
        info!(
            key = %self.key,
            renew_interval = ?self.settings.renew_interval,
            "Lease renewal started"
        );
        let interval = self.settings.renew_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {}
            }

            let outcome = tokio::select! {
                res = self.renew_cycle() => res,
                _ = shutdown_rx.recv() => break,
            };

            match outcome {
                Ok(()) => {
                    let previous = self.counters.consecutive_failures.swap(0, Ordering::Relaxed);
                    self.counters.renewals.fetch_add(1, Ordering::Relaxed);
                    if previous > 0 {
                        info!(key = %self.key, failed_cycles = previous, "Lease renewal recovered");
                    }
                }
                Err(e) => {
                    let failures = self.counters.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    self.counters.failed_cycles.fetch_add(1, Ordering::Relaxed);

                    if self.settings.retry.is_exhausted(failures) {
                        error!(key = %self.key, failures, error = %e, "Lease renewal exhausted its retry budget");
                        return Err(SyncError::TransportExhausted {
                            role: "announcer",
                            attempts: failures,
                            last_error: e.to_string(),
                        });
                    }
                    // Every attempt in the cycle failed; the lease is now running down
                    warn!(
                        condition = "liveness_risk",
                        key = %self.key,
                        failures,
                        error = %e,
                        "Lease renewal cycle failed; this worker may expire from the alive-set"
                    );
                }
            }
        }

        self.deregister().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coordstore::MemoryStore;

    const NS: &str = "/test/members";

    fn settings() -> RegistrarSettings {
        RegistrarSettings {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(3),
            max_renew_attempts: 2,
            shutdown_timeout: Duration::from_secs(1),
            retry: RetryPolicy {
                initial_backoff_ms: 100,
                max_backoff_ms: 200,
                liveness_risk_after: 2,
                escalate_after: Some(3),
            },
        }
    }

    fn registrar(store: &MemoryStore) -> LeaseRegistrar {
        LeaseRegistrar::new(Arc::new(store.clone()), NS, settings())
    }

    async fn endpoints(store: &MemoryStore) -> Vec<String> {
        store
            .get(NS)
            .await
            .unwrap()
            .entries
            .iter()
            .map(|kv| NodeRecord::from_value(&kv.key, &kv.value).unwrap().endpoint)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_registers_record() {
        let store = MemoryStore::new();
        let handle = registrar(&store).start("w1", "10.0.0.5:5060").await.unwrap();

        assert_eq!(handle.key(), "/test/members/w1");
        assert_eq!(endpoints(&store).await, vec!["10.0.0.5:5060"]);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_keeps_record_past_ttl() {
        let store = MemoryStore::new();
        let handle = registrar(&store).start("w1", "10.0.0.5:5060").await.unwrap();

        tokio::time::sleep(Duration::from_secs(35)).await;

        assert_eq!(endpoints(&store).await, vec!["10.0.0.5:5060"]);
        assert!(handle.status().renewals >= 10);
        assert_eq!(handle.status().consecutive_failures, 0);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_deletes_record() {
        let store = MemoryStore::new();
        let handle = registrar(&store).start("w1", "10.0.0.5:5060").await.unwrap();

        handle.shutdown().await.unwrap();
        assert!(endpoints(&store).await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reregisters_after_lapse() {
        let store = MemoryStore::new();
        let handle = registrar(&store).start("w1", "10.0.0.5:5060").await.unwrap();

        // Someone removes the key behind our back
        store.delete("/test/members/w1").await.unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(endpoints(&store).await, vec!["10.0.0.5:5060"]);
        assert_eq!(handle.status().reregistrations, 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_is_not_fatal() {
        let store = MemoryStore::new();
        let handle = registrar(&store).start("w1", "10.0.0.5:5060").await.unwrap();

        store.set_reachable(false);
        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(handle.status().consecutive_failures, 1);

        store.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(3)).await;
        let stats = handle.status();
        assert_eq!(stats.consecutive_failures, 0);
        assert_eq!(stats.failed_cycles, 1);

        handle.shutdown().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_budget_escalates() {
        let store = MemoryStore::new();
        let handle = registrar(&store).start("w1", "10.0.0.5:5060").await.unwrap();

        store.set_reachable(false);
        let err = handle.join().await.unwrap_err();
        match err {
            SyncError::TransportExhausted { role, attempts, .. } => {
                assert_eq!(role, "announcer");
                assert_eq!(attempts, 3);
            }
            other => panic!("Expected TransportExhausted, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_fails_when_store_down() {
        let store = MemoryStore::new();
        store.set_reachable(false);

        let result = registrar(&store).start("w1", "10.0.0.5:5060").await;
        assert!(matches!(result, Err(SyncError::Transport(_))));
    }

    #[tokio::test]
    async fn test_rejects_renew_not_shorter_than_ttl() {
        let store = MemoryStore::new();
        let bad = RegistrarSettings {
            renew_interval: Duration::from_secs(10),
            ..settings()
        };
        let result = LeaseRegistrar::new(Arc::new(store), NS, bad).start("w1", "10.0.0.5:5060").await;
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[tokio::test]
    async fn test_rejects_invalid_endpoint() {
        let store = MemoryStore::new();
        let result = registrar(&store).start("w1", "not-an-endpoint").await;
        assert!(result.is_err());
    }
}
