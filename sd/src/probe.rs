//! ConnectivityProbe - fail fast when the coordination store is unreachable

use std::time::Duration;

use coordstore::CoordinationStore;
use tracing::{debug, info, warn};

use crate::error::SyncError;

/// Perform one bounded round-trip against the store
///
/// Reads `key` (a missing key is fine) and returns [`SyncError::Unreachable`]
/// if the read fails or does not finish within `timeout`. Retry policy lives
/// with the caller.
pub async fn probe(store: &dyn CoordinationStore, key: &str, timeout: Duration) -> Result<(), SyncError> {
    debug!(%key, ?timeout, "probe: called");
    match tokio::time::timeout(timeout, store.get(key)).await {
        Ok(Ok(listing)) => {
            debug!(revision = listing.revision, entries = listing.entries.len(), "probe: store reachable");
            Ok(())
        }
        Ok(Err(e)) => Err(SyncError::Unreachable {
            timeout,
            reason: e.to_string(),
        }),
        Err(_) => Err(SyncError::Unreachable {
            timeout,
            reason: "probe timed out".to_string(),
        }),
    }
}

/// Probe up to `attempts` times, sleeping `delay` between failures
pub async fn probe_with_retries(
    store: &dyn CoordinationStore,
    key: &str,
    timeout: Duration,
    attempts: u32,
    delay: Duration,
) -> Result<(), SyncError> {
    debug!(%key, attempts, ?delay, "probe_with_retries: called");
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match probe(store, key, timeout).await {
            Ok(()) => {
                info!(attempt, "Coordination store is reachable");
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, attempts, error = %e, "Coordination store probe failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
