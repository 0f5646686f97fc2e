//! Announcer role - registers this worker and keeps its lease alive

mod registrar;

use std::sync::Arc;

use coordstore::CoordinationStore;
use tokio::sync::mpsc;
use tracing::{debug, info};

pub use registrar::{LeaseRegistrar, RegistrarHandle, RegistrarSettings, RegistrarStats};

use crate::config::AnnounceConfig;
use crate::error::SyncError;

impl From<&AnnounceConfig> for RegistrarSettings {
    fn from(config: &AnnounceConfig) -> Self {
        Self {
            ttl: config.ttl(),
            renew_interval: config.renew_interval(),
            max_renew_attempts: config.max_renew_attempts,
            shutdown_timeout: config.shutdown_timeout(),
            retry: config.retry.clone(),
        }
    }
}

/// Runs a LeaseRegistrar for the lifetime of the process
pub struct Announcer {
    store: Arc<dyn CoordinationStore>,
    namespace: String,
    identity: String,
    endpoint: String,
    settings: RegistrarSettings,
}

impl Announcer {
    pub fn new(
        store: Arc<dyn CoordinationStore>,
        namespace: impl Into<String>,
        identity: impl Into<String>,
        endpoint: impl Into<String>,
        config: &AnnounceConfig,
    ) -> Self {
        let identity = identity.into();
        let endpoint = endpoint.into();
        debug!(%identity, %endpoint, "Announcer::new: called");
        Self {
            store,
            namespace: namespace.into(),
            identity,
            endpoint,
            settings: config.into(),
        }
    }

    /// Register, renew until `shutdown_rx` fires, then delete the record
    ///
    /// Returns an error if the initial registration fails or renewal
    /// exhausts its retry budget.
    pub async fn run(self, mut shutdown_rx: mpsc::Receiver<()>) -> Result<(), SyncError> {
        let registrar = LeaseRegistrar::new(self.store, self.namespace, self.settings);
        let handle = registrar.start(&self.identity, &self.endpoint).await?;
        info!(identity = %handle.identity(), key = %handle.key(), "Announcer running");

        let stop = handle.shutdown_sender();
        let forward = tokio::spawn(async move {
            let _ = shutdown_rx.recv().await;
            debug!("Announcer: shutdown requested");
            let _ = stop.send(()).await;
        });

        let result = handle.join().await;
        forward.abort();
        match &result {
            Ok(()) => info!(identity = %self.identity, "Announcer stopped"),
            Err(e) => debug!(error = %e, "Announcer: registrar ended with error"),
        }
        result
    }
}
