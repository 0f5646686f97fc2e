//! Error types for the membership engine

use std::path::PathBuf;
use std::time::Duration;

use coordstore::StoreError;
use thiserror::Error;

/// Errors raised by the announcer and dispatcher roles
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Coordination store unreachable after {timeout:?}: {reason}")]
    Unreachable { timeout: Duration, reason: String },

    #[error("Coordination store transport error: {0}")]
    Transport(#[from] StoreError),

    #[error("{role} gave up after {attempts} consecutive failures: {last_error}")]
    TransportExhausted {
        role: &'static str,
        attempts: u32,
        last_error: String,
    },

    #[error("Artifact write failed: {0}")]
    Write(#[from] WriteError),

    #[error("Invalid record at {key}: {reason}")]
    InvalidRecord { key: String, reason: String },

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl SyncError {
    /// Fatal errors must stop the process; everything else is retried
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Unreachable { .. } | SyncError::TransportExhausted { .. } | SyncError::Config(_)
        )
    }
}

/// Errors writing the router artifact or triggering its reload
#[derive(Debug, Error)]
pub enum WriteError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to replace {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Reload hook failed: {0}")]
    Reload(String),
}
