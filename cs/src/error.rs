//! Coordination store error types

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur talking to a coordination store
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Key not found: {0}")]
    KeyNotFound(String),

    #[error("Watch history compacted, revision {requested} is older than {oldest}")]
    Compacted { requested: u64, oldest: u64 },

    #[error("Store error {code}: {message}")]
    Api { code: u32, message: String },

    #[error("Failed to decode store response: {0}")]
    Decode(String),

    #[error("Watch closed")]
    Closed,
}

impl StoreError {
    /// Check if this error is worth retrying against the same store
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Transport(_) => true,
            StoreError::Timeout(_) => true,
            StoreError::Closed => true,
            StoreError::Api { code, .. } => *code >= 300,
            StoreError::KeyNotFound(_) => false,
            StoreError::Compacted { .. } => false,
            StoreError::Decode(_) => false,
        }
    }

    /// Check if a watch must be rebuilt from a full listing
    pub fn needs_relist(&self) -> bool {
        matches!(self, StoreError::Compacted { .. })
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            StoreError::Decode(err.to_string())
        } else {
            StoreError::Transport(err.to_string())
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Decode(err.to_string())
    }
}
