//! NodeRecord - one worker's announced presence

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::SyncError;

/// A worker's lease-backed presence record, stored as JSON under
/// `<namespace>/<identity>`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRecord {
    /// Unique worker identity
    pub identity: String,

    /// Routable `host:port` the router should dispatch to
    pub endpoint: String,

    /// When the worker first registered
    #[serde(rename = "registered-at")]
    pub registered_at: DateTime<Utc>,

    /// Lease length; the store drops the record if it is not renewed in time
    #[serde(rename = "lease-ttl-secs", with = "duration_secs")]
    pub lease_ttl: Duration,
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

impl NodeRecord {
    /// Create a record registered now
    pub fn new(identity: impl Into<String>, endpoint: impl Into<String>, lease_ttl: Duration) -> Self {
        Self {
            identity: identity.into(),
            endpoint: endpoint.into(),
            registered_at: Utc::now(),
            lease_ttl,
        }
    }

    /// Check identity and endpoint are usable as a store key and a routing target
    pub fn validate(&self) -> Result<(), SyncError> {
        debug!(identity = %self.identity, endpoint = %self.endpoint, "NodeRecord::validate: called");
        validate_identity(&self.identity)?;
        validate_endpoint(&self.endpoint)?;
        Ok(())
    }

    /// Encode as the stored JSON value
    pub fn to_value(&self) -> Result<String, SyncError> {
        serde_json::to_string(self).map_err(|e| SyncError::InvalidRecord {
            key: self.identity.clone(),
            reason: e.to_string(),
        })
    }

    /// Decode a stored value, checking it belongs to `key`
    pub fn from_value(key: &str, value: &str) -> Result<Self, SyncError> {
        let record: NodeRecord = serde_json::from_str(value).map_err(|e| SyncError::InvalidRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?;

        let leaf = key.rsplit('/').next().unwrap_or_default();
        if leaf != record.identity {
            return Err(SyncError::InvalidRecord {
                key: key.to_string(),
                reason: format!("identity '{}' does not match key", record.identity),
            });
        }
        record.validate().map_err(|e| SyncError::InvalidRecord {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(record)
    }
}

/// Identity must be a non-empty single key segment
pub fn validate_identity(identity: &str) -> Result<(), SyncError> {
    if identity.trim().is_empty() {
        return Err(SyncError::Config("identity must not be empty".to_string()));
    }
    if identity.contains('/') || identity.chars().any(char::is_whitespace) {
        return Err(SyncError::Config(format!(
            "identity '{}' must not contain '/' or whitespace",
            identity
        )));
    }
    Ok(())
}

/// Endpoint must be `host:port` with a non-empty host and a numeric port
pub fn validate_endpoint(endpoint: &str) -> Result<(), SyncError> {
    let Some((host, port)) = endpoint.rsplit_once(':') else {
        return Err(SyncError::Config(format!("endpoint '{}' is not host:port", endpoint)));
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() || host.chars().any(char::is_whitespace) {
        return Err(SyncError::Config(format!("endpoint '{}' has an invalid host", endpoint)));
    }
    match port.parse::<u16>() {
        Ok(p) if p > 0 => Ok(()),
        _ => Err(SyncError::Config(format!("endpoint '{}' has an invalid port", endpoint))),
    }
}

/// Identity of the record stored under `key` (its last path segment)
pub fn identity_from_key(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}
