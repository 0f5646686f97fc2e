//! CoordStore - minimal key/lease/watch client for coordination stores
//!
//! Exposes the small capability set a membership engine needs from a
//! strongly-consistent key/value service: TTL-bound puts, lease refresh,
//! deletes, recursive listing and change watches.
//!
//! # Backends
//!
//! - [`EtcdStore`] - etcd v2 keys API over HTTP
//! - [`MemoryStore`] - in-process store with the same semantics, used by tests
//!   and local runs
//!
//! # Example
//!
//! ```ignore
//! use coordstore::{CoordinationStore, EtcdStore};
//!
//! let store = EtcdStore::new(vec!["http://127.0.0.1:2379".into()], timeout)?;
//! store.put("/sipdispatch/members/w1", "{...}", Some(ttl)).await?;
//! let listing = store.get("/sipdispatch/members").await?;
//! let mut events = store.watch("/sipdispatch/members", listing.revision).await?;
//! ```

pub mod cli;
pub mod config;
mod error;
mod etcd;
mod memory;
mod store;

pub use error::StoreError;
pub use etcd::EtcdStore;
pub use memory::MemoryStore;
pub use store::{CoordinationStore, EventKind, KeyValue, Listing, WatchEvent, WatchStream, join_key};

/// Default etcd client endpoint
pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:2379";

/// Default per-request timeout (ms) for non-watch requests
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;
