//! SipDispatch - lease-based worker membership for a SIP load balancer
//!
//! Workers (Asterisk boxes) announce themselves in etcd under a TTL lease and
//! keep renewing it. A dispatcher next to the router (Kamailio) watches the
//! membership namespace, debounces flaps, and rewrites `dispatcher.list`
//! atomically whenever the routable set changes, then tells the router to
//! reload.
//!
//! # Core Concepts
//!
//! - **Leases, not health checks**: a worker is alive while its record exists
//! - **Re-list on every reconnect**: the local view always converges on the store
//! - **Latest value wins**: bursts of changes collapse into one write
//! - **Never truncate a good artifact**: an empty set keeps the last file by default
//!
//! # Modules
//!
//! - [`announcer`] - LeaseRegistrar and the announce role
//! - [`dispatcher`] - watcher, reducer, writer, reload hooks and the pipeline
//! - [`probe`] - startup connectivity check
//! - [`config`] - configuration types and loading
//! - [`cli`] - command-line interface

pub mod announcer;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod error;
pub mod probe;
pub mod retry;

// Re-export commonly used types
pub use announcer::{Announcer, LeaseRegistrar, RegistrarHandle, RegistrarSettings, RegistrarStats};
pub use config::{Config, LogFormat, Role};
pub use dispatcher::{
    AliveSetReducer, ArtifactFormat, ConfigWriter, Dispatcher, EmptyPolicy, MembershipChangeEvent,
    MembershipSnapshot, MembershipWatcher, Reduction, Reloader, ResyncHandle, WriteOutcome, list_alive, render,
};
pub use domain::{AliveSet, NodeRecord, Target};
pub use error::{SyncError, WriteError};
pub use probe::{probe, probe_with_retries};
pub use retry::RetryPolicy;
