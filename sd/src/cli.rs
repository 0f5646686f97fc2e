//! CLI command definitions and subcommands

use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::dispatcher::{ArtifactFormat, EmptyPolicy};

/// SipDispatch - worker announcer and dispatcher-list sync for Kamailio
#[derive(Parser)]
#[command(
    name = "sd",
    about = "Keep Kamailio's dispatcher list in sync with worker leases in etcd",
    version = env!("GIT_DESCRIBE"),
    after_help = "Config is read from --config, ./.sipdispatch.yml or ~/.config/sipdispatch/sipdispatch.yml"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// etcd endpoint; repeat for several (overrides store.endpoints)
    #[arg(short = 'e', long = "etcd", global = true, value_name = "URL")]
    pub etcd: Vec<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Subcommand)]
pub enum Command {
    /// Register this worker and keep its lease alive
    Announce {
        /// Worker identity (generated when not set)
        #[arg(short, long)]
        identity: Option<String>,

        /// Routable host:port of this worker
        #[arg(long, value_name = "HOST:PORT")]
        endpoint: Option<String>,

        /// Lease TTL in seconds
        #[arg(long, value_name = "SECS")]
        ttl: Option<u64>,

        /// Renewal interval in seconds
        #[arg(long, value_name = "SECS")]
        renew: Option<u64>,
    },

    /// Watch membership and keep the dispatcher artifact up to date
    Dispatch {
        /// Artifact path to write
        #[arg(short, long, value_name = "PATH")]
        artifact: Option<PathBuf>,

        /// Artifact format
        #[arg(short, long, value_enum)]
        format: Option<ArtifactFormatArg>,

        /// Stability window in milliseconds
        #[arg(long, value_name = "MS")]
        stability_ms: Option<u64>,

        /// What to do when no worker is alive
        #[arg(long, value_enum)]
        empty_policy: Option<EmptyPolicyArg>,
    },

    /// Check that the coordination store is reachable and exit
    Probe,

    /// Print the current alive-set as the dispatcher would render it
    Show {
        /// Output format
        #[arg(short, long, value_enum)]
        format: Option<ArtifactFormatArg>,
    },
}

/// Artifact format as accepted on the command line
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum ArtifactFormatArg {
    Plain,
    Kamailio,
}

impl From<ArtifactFormatArg> for ArtifactFormat {
    fn from(arg: ArtifactFormatArg) -> Self {
        match arg {
            ArtifactFormatArg::Plain => ArtifactFormat::Plain,
            ArtifactFormatArg::Kamailio => ArtifactFormat::Kamailio,
        }
    }
}

/// Empty policy as accepted on the command line
#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum EmptyPolicyArg {
    KeepLast,
    WriteEmpty,
}

impl From<EmptyPolicyArg> for EmptyPolicy {
    fn from(arg: EmptyPolicyArg) -> Self {
        match arg {
            EmptyPolicyArg::KeepLast => EmptyPolicy::KeepLast,
            EmptyPolicyArg::WriteEmpty => EmptyPolicy::WriteEmpty,
        }
    }
}
