//! CLI argument parsing for coordstore

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "cs")]
#[command(author, version, about = "Inspect and edit coordination store keys", long_about = None)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// etcd endpoint (repeatable, overrides config)
    #[arg(short, long = "endpoint")]
    pub endpoints: Vec<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// List every key under a prefix
    Get {
        /// Key prefix
        #[arg(required = true)]
        prefix: String,
    },

    /// Set a key
    Put {
        /// Key
        #[arg(required = true)]
        key: String,

        /// Value
        #[arg(required = true)]
        value: String,

        /// Expire the key after this many seconds
        #[arg(short, long)]
        ttl: Option<u64>,
    },

    /// Delete a key
    Rm {
        /// Key
        #[arg(required = true)]
        key: String,
    },

    /// Print changes under a prefix until interrupted
    Watch {
        /// Key prefix
        #[arg(required = true)]
        prefix: String,
    },
}
