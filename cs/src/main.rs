use std::time::Duration;

use clap::Parser;
use colored::*;
use eyre::{Context, Result};
use futures::StreamExt;
use log::info;

use coordstore::cli::{Cli, Command};
use coordstore::config::Config;
use coordstore::{CoordinationStore, EtcdStore, EventKind};

fn setup_logging() -> Result<()> {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging().context("Failed to setup logging")?;

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    if !cli.endpoints.is_empty() {
        config.endpoints = cli.endpoints.clone();
    }

    info!("coordstore starting against {:?}", config.endpoints);
    let store = EtcdStore::new(config.endpoints.clone(), config.request_timeout())?;

    match cli.command {
        Command::Get { prefix } => {
            let listing = store.get(&prefix).await?;
            if listing.entries.is_empty() {
                println!("No keys under {}", prefix);
            }
            for kv in listing.entries {
                println!("{} {} {}", kv.key.cyan(), kv.revision.to_string().dimmed(), kv.value);
            }
        }
        Command::Put { key, value, ttl } => {
            let revision = store.put(&key, &value, ttl.map(Duration::from_secs)).await?;
            println!("{} {} (revision {})", "✓".green(), key, revision);
        }
        Command::Rm { key } => {
            store.delete(&key).await?;
            println!("{} Deleted {}", "✓".green(), key);
        }
        Command::Watch { prefix } => {
            let start = store.get(&prefix).await?.revision;
            let mut events = store.watch(&prefix, start).await?;
            while let Some(event) = events.next().await {
                let event = event?;
                let kind = match event.kind {
                    EventKind::Put => "PUT".green(),
                    EventKind::Delete => "DELETE".red(),
                };
                println!(
                    "{} {} {} {}",
                    event.revision.to_string().dimmed(),
                    kind,
                    event.key.cyan(),
                    event.value.unwrap_or_default()
                );
            }
        }
    }

    Ok(())
}
