use std::sync::Arc;

use clap::Parser;
use eyre::{Context, Result, eyre};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use coordstore::{CoordinationStore, EtcdStore};
use sipdispatch::cli::{Cli, Command};
use sipdispatch::config::{Config, LogFormat, Role};
use sipdispatch::dispatcher::{self, Dispatcher, ResyncHandle};
use sipdispatch::{Announcer, SyncError, probe_with_retries, render};

fn setup_logging(level: &str, format: LogFormat) -> Result<()> {
    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }

    debug!(%level, ?format, "Logging initialized");
    Ok(())
}

/// Fold command-line overrides into the loaded config and name the role
fn apply_overrides(config: &mut Config, cli: &Cli) -> Role {
    if !cli.etcd.is_empty() {
        config.store.endpoints = cli.etcd.clone();
    }

    match &cli.command {
        Command::Announce {
            identity,
            endpoint,
            ttl,
            renew,
        } => {
            if let Some(identity) = identity {
                config.announce.identity = Some(identity.clone());
            }
            if let Some(endpoint) = endpoint {
                config.announce.endpoint = Some(endpoint.clone());
            }
            if let Some(ttl) = ttl {
                config.announce.ttl_secs = *ttl;
            }
            if let Some(renew) = renew {
                config.announce.renew_interval_secs = *renew;
            }
            Role::Announce
        }
        Command::Dispatch {
            artifact,
            format,
            stability_ms,
            empty_policy,
        } => {
            if let Some(artifact) = artifact {
                config.dispatch.artifact_path = artifact.clone();
            }
            if let Some(format) = format {
                config.dispatch.format = (*format).into();
            }
            if let Some(ms) = stability_ms {
                config.dispatch.stability_window_ms = *ms;
            }
            if let Some(policy) = empty_policy {
                config.dispatch.empty_policy = (*policy).into();
            }
            Role::Dispatch
        }
        Command::Show { format } => {
            if let Some(format) = format {
                config.dispatch.format = (*format).into();
            }
            Role::Probe
        }
        Command::Probe => Role::Probe,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let (file_level, log_format) = Config::load_log_settings(cli.config.as_ref());
    let level = cli
        .log_level
        .clone()
        .or(file_level)
        .unwrap_or_else(|| "info".to_string());
    setup_logging(&level, log_format).context("Failed to setup logging")?;

    let mut config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    let role = apply_overrides(&mut config, &cli);
    config.validate(role).context("Invalid configuration")?;

    info!(
        version = env!("GIT_DESCRIBE"),
        ?role,
        endpoints = ?config.store.endpoints,
        namespace = %config.store.namespace,
        "SipDispatch starting"
    );

    let store: Arc<dyn CoordinationStore> = Arc::new(
        EtcdStore::new(config.store.endpoints.clone(), config.store.request_timeout())
            .context("Failed to create etcd client")?,
    );

    probe_with_retries(
        store.as_ref(),
        &config.store.namespace,
        config.probe.timeout(),
        config.probe.attempts,
        config.probe.retry_delay(),
    )
    .await
    .context("Coordination store is unreachable")?;

    match cli.command {
        Command::Announce { .. } => cmd_announce(store, &config).await,
        Command::Dispatch { .. } => cmd_dispatch(store, &config).await,
        Command::Probe => {
            println!("Coordination store reachable at {}", config.store.endpoints.join(", "));
            Ok(())
        }
        Command::Show { .. } => cmd_show(store, &config).await,
    }
}

async fn cmd_announce(store: Arc<dyn CoordinationStore>, config: &Config) -> Result<()> {
    let identity = match &config.announce.identity {
        Some(identity) => identity.clone(),
        None => {
            let generated = uuid::Uuid::now_v7().to_string();
            warn!(identity = %generated, "No identity configured; using an autogenerated announce name");
            generated
        }
    };
    let endpoint = config
        .announce
        .endpoint
        .clone()
        .ok_or_else(|| eyre!("announce.endpoint is required"))?;

    let announcer = Announcer::new(store, &config.store.namespace, identity, endpoint, &config.announce);
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(announcer.run(shutdown_rx));
    info!("Announcer running. Press Ctrl+C to stop.");

    supervise(task, shutdown_tx, None).await
}

async fn cmd_dispatch(store: Arc<dyn CoordinationStore>, config: &Config) -> Result<()> {
    let reloader = dispatcher::reload::from_config(&config.dispatch.reload).context("Invalid reload hook")?;
    let dispatcher = Dispatcher::new(store, &config.store.namespace, config.dispatch.clone(), reloader);
    let resync = dispatcher.resync_handle();

    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let task = tokio::spawn(dispatcher.run(shutdown_rx));
    info!("Dispatcher running. Press Ctrl+C to stop, SIGHUP to resync.");

    supervise(task, shutdown_tx, Some(resync)).await
}

async fn cmd_show(store: Arc<dyn CoordinationStore>, config: &Config) -> Result<()> {
    let alive = dispatcher::list_alive(store.as_ref(), &config.store.namespace)
        .await
        .context("Failed to list membership")?;
    info!(targets = alive.len(), "Listed alive-set");
    print!("{}", render(&alive, config.dispatch.format, config.dispatch.set_id));
    Ok(())
}

/// Wait for a shutdown signal or for the role task to end on its own
async fn supervise(
    mut task: JoinHandle<Result<(), SyncError>>,
    shutdown_tx: mpsc::Sender<()>,
    resync: Option<ResyncHandle>,
) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sighup = signal(SignalKind::hangup())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        loop {
            tokio::select! {
                res = &mut task => return finish(res),
                _ = sighup.recv() => {
                    match &resync {
                        Some(handle) => {
                            info!("SIGHUP received - forcing resync");
                            handle.force_resync();
                        }
                        None => info!("SIGHUP received - nothing to reload"),
                    }
                }
                _ = sigint.recv() => {
                    warn!("SIGINT received");
                    break;
                }
                _ = sigterm.recv() => {
                    warn!("SIGTERM received");
                    break;
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = resync;
        tokio::select! {
            res = &mut task => return finish(res),
            _ = tokio::signal::ctrl_c() => {}
        }
    }

    info!("Shutting down...");
    let _ = shutdown_tx.send(()).await;
    finish(task.await)
}

fn finish(res: Result<Result<(), SyncError>, JoinError>) -> Result<()> {
    match res {
        Ok(Ok(())) => {
            info!("Stopped");
            Ok(())
        }
        Ok(Err(e)) => {
            error!(error = %e, fatal = e.is_fatal(), "Role stopped with an error");
            Err(e.into())
        }
        Err(e) => Err(eyre!("Role task failed: {}", e)),
    }
}
