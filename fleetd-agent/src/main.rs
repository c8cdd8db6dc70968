//! fleetd-agent binary entry point.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetd_agent::{
    retry_with_backoff, AgentConfig, AgentControl, Executor, ExecutorConfig, FileTransport,
    HttpTransport, RemoteTaskApi, Scheduler, Session, TaskApi, TaskManager,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetd-agent", version)]
#[command(about = "Fleet agent: runs scheduled tasks for fleetd")]
struct Cli {
    /// Path to fleetd-agent.toml (or use FLEETD_CONFIG env var)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity reported to the coordinator, overrides config
    #[arg(long)]
    identity: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = terminate.recv() => {},
                }
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("FLEETD_CONFIG").ok().map(PathBuf::from));
    let mut config = AgentConfig::load(config_path.as_deref())?;
    config.apply_env();
    if let Some(identity) = cli.identity {
        config.identity = identity;
    }

    let level = if cli.debug {
        "debug".to_string()
    } else {
        config.log.level.clone()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    info!(
        "{}",
        fleet_build_info::formatted_banner("fleetd-agent", env!("CARGO_PKG_VERSION"))
    );

    let session_config = config.session_config();
    let session = retry_with_backoff(session_config.reconnect, |attempt| {
        info!("Connecting to {} (attempt {})", session_config.url, attempt);
        Session::connect(session_config.clone())
    })
    .await
    .with_context(|| format!("could not reach coordinator at {}", session_config.url))?;
    let heartbeat = session.spawn_heartbeat();

    let api: Arc<dyn TaskApi> = Arc::new(RemoteTaskApi::new(session.clone()));
    let manager = Arc::new(TaskManager::new());
    if let Err(err) = manager.load_from(api.as_ref()).await {
        warn!("Failed to load task list, starting empty: {}", err);
    }

    let transport: Arc<dyn FileTransport> = Arc::new(HttpTransport::new(
        config.server.upload_api.clone(),
        config.server.download_api.clone(),
    ));
    let executor = Arc::new(Executor::new(
        ExecutorConfig {
            identity: config.identity.clone(),
            work_dir: config.executor.work_dir.clone(),
            log_dir: config.executor.log_dir.clone(),
            timeout: config.execution_timeout(),
        },
        api.clone(),
        manager.clone(),
        transport,
    ));
    let scheduler = Arc::new(Scheduler::new(executor, api.clone(), manager.clone()));
    match scheduler.start().await {
        Ok(count) => info!("{} task(s) scheduled", count),
        Err(err) => error!("Scheduler start failed: {}", err),
    }

    let control = AgentControl::new(manager, scheduler.clone(), api);
    let listener_session = session.clone();
    let listener = tokio::spawn(async move { listener_session.listen(&control).await });

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = listener => warn!("Session listener ended"),
    }

    scheduler.shutdown();
    heartbeat.abort();
    if let Err(err) = session.close().await {
        warn!("Failed to close session: {}", err);
    }
    info!("fleetd-agent stopped");
    Ok(())
}
