//! fleetd binary entry point.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use fleetd::{
    load_server_config, serve, AppState, CoordinationStore, MemoryStore, SqliteRepository,
    TokenIssuer,
};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "fleetd", version)]
#[command(about = "Fleet task coordinator")]
struct Cli {
    /// Path to fleetd.toml (or use FLEETD_CONFIG env var)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides config and FLEETD_LISTEN
    #[arg(long)]
    listen: Option<String>,

    /// Token signing secret (or use FLEETD_SECRET env var)
    #[arg(long)]
    secret: Option<String>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!("Failed to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("FLEETD_CONFIG").ok().map(PathBuf::from));
    let mut config = load_server_config(config_path.as_deref());
    config.apply_env();
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(secret) = cli.secret {
        config.auth.secret = secret;
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
        fleet_build_info::formatted_banner("fleetd", env!("CARGO_PKG_VERSION"))
    );
    if config.uses_default_secret() {
        warn!("Using default secret - set FLEETD_SECRET in production!");
    }

    let repo = SqliteRepository::open(&config.database.path).with_context(|| {
        format!("failed to open database {}", config.database.path.display())
    })?;
    let store: Arc<dyn CoordinationStore> = Arc::new(MemoryStore::new());
    let issuer = TokenIssuer::new(
        config.auth.secret.as_bytes().to_vec(),
        config.token_ttl(),
        store.clone(),
    );
    let state = AppState::new(store, Arc::new(repo), issuer);
    state
        .admin
        .restore_states()
        .await
        .context("failed to restore task state from the database")?;

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("failed to bind {}", config.listen))?;
    serve(listener, state, shutdown_signal())
        .await
        .context("server terminated")?;

    info!("fleetd stopped");
    Ok(())
}
