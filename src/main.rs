//! Turnover Guard server
//!
//! Serves the guarded schedule API and the payment webhook endpoint.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use turnover_guard::server::run_store_cleanup;
use turnover_guard::{router, AppState, GuardConfig, InMemoryStore, Seed};

/// Turnover Guard server
#[derive(Parser, Debug)]
#[command(name = "turnover-guard")]
#[command(author = "Turnover Team <team@turnover.app>")]
#[command(version)]
#[command(about = "Guarded schedule API and idempotent webhook ingestion")]
struct Args {
    /// Port to listen on
    #[arg(short, long, default_value = "3001")]
    port: u16,

    /// Host to bind to (default: 127.0.0.1, or 0.0.0.0 with TURNOVER_BIND_ALL=true)
    #[arg(short = 'H', long)]
    host: Option<IpAddr>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// JSON file with sessions, schedules and properties to preload
    #[arg(long)]
    seed: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = GuardConfig::from_env().context("failed to load configuration")?;

    let store = match &args.seed {
        Some(path) => {
            let seed = Seed::from_file(path)
                .with_context(|| format!("failed to load seed {}", path.display()))?;
            info!(path = %path.display(), "Loaded seed data");
            Arc::new(InMemoryStore::from_seed(seed).await)
        }
        None => Arc::new(InMemoryStore::new()),
    };

    let host = args.host.unwrap_or_else(|| config.bind_addr());
    let addr = SocketAddr::new(host, args.port);
    let window = config.rate_limit.window;

    let state = AppState::new(config, store)?;
    tokio::spawn(run_store_cleanup(
        state.limiter.clone(),
        state.ledger().clone(),
        window,
    ));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, version = turnover_guard::VERSION, "Turnover Guard listening");

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server error")?;

    info!("Turnover Guard stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
