//! # Tidecall Server
//!
//! Composition root for the call core:
//! - loads configuration and installs structured logging
//! - builds the scorer, codec catalog, fallback controller and session
//!   registry, and ties them together in one `CallServer`
//! - runs the periodic cleanup task and the signaling WebSocket
//!
//! Ctrl-C stops accepting connections and cancels the cleanup task.

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use tidecall_voice::CallServer;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Parser)]
#[command(name = "tidecall", version, about = "Real-time call quality control server")]
struct Args {
    /// Config file, without extension (defaults to ./config).
    #[arg(short, long, env = "TIDECALL_CONFIG")]
    config: Option<PathBuf>,

    /// Emit JSON log lines regardless of the configured format.
    #[arg(long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = tidecall_common::config::load(args.config.as_deref())?;

    // Initialize tracing (structured logging)
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| config.logging.filter.clone().into());
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true);
    if args.json_logs || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Tidecall");

    // === Call core ===
    let server = CallServer::from_config(&config);

    // === Background cleanup ===
    let cancel = CancellationToken::new();
    let cleanup = tokio::spawn(tidecall_voice::cleanup::run(
        server.clone(),
        config.cleanup.clone(),
        cancel.clone(),
    ));

    // === Call Signaling WebSocket ===
    let router = tidecall_voice::handler::build_router(server);
    let addr = SocketAddr::new(config.server.host.parse()?, config.server.signaling_port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "Call signaling listening on ws://{addr}/calls/ws");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal(cancel.clone()))
        .await?;

    cancel.cancel();
    cleanup.await?;
    tracing::info!("Tidecall stopped");
    Ok(())
}

/// Resolve on Ctrl-C, cancelling background tasks.
async fn shutdown_signal(cancel: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    tracing::info!("Shutdown signal received");
    cancel.cancel();
}
