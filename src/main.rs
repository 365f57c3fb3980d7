//! TallyKV server entry point.
//!
//! Parses options, rebuilds the store from the append-only file, then
//! accepts connections until Ctrl+C.

use anyhow::Context;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tallykv::commands::CommandHandler;
use tallykv::config::Config;
use tallykv::connection::{serve_connection, ConnectionStats};
use tallykv::persistence::Aof;
use tallykv::storage::Store;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();
    init_tracing(&config.log_level);

    info!(version = tallykv::VERSION, "TallyKV starting");

    let store = Arc::new(Store::new());

    let aof = match config.aof() {
        Some(path) => {
            let aof = Aof::open(path, config.fsync_interval())
                .with_context(|| format!("opening append-only file {}", path.display()))?;
            let replayed = aof
                .replay(Arc::clone(&store))
                .with_context(|| format!("replaying append-only file {}", path.display()))?;
            if replayed.truncated_bytes > 0 {
                warn!(
                    bytes = replayed.truncated_bytes,
                    "AOF ended in a partial record, which was discarded"
                );
            }
            Some(Arc::new(aof))
        }
        None => {
            info!("Persistence disabled, running in memory only");
            None
        }
    };

    let handler = match &aof {
        Some(aof) => CommandHandler::with_aof(Arc::clone(&store), Arc::clone(aof)),
        None => CommandHandler::new(Arc::clone(&store)),
    };

    let stats = Arc::new(ConnectionStats::new());

    let listener = TcpListener::bind(config.bind_address())
        .await
        .with_context(|| format!("binding {}", config.bind_address()))?;
    info!("Listening on {}", config.bind_address());

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        info!("Shutdown signal received, stopping server...");
    };

    tokio::select! {
        _ = accept_loop(listener, handler, Arc::clone(&stats), config.idle_timeout()) => {}
        _ = shutdown => {}
    }

    if let Some(aof) = aof {
        match Arc::try_unwrap(aof) {
            Ok(aof) => aof.shutdown().await.context("final AOF fsync")?,
            // Connection tasks still hold the log; flush what they wrote.
            Err(aof) => aof.sync().context("final AOF fsync")?,
        }
        info!("AOF flushed");
    }

    stats.log_summary();
    info!("Server shutdown complete");
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    handler: CommandHandler,
    stats: Arc<ConnectionStats>,
    idle_timeout: Duration,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let handler = handler.clone();
                let stats = Arc::clone(&stats);

                tokio::spawn(async move {
                    serve_connection(stream, addr, handler, stats, idle_timeout).await;
                });
            }
            Err(e) => {
                error!("Failed to accept connection: {}", e);
            }
        }
    }
}
