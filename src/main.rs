mod auth;
mod config;
mod error;
mod handshake;
mod registry;
mod relay;
mod server;
mod target;

use crate::config::{Cli, ProxyConfig};
use crate::registry::ConnectionRegistry;
use crate::server::ProxyServer;
use clap::Parser;
use color_eyre::eyre::Result;

use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("https_proxy=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    color_eyre::install()?;

    let args = Cli::parse();
    let config = ProxyConfig::from_cli(args)?;

    match config.auth() {
        Some(auth) => info!(
            "Proxy authentication enabled for user {:?} (missing credentials answered with {})",
            auth.username,
            if auth.challenge { 407 } else { 401 }
        ),
        None => info!("Proxy authentication disabled"),
    }
    if let Some(redirect) = &config.redirect {
        info!("Forwarding every tunnel to {}", redirect);
    }

    let mut server = ProxyServer::new(config);
    let addr = server.start().await?;
    info!("HTTPS proxy listening on http://{}", addr);

    shutdown_signal().await?;
    info!("Shutdown signal received");

    server.stop().await?;
    drain(server.registry(), server.config().drain_timeout).await;

    let closed = server.registry().close_all();
    if closed > 0 {
        warn!("Forced shutdown with {} tunnels still active", closed);
    }
    info!("Server shutdown complete");

    Ok(())
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            res = signal::ctrl_c() => res?,
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    signal::ctrl_c().await?;

    Ok(())
}

/// Give open tunnels up to `timeout` to finish on their own.
async fn drain(registry: &ConnectionRegistry, timeout: Duration) {
    let active = registry.len();
    if active == 0 || timeout.is_zero() {
        return;
    }

    info!("Waiting for {} tunnels to close...", active);
    let total = timeout.as_secs().max(1);

    for i in 1..=total {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let remaining = registry.len();

        if remaining == 0 {
            info!("All tunnels closed gracefully");
            return;
        }

        if i % 5 == 0 {
            info!("Still waiting for {} tunnels... ({}/{}s)", remaining, i, total);
        }
    }
}
