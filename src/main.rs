use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tailgate::config::{Cli, Config};
use tailgate::endpoint::ProxyEndpoint;
use tailgate::inventory::InventoryClient;
use tailgate::overlay::LocalOverlay;
use tailgate::poller::Poller;
use tailgate::pool::ConnectionPool;
use tailgate::reconcile::ProxySet;
use tokio::sync::watch;
use tracing::{error, info};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tailgate=info".parse().expect("valid log directive")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_cli(&cli).map_err(|e| {
        error!(error = %e, "Invalid configuration");
        e
    })?;

    print_startup_banner(&config);

    let client = InventoryClient::new(
        &config.inventory.base_url(),
        config.inventory.api_key.as_deref().unwrap_or_default(),
        config.inventory.retry_policy(),
        config.inventory.request_timeout(),
    )?;

    // The hostname lookup doubles as the connectivity check
    let inventory_hostname = client.hostname().await.map_err(|e| {
        error!(url = %client.base_url(), error = %e, "Cannot reach inventory service");
        e
    })?;
    let hostname = config
        .overlay
        .hostname
        .clone()
        .unwrap_or(inventory_hostname);

    let overlay = Arc::new(LocalOverlay::new(config.overlay.clone())?);
    let pool = Arc::new(ConnectionPool::new(config.proxy.pool_config()));

    // Expose the inventory host's own web UI under the node name
    let primary = ProxyEndpoint::create(
        &hostname,
        config.inventory.web_target()?,
        overlay.as_ref(),
        Arc::clone(&pool),
        config.proxy.request_timeout(),
    )
    .await
    .map_err(|e| {
        error!(hostname = %hostname, error = %e, "Failed to expose primary endpoint");
        e
    })?;
    info!(
        hostname = %hostname,
        public_host = %primary.public_host(),
        addr = %primary.local_addr(),
        target = %primary.target(),
        "Primary endpoint ready"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let proxies = ProxySet::new(
        Arc::clone(&overlay),
        Arc::clone(&pool),
        config.inventory.backend_host()?,
        config.proxy.request_timeout(),
    );
    let poller = Poller::new(client, proxies, config.poller.interval(), shutdown_rx);
    let poller_handle = tokio::spawn(poller.run());

    let outcome = wait_for_shutdown(&primary).await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);
    primary.shutdown().await;

    if tokio::time::timeout(Duration::from_secs(5), poller_handle)
        .await
        .is_err()
    {
        error!("Timed out waiting for proxies to close");
    }

    info!("Shutdown complete");
    outcome
}

/// Wait for Ctrl+C or SIGTERM. Returns an error if the primary endpoint stops
/// on its own first.
async fn wait_for_shutdown(primary: &ProxyEndpoint) -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
            _ = primary.stopped() => {
                anyhow::bail!("primary endpoint {} stopped", primary.name());
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down...");
            }
            _ = primary.stopped() => {
                anyhow::bail!("primary endpoint {} stopped", primary.name());
            }
        }
    }

    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting");
    info!(
        url = %config.inventory.base_url(),
        api_key_set = config.inventory.api_key.is_some(),
        max_retries = config.inventory.max_retries,
        "Inventory settings"
    );
    info!(
        hostname = ?config.overlay.hostname,
        bind = %config.overlay.bind,
        domain = %config.overlay.domain,
        tls = config.overlay.tls,
        fixed_ports = config.overlay.ports.len(),
        "Overlay settings"
    );
    info!(
        interval_secs = config.poller.interval_secs,
        request_timeout_secs = config.proxy.request_timeout_secs,
        pool_max_idle = config.proxy.pool_max_idle_per_host,
        "Proxy settings"
    );
}
