//! Egress Relay - Entry Point
//!
//! Starts the proxy listener and the pool refresh service with graceful shutdown support.

use std::sync::Arc;

use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use egress_relay::config::{Config, LogConfig};
use egress_relay::proxy::{DynamicProxy, ProxyPool, ProxyResolver, ProxyServer, RelayProxy};
use egress_relay::services::{RefreshConfig, RefreshHandle, RefreshService};
use egress_relay::tunnel::{ChannelConnector, TlsChannelConnector, TUNNEL_PROTOCOL};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize tracing
    init_tracing(&config.log);
    info!("Starting Egress Relay");

    // Build the proxy pool
    let resolver = ProxyResolver::new(config.upstream.resolver_config());
    let dynamic: Vec<Arc<DynamicProxy>> = config
        .upstream
        .dynamic_proxies
        .iter()
        .map(|reference| Arc::new(DynamicProxy::new(reference.clone())))
        .collect();

    let connector: Arc<dyn ChannelConnector> = Arc::new(TlsChannelConnector::new(
        &[TUNNEL_PROTOCOL],
        config.upstream.connect_timeout,
        config.upstream.tls_ca_file.as_deref(),
    )?);
    let relays: Vec<Arc<RelayProxy>> = config
        .upstream
        .relays
        .iter()
        .cloned()
        .map(|endpoint| {
            Arc::new(
                RelayProxy::new(endpoint, connector.clone())
                    .with_stream_timeout(config.upstream.stream_timeout),
            )
        })
        .collect();

    let pool = Arc::new(ProxyPool::new(dynamic, relays, resolver));
    info!(
        "Configured {} dynamic proxies and {} relays",
        pool.dynamic().len(),
        pool.relays().len()
    );

    // Initial refresh so the first requests have somewhere to go
    pool.refresh().await;

    // Create shutdown channel
    let (shutdown_tx, _) = watch::channel(false);

    // Start refresh service
    let (refresh_handle, refresh_shutdown) = RefreshHandle::new();
    let refresh_service = RefreshService::new(
        pool.clone(),
        RefreshConfig {
            interval: config.upstream.refresh_interval,
        },
    );
    let refresh_task = tokio::spawn(async move {
        refresh_service.run(refresh_shutdown).await;
    });

    // Start proxy server
    let proxy_server = ProxyServer::new(config.server.clone(), pool.clone());
    let proxy_shutdown = shutdown_tx.subscribe();
    let proxy_task = tokio::spawn(async move {
        if let Err(e) = proxy_server.run(proxy_shutdown).await {
            error!("Proxy server error: {}", e);
        }
    });

    info!("Proxy listening on {}", config.server.addr());

    // Wait for shutdown signal
    shutdown_signal().await;
    info!("Shutdown signal received");

    // Send shutdown signal to all services
    let _ = shutdown_tx.send(true);
    refresh_handle.shutdown();

    // Wait for all tasks to complete
    let _ = tokio::join!(proxy_task, refresh_task);

    for relay in pool.relays() {
        relay.close().await;
    }

    info!("Egress Relay stopped");
    Ok(())
}

fn init_tracing(log: &LogConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("egress_relay={}", log.level)));
    let registry = tracing_subscriber::registry().with(filter);

    if log.format.eq_ignore_ascii_case("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
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
}
