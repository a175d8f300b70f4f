//! Local proxy listener
//!
//! Accepts client connections, parses the pending request and walks the pool until an
//! upstream serves it.

use std::net::SocketAddr;
use std::sync::Arc;

use http::StatusCode;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::{ClientConnection, ForwardOutcome, ProxyPool};
use crate::config::ServerConfig;
use crate::error::{RelayError, Result};

/// Proxy server
pub struct ProxyServer {
    config: ServerConfig,
    pool: Arc<ProxyPool>,
}

impl ProxyServer {
    pub fn new(config: ServerConfig, pool: Arc<ProxyPool>) -> Self {
        Self { config, pool }
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = self.config.addr().parse().map_err(|_| {
            RelayError::InvalidConfig(format!("Invalid listen address: {}", self.config.addr()))
        })?;

        let listener = TcpListener::bind(addr).await?;
        info!("Proxy server listening on {}", addr);

        self.serve(listener, shutdown).await
    }

    /// Accept loop over an already bound listener
    #[instrument(skip(self, listener, shutdown))]
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, client_addr)) => {
                            let pool = self.pool.clone();
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, client_addr, pool).await {
                                    debug!("Connection error: {}", e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Proxy server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Handle a single connection
    async fn handle_connection(
        stream: TcpStream,
        client_addr: SocketAddr,
        pool: Arc<ProxyPool>,
    ) -> Result<()> {
        stream.set_nodelay(true)?;
        let mut client = ClientConnection::read_request(stream, client_addr.to_string()).await?;
        Self::dispatch(&mut client, &pool).await
    }

    /// Try each candidate until one serves the request or fails it for good
    pub async fn dispatch(client: &mut ClientConnection, pool: &ProxyPool) -> Result<()> {
        let candidates = pool.candidates(client.protocol());
        if candidates.is_empty() {
            warn!("[{}] no proxy supports {}", client, client.protocol());
            let err = RelayError::NoProxiesAvailable;
            client
                .respond_error(err.status_code(), &err.to_string())
                .await?;
            return Err(err);
        }

        for proxy in candidates {
            client.begin_attempt();

            match proxy.forward(client).await {
                Ok(ForwardOutcome::Completed) => {
                    debug!("[{}] served by {}", client, proxy);
                    return Ok(());
                }
                Ok(ForwardOutcome::Fallback { reason }) => {
                    debug!("[{}] {} fell back: {}", client, proxy, reason);
                }
                Err(e) if e.is_fatal_for_client() || client.forward_started() => {
                    error!("[{}] forward via {} failed: {}", client, proxy, e);
                    return Err(e);
                }
                Err(e) => {
                    warn!("[{}] {} failed before responding: {}", client, proxy, e);
                }
            }
        }

        let status = StatusCode::BAD_GATEWAY;
        client
            .respond_error(status, "All upstream proxies failed")
            .await?;
        Err(RelayError::ProxyConnectionFailed(format!(
            "no upstream served {}",
            client
        )))
    }
}
