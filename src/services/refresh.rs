//! Pool refresh service
//!
//! Periodically re-resolves dynamic proxies and reconnects relay tunnels.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, instrument};

use crate::proxy::ProxyPool;

/// Refresh service configuration
#[derive(Clone)]
pub struct RefreshConfig {
    /// Interval between pool refreshes
    pub interval: Duration,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
        }
    }
}

/// Background pool refresher
pub struct RefreshService {
    pool: Arc<ProxyPool>,
    config: RefreshConfig,
}

impl RefreshService {
    pub fn new(pool: Arc<ProxyPool>, config: RefreshConfig) -> Self {
        Self { pool, config }
    }

    /// Run the refresh loop (call in a spawned task)
    ///
    /// The first refresh happens one interval after start; callers refresh once up front.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Starting pool refresh service with {}s interval",
            self.config.interval.as_secs()
        );

        let mut refresh_interval = interval(self.config.interval);
        refresh_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        refresh_interval.tick().await;

        loop {
            tokio::select! {
                _ = refresh_interval.tick() => {
                    self.pool.refresh().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Pool refresh service shutting down");
                        break;
                    }
                }
            }
        }
    }
}

/// Handle for managing the refresh service
pub struct RefreshHandle {
    shutdown_tx: watch::Sender<bool>,
}

impl RefreshHandle {
    pub fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { shutdown_tx: tx }, rx)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Default for RefreshHandle {
    fn default() -> Self {
        Self::new().0
    }
}
