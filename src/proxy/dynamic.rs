use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use futures::future::join_all;
use tracing::{debug, info};

use super::{ClientConnection, ForwardOutcome, Protocol, Proxy, ProxyResolver};
use crate::error::{RelayError, Result};

/// What a dynamic proxy currently forwards to
#[derive(Clone)]
pub enum Delegation {
    Unresolved,
    Resolved(Arc<dyn Proxy>),
}

impl Delegation {
    pub fn proxy(&self) -> Option<&Arc<dyn Proxy>> {
        match self {
            Delegation::Unresolved => None,
            Delegation::Resolved(proxy) => Some(proxy),
        }
    }
}

/// A proxy bound at runtime through its DNS reference.
///
/// The delegate is swapped as a whole on every refresh, so readers see either the
/// previous binding or the new one, never a partial state.
pub struct DynamicProxy {
    reference: String,
    delegate: ArcSwap<Delegation>,
}

impl DynamicProxy {
    pub fn new(reference: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            delegate: ArcSwap::from_pointee(Delegation::Unresolved),
        }
    }

    pub fn reference(&self) -> &str {
        &self.reference
    }

    pub fn delegate(&self) -> Option<Arc<dyn Proxy>> {
        self.delegate.load().proxy().cloned()
    }

    pub fn is_resolved(&self) -> bool {
        self.delegate().is_some()
    }

    /// Replace the delegate; `None` returns the proxy to the unresolved state
    pub fn bind(&self, proxy: Option<Arc<dyn Proxy>>) {
        let delegation = match proxy {
            Some(proxy) => Delegation::Resolved(proxy),
            None => Delegation::Unresolved,
        };
        self.delegate.store(Arc::new(delegation));
    }

    /// Resolve every reference concurrently and rebind each proxy
    ///
    /// Waits for all lookups, so the batch takes about one resolver timeout.
    pub async fn refresh(proxies: &[Arc<DynamicProxy>], resolver: &ProxyResolver) -> bool {
        let lookups = proxies.iter().map(|proxy| async move {
            let resolved = resolver.resolve(&proxy.reference).await;
            proxy.bind(resolved);
            if proxy.is_resolved() {
                debug!("Resolved proxy: {}", proxy);
            } else {
                debug!("Failed to resolve proxy: {}", proxy.reference);
            }
        });
        join_all(lookups).await;

        let resolved = proxies.iter().filter(|p| p.is_resolved()).count();
        info!(
            "Dynamic proxy refresh: {}/{} resolved",
            resolved,
            proxies.len()
        );
        true
    }
}

#[async_trait]
impl Proxy for DynamicProxy {
    async fn forward(&self, client: &mut ClientConnection) -> Result<ForwardOutcome> {
        match self.delegate() {
            Some(delegate) => delegate.forward(client).await,
            None => Err(RelayError::NotImplemented(self.to_string())),
        }
    }

    fn died(&self) -> bool {
        self.delegate().map(|d| d.died()).unwrap_or(false)
    }

    fn set_died(&self, died: bool) {
        // Unresolved proxies have no liveness to record
        if let Some(delegate) = self.delegate() {
            delegate.set_died(died);
        }
    }

    fn is_protocol_supported(&self, protocol: Protocol) -> bool {
        self.delegate()
            .map(|d| d.is_protocol_supported(protocol))
            .unwrap_or(false)
    }
}

impl fmt::Display for DynamicProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.delegate.load().proxy() {
            Some(delegate) => write!(f, "DynamicProxy[{}=>{}]", self.reference, delegate),
            None => write!(f, "DynamicProxy[UNRESOLVED]"),
        }
    }
}
