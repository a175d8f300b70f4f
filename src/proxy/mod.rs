//! Upstream proxy implementations
//!
//! This module provides:
//! - The `Proxy` capability contract shared by every upstream variant
//! - Dynamic proxies bound through DNS TXT records
//! - HTTP CONNECT upstreams
//! - Relay proxies reached through a multiplexed tunnel
//! - The proxy pool and the accept loop that drives forwarding

pub mod client;
pub mod dynamic;
pub mod http_connect;
pub mod pool;
pub mod relay;
pub mod resolver;
pub mod server;

pub use client::{ClientConnection, RequestHead};
pub use dynamic::{Delegation, DynamicProxy};
pub use http_connect::HttpConnectProxy;
pub use pool::ProxyPool;
pub use relay::{RelayEndpoint, RelayProxy};
pub use resolver::{ConnectionDescriptor, ProxyResolver, ResolverConfig};
pub use server::ProxyServer;

use std::fmt;

use async_trait::async_trait;

use crate::error::Result;

/// Application protocol of a client request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Http,
    Https,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How a forward attempt ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardOutcome {
    /// The response was relayed to the client
    Completed,
    /// Nothing reached the client; the caller may try another upstream
    Fallback { reason: String },
}

impl ForwardOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, ForwardOutcome::Fallback { .. })
    }
}

/// Capability contract implemented by every upstream proxy
#[async_trait]
pub trait Proxy: fmt::Display + Send + Sync {
    /// Forward the client's pending request through this upstream
    async fn forward(&self, client: &mut ClientConnection) -> Result<ForwardOutcome>;

    /// Whether this upstream is currently excluded from selection
    fn died(&self) -> bool;

    fn set_died(&self, died: bool);

    fn is_protocol_supported(&self, protocol: Protocol) -> bool;
}
