//! Egress Relay - upstream selection and multiplexed relay tunnels
//!
//! Forwards client connections through upstream proxies chosen at runtime.
//!
//! ## Features
//!
//! - Dynamic proxies bound through DNS TXT records
//! - HTTP CONNECT upstreams with Basic proxy authorization
//! - Relay proxies reached over a TLS tunnel multiplexing one stream per request
//! - Receive-side flow control and timeout-driven fallback between upstreams

pub mod config;
pub mod error;
pub mod proxy;
pub mod services;
pub mod tunnel;

pub use config::Config;
pub use error::{RelayError, ResolveError, Result};
