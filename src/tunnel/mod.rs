//! Multiplexed relay tunnel
//!
//! - `frame`: frame model and binary codec
//! - `compression`: per-direction zlib contexts for header blocks
//! - `connector`: authenticated channel establishment (TLS + ALPN)
//! - `client`: tunnel lifecycle, dispatch loop, flow control and stream queues

pub mod client;
pub mod compression;
pub mod connector;
pub mod frame;

pub use client::{FlowControl, StreamHandle, TunnelClient, TunnelState, TUNNEL_PROTOCOL};
pub use connector::{Channel, ChannelConnector, NegotiatedChannel, TlsChannelConnector};
pub use frame::{Frame, FrameDecoder, FrameEncoder, FrameError, HeaderBlock};
