use http::StatusCode;
use thiserror::Error;

use crate::tunnel::frame::FrameError;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Proxy errors
    #[error("No proxies available")]
    NoProxiesAvailable,

    #[error("Forwarding not implemented by {0}")]
    NotImplemented(String),

    #[error("Proxy connection failed: {0}")]
    ProxyConnectionFailed(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    #[error("Unsupported proxy protocol: {0}")]
    UnsupportedProtocol(String),

    // Tunnel errors
    #[error("Channel connect failed: {0}")]
    ChannelConnect(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Sub-protocol negotiation failed: expected {expected}, got {negotiated:?}")]
    Negotiation {
        expected: String,
        negotiated: Option<String>,
    },

    #[error("Tunnel is closed")]
    TunnelClosed,

    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    // Forwarding errors
    #[error("Taking too long to read frame from relay after {forwarded} bytes were forwarded")]
    ForwardStalled { forwarded: u64 },

    #[error("Relay stream ended with {remaining} response bytes outstanding")]
    ForwardTruncated { remaining: u64 },

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Operation timed out")]
    Timeout,

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Status code reported to a downstream client that never received a response
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            RelayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,

            // 501 Not Implemented
            RelayError::NotImplemented(_) | RelayError::UnsupportedProtocol(_) => {
                StatusCode::NOT_IMPLEMENTED
            }

            // 502 Bad Gateway
            RelayError::ProxyConnectionFailed(_)
            | RelayError::InvalidProxyAddress(_)
            | RelayError::ChannelConnect(_)
            | RelayError::Tls(_)
            | RelayError::Negotiation { .. }
            | RelayError::TunnelClosed
            | RelayError::Frame(_)
            | RelayError::ForwardTruncated { .. } => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            RelayError::NoProxiesAvailable => StatusCode::SERVICE_UNAVAILABLE,

            // 504 Gateway Timeout
            RelayError::Timeout | RelayError::ForwardStalled { .. } => {
                StatusCode::GATEWAY_TIMEOUT
            }

            // 500 Internal Server Error
            RelayError::InvalidConfig(_) | RelayError::Io(_) | RelayError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Whether a partially written response has to be torn down
    pub fn is_fatal_for_client(&self) -> bool {
        matches!(
            self,
            RelayError::ForwardStalled { .. } | RelayError::ForwardTruncated { .. }
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidProxyAddress(err.to_string())
    }
}

/// Why a symbolic proxy reference stayed unresolved
#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("DNS socket error: {0}")]
    Io(#[from] std::io::Error),

    #[error("DNS query timed out")]
    Timeout,

    #[error("Malformed DNS message: {0}")]
    Malformed(String),

    #[error("DNS answer carried no TXT record")]
    NoAnswer,

    #[error("Expected 5 fields in connection info, got {0}")]
    FieldCount(usize),

    #[error("Unsupported proxy type: {0}")]
    UnsupportedType(String),

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

impl From<hickory_proto::error::ProtoError> for ResolveError {
    fn from(err: hickory_proto::error::ProtoError) -> Self {
        ResolveError::Malformed(err.to_string())
    }
}
