//! Relay proxy over a multiplexed tunnel
//!
//! Each forwarded request becomes one stream on the shared tunnel. The request is
//! translated into a header block, and reply frames are translated back into an HTTP/1.1
//! response on the client connection. A relay that never answers lets the client fall
//! back; one that stops mid-response fails the client.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use super::{ClientConnection, ForwardOutcome, Protocol, Proxy, RequestHead};
use crate::error::{RelayError, Result};
use crate::tunnel::{ChannelConnector, Frame, HeaderBlock, TunnelClient};

const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(10);

/// Where a relay lives and how to authenticate to it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEndpoint {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub public: bool,
}

impl RelayEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            public: false,
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_public(mut self, public: bool) -> Self {
        self.public = public;
        self
    }

    /// `Basic` proxy authorization, only when both credentials are set
    fn authorization(&self) -> Option<String> {
        match (&self.username, &self.password) {
            (Some(username), Some(password)) => Some(format!(
                "Basic {}",
                BASE64.encode(format!("{}:{}", username, password))
            )),
            _ => None,
        }
    }
}

/// Response bytes still owed to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Remaining {
    /// No usable content-length; read until the stream ends
    Unbounded,
    Bounded(u64),
}

impl Remaining {
    fn is_exhausted(&self) -> bool {
        matches!(self, Remaining::Bounded(0))
    }

    fn consume(&mut self, n: u64) {
        if let Remaining::Bounded(left) = self {
            *left = left.saturating_sub(n);
        }
    }
}

/// Upstream proxy reached through a multiplexed relay tunnel
pub struct RelayProxy {
    endpoint: RelayEndpoint,
    connector: Arc<dyn ChannelConnector>,
    stream_timeout: Duration,
    tunnel: RwLock<Option<Arc<TunnelClient>>>,
    died: AtomicBool,
}

impl RelayProxy {
    pub fn new(endpoint: RelayEndpoint, connector: Arc<dyn ChannelConnector>) -> Self {
        Self {
            endpoint,
            connector,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            tunnel: RwLock::new(None),
            died: AtomicBool::new(false),
        }
    }

    /// Bound on the wait for each frame of a forwarded response
    pub fn with_stream_timeout(mut self, stream_timeout: Duration) -> Self {
        self.stream_timeout = stream_timeout;
        self
    }

    pub fn endpoint(&self) -> &RelayEndpoint {
        &self.endpoint
    }

    pub fn is_public(&self) -> bool {
        self.endpoint.public
    }

    pub fn tunnel(&self) -> Option<Arc<TunnelClient>> {
        self.tunnel.read().clone()
    }

    /// Replace the tunnel with a fresh one; failure marks the relay dead
    #[instrument(skip(self), fields(relay = %self))]
    pub async fn connect(&self) {
        self.close().await;

        match TunnelClient::connect(
            self.connector.as_ref(),
            &self.endpoint.host,
            self.endpoint.port,
        )
        .await
        {
            Ok(tunnel) => {
                tunnel.spawn_dispatch();
                *self.tunnel.write() = Some(tunnel);
                self.set_died(false);
                info!("Connected {}", self);
            }
            Err(e) => {
                error!("Failed to connect {}: {}", self, e);
                self.set_died(true);
            }
        }
    }

    pub async fn close(&self) {
        let previous = self.tunnel.write().take();
        if let Some(tunnel) = previous {
            tunnel.close().await;
        }
    }

    /// Translate a client request into the stream's header block
    pub fn request_headers(&self, request: &RequestHead) -> HeaderBlock {
        let mut headers: HeaderBlock = vec![
            (":method".to_string(), request.method.clone()),
            (":scheme".to_string(), "http".to_string()),
            (":path".to_string(), request.path.clone()),
            (":version".to_string(), "HTTP/1.1".to_string()),
            (":host".to_string(), request.host.clone()),
        ];

        if let Some(authorization) = self.endpoint.authorization() {
            set_header(&mut headers, "proxy-authorization", authorization);
        }

        for (name, value) in &request.headers {
            set_header(&mut headers, &name.to_ascii_lowercase(), value.clone());
        }

        headers
    }

    /// Relay one request over a new stream
    pub async fn do_forward(&self, client: &mut ClientConnection) -> Result<ForwardOutcome> {
        let Some(tunnel) = self.tunnel() else {
            return Ok(client.fall_back(format!("{} tunnel not connected", self)));
        };

        let Some(body) = client.request().buffered_body().map(Bytes::copy_from_slice) else {
            return Ok(client.fall_back(format!(
                "{} needs the whole request body up front",
                self
            )));
        };

        let headers = self.request_headers(client.request());
        let mut stream = match tunnel.open_stream_with_body(headers, body).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!("[{}] failed to open stream on {}: {}", client, self, e);
                return Ok(client.fall_back(format!("{} stream not opened: {}", self, e)));
            }
        };
        debug!(stream_id = stream.id(), "[{}] forwarding via {}", client, self);

        let mut remaining = Remaining::Unbounded;
        let mut forwarded = 0u64;

        while !remaining.is_exhausted() {
            let frame = match timeout(self.stream_timeout, stream.next_frame()).await {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    return match (client.forward_started(), remaining) {
                        (false, _) => Ok(client.fall_back(format!(
                            "{} stream ended without a response",
                            self
                        ))),
                        (true, Remaining::Unbounded) => {
                            client.flush().await?;
                            Ok(ForwardOutcome::Completed)
                        }
                        (true, Remaining::Bounded(left)) => {
                            Err(RelayError::ForwardTruncated { remaining: left })
                        }
                    };
                }
                Err(_) if client.forward_started() => {
                    return Err(RelayError::ForwardStalled { forwarded });
                }
                Err(_) => {
                    return Ok(client.fall_back(format!("no response from {}", self)));
                }
            };

            match frame {
                Frame::SynReply { headers, .. } => {
                    remaining = self.on_syn_reply(client, headers).await?;
                }
                Frame::Data { data, .. } => {
                    client.mark_forward_started();
                    client.write_all(&data).await?;
                    forwarded += data.len() as u64;
                    remaining.consume(data.len() as u64);
                }
                other => {
                    warn!("[{}] unknown frame: {:?}", client, other);
                }
            }
        }

        client.flush().await?;
        Ok(ForwardOutcome::Completed)
    }

    /// Write the status line and headers; returns how many body bytes to expect
    async fn on_syn_reply(
        &self,
        client: &mut ClientConnection,
        headers: HeaderBlock,
    ) -> Result<Remaining> {
        debug!("[{}] syn reply: {:?}", client, headers);

        let mut version = None;
        let mut status = None;
        let mut rest = Vec::with_capacity(headers.len());
        for (name, value) in headers {
            match name.as_str() {
                ":version" => version = Some(value),
                ":status" => status = Some(value),
                _ => rest.push((name, value)),
            }
        }

        let status = status.ok_or_else(|| {
            RelayError::ProxyConnectionFailed(format!("{} replied without :status", self))
        })?;
        let version = version.unwrap_or_else(|| "HTTP/1.1".to_string());

        // Repeated headers arrive as one NUL-separated value
        let mut head = format!("{} {}\r\n", version, status);
        for (name, value) in &rest {
            for value in value.split('\0') {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        head.push_str("\r\n");

        client.mark_forward_started();
        client.write_all(head.as_bytes()).await?;

        if status.starts_with("304") {
            return Ok(Remaining::Bounded(0));
        }

        let remaining = rest
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<u64>().ok())
            .map(Remaining::Bounded)
            .unwrap_or(Remaining::Unbounded);
        Ok(remaining)
    }

    /// Reconnect every relay in turn
    pub async fn refresh(proxies: &[Arc<RelayProxy>]) -> bool {
        for proxy in proxies {
            proxy.connect().await;
        }
        true
    }
}

fn set_header(headers: &mut HeaderBlock, name: &str, value: String) {
    match headers.iter_mut().find(|(n, _)| n == name) {
        Some(entry) => entry.1 = value,
        None => headers.push((name.to_string(), value)),
    }
}

#[async_trait]
impl Proxy for RelayProxy {
    async fn forward(&self, client: &mut ClientConnection) -> Result<ForwardOutcome> {
        self.do_forward(client).await
    }

    fn died(&self) -> bool {
        self.died.load(Ordering::Acquire)
    }

    fn set_died(&self, died: bool) {
        self.died.store(died, Ordering::Release);
    }

    fn is_protocol_supported(&self, protocol: Protocol) -> bool {
        protocol == Protocol::Http
    }
}

impl fmt::Display for RelayProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayProxy[{}:{}]", self.endpoint.host, self.endpoint.port)
    }
}
