//! HTTP CONNECT upstream
//!
//! Opens a CONNECT tunnel through an upstream proxy to the client's target, then relays
//! bytes in both directions until one side closes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, instrument, warn};

use super::{ClientConnection, ForwardOutcome, Protocol, Proxy};
use crate::error::Result;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
const MAX_CONNECT_RESPONSE: usize = 8 * 1024;
const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Upstream proxy reached with `CONNECT host:port`
pub struct HttpConnectProxy {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    connect_timeout: Duration,
    died: AtomicBool,
}

impl HttpConnectProxy {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            died: AtomicBool::new(false),
        }
    }

    pub fn with_credentials(mut self, username: Option<String>, password: Option<String>) -> Self {
        self.username = username;
        self.password = password;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    fn build_connect_request(&self, target_host: &str, target_port: u16) -> String {
        let authority = format_authority(target_host, target_port);
        let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);

        if let Some(username) = &self.username {
            let password = self.password.as_deref().unwrap_or("");
            let credentials = format!("{}:{}", username, password);
            request.push_str(&format!(
                "Proxy-Authorization: Basic {}\r\n",
                BASE64.encode(credentials.as_bytes())
            ));
        }

        request.push_str("\r\n");
        request
    }

    /// Establish the CONNECT tunnel; returns the stream and any bytes read past the reply
    async fn open_tunnel(
        &self,
        target_host: &str,
        target_port: u16,
    ) -> std::result::Result<(TcpStream, Bytes), anyhow::Error> {
        let mut stream = TcpStream::connect(format_authority(&self.host, self.port)).await?;
        stream.set_nodelay(true)?;

        let request = self.build_connect_request(target_host, target_port);
        stream.write_all(request.as_bytes()).await?;

        let mut response = BytesMut::with_capacity(1024);
        loop {
            if response.len() >= MAX_CONNECT_RESPONSE {
                anyhow::bail!("CONNECT response too large");
            }
            if stream.read_buf(&mut response).await? == 0 {
                anyhow::bail!("empty CONNECT response");
            }

            let mut headers = [httparse::EMPTY_HEADER; 32];
            let mut parsed = httparse::Response::new(&mut headers);
            match parsed.parse(&response)? {
                httparse::Status::Partial => continue,
                httparse::Status::Complete(head_len) => {
                    let code = parsed.code.unwrap_or_default();
                    if code != 200 {
                        anyhow::bail!(
                            "CONNECT failed: {} {}",
                            code,
                            parsed.reason.unwrap_or("Unknown error")
                        );
                    }
                    let leftover = response.split_off(head_len).freeze();
                    return Ok((stream, leftover));
                }
            }
        }
    }
}

#[async_trait]
impl Proxy for HttpConnectProxy {
    #[instrument(skip(self, client), fields(proxy = %self))]
    async fn forward(&self, client: &mut ClientConnection) -> Result<ForwardOutcome> {
        let (target_host, target_port) = client.request().target()?;

        let (mut upstream, leftover) =
            match timeout(self.connect_timeout, self.open_tunnel(&target_host, target_port)).await {
                Ok(Ok(tunnel)) => tunnel,
                Ok(Err(e)) => {
                    warn!("[{}] {} failed: {}", client, self, e);
                    return Ok(client.fall_back(format!("{} failed: {}", self, e)));
                }
                Err(_) => {
                    return Ok(client.fall_back(format!("{} timed out", self)));
                }
            };
        debug!(
            "Tunnel to {}:{} established via {}",
            target_host, target_port, self
        );

        if client.request().is_connect() {
            client
                .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
                .await?;
            client.mark_forward_started();
            upstream.write_all(client.request().body()).await?;
        } else {
            upstream.write_all(client.request().raw()).await?;
        }

        if !leftover.is_empty() {
            client.write_all(&leftover).await?;
            client.mark_forward_started();
        }

        let (sent, received) = relay_bidirectional(client.downstream_mut(), upstream).await;
        debug!(bytes_sent = sent, bytes_received = received, "Relay closed");

        if received > 0 {
            client.mark_forward_started();
        }
        if client.forward_started() {
            Ok(ForwardOutcome::Completed)
        } else {
            Ok(client.fall_back(format!("no response from {}", self)))
        }
    }

    fn died(&self) -> bool {
        self.died.load(Ordering::Acquire)
    }

    fn set_died(&self, died: bool) {
        self.died.store(died, Ordering::Release);
    }

    fn is_protocol_supported(&self, protocol: Protocol) -> bool {
        matches!(protocol, Protocol::Http | Protocol::Https)
    }
}

impl fmt::Display for HttpConnectProxy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HttpConnectProxy[{}:{}]", self.host, self.port)
    }
}

fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') && !(host.starts_with('[') && host.ends_with(']')) {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

/// Copy until EOF or error, counting what made it through
async fn pump<R, W>(reader: &mut R, writer: &mut W) -> (u64, std::io::Result<()>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return (total, Ok(())),
            Ok(n) => n,
            Err(e) => return (total, Err(e)),
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            return (total, Err(e));
        }
        total += n as u64;
    }
}

/// Relay bytes both ways; returns (client to upstream, upstream to client)
///
/// The relay ends when the upstream side finishes. The downstream write half is only
/// shut down when upstream bytes were delivered, so a silent upstream leaves the client
/// usable for another attempt.
async fn relay_bidirectional<C, S>(client: C, server: S) -> (u64, u64)
where
    C: AsyncRead + AsyncWrite + Unpin + Send,
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut server_read, mut server_write) = tokio::io::split(server);

    let server_to_client = async {
        let (received, result) = pump(&mut server_read, &mut client_write).await;
        if let Err(e) = result {
            debug!("Upstream to client copy ended: {}", e);
        }
        if received > 0 {
            let _ = client_write.shutdown().await;
        }
        received
    };
    tokio::pin!(server_to_client);

    let client_to_server = async {
        let (sent, result) = pump(&mut client_read, &mut server_write).await;
        if let Err(e) = result {
            debug!("Client to upstream copy ended: {}", e);
        }
        let _ = server_write.shutdown().await;
        sent
    };
    tokio::pin!(client_to_server);

    tokio::select! {
        received = &mut server_to_client => (0, received),
        sent = &mut client_to_server => (sent, (&mut server_to_client).await),
    }
}
