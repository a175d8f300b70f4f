//! DNS TXT proxy resolution
//!
//! A symbolic proxy reference is a DNS name whose TXT record advertises connection
//! parameters as `type:host:port:username:password`. Resolution is a single UDP exchange
//! with a recursive resolver; every failure leaves the reference unresolved.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use rand::Rng;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, instrument};

use super::{HttpConnectProxy, Proxy};
use crate::error::ResolveError;

/// The only proxy type a TXT record may advertise
pub const SUPPORTED_PROXY_TYPE: &str = "http-connect";

/// Largest answer packet read from the resolver
pub const MAX_ANSWER_SIZE: usize = 1024;

const FIELD_COUNT: usize = 5;

#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Recursive resolver queried over UDP
    pub dns_server: SocketAddr,
    /// Bound on the whole query/answer exchange
    pub timeout: Duration,
    /// Connect timeout handed to resolved proxies
    pub connect_timeout: Duration,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            dns_server: SocketAddr::from((Ipv4Addr::new(8, 8, 8, 8), 53)),
            timeout: Duration::from_secs(3),
            connect_timeout: Duration::from_secs(3),
        }
    }
}

/// Decoded TXT payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionDescriptor {
    pub proxy_type: String,
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectionDescriptor {
    /// Parse a sanitized `type:host:port:username:password` string
    pub fn parse(info: &str) -> Result<Self, ResolveError> {
        let fields: Vec<&str> = info.split(':').collect();
        if fields.len() != FIELD_COUNT {
            return Err(ResolveError::FieldCount(fields.len()));
        }

        let proxy_type = fields[0];
        if proxy_type != SUPPORTED_PROXY_TYPE {
            return Err(ResolveError::UnsupportedType(proxy_type.to_string()));
        }

        let host = fields[1];
        if host.is_empty() {
            return Err(ResolveError::Malformed("empty host".to_string()));
        }

        let port = fields[2]
            .parse::<u16>()
            .map_err(|_| ResolveError::InvalidPort(fields[2].to_string()))?;

        let non_empty = |s: &str| (!s.is_empty()).then(|| s.to_string());

        Ok(Self {
            proxy_type: proxy_type.to_string(),
            host: host.to_string(),
            port,
            username: non_empty(fields[3]),
            password: non_empty(fields[4]),
        })
    }

    pub fn into_proxy(self, connect_timeout: Duration) -> HttpConnectProxy {
        HttpConnectProxy::new(self.host, self.port)
            .with_credentials(self.username, self.password)
            .with_connect_timeout(connect_timeout)
    }
}

/// Keep only ASCII alphanumerics and `:`, `.`, `-`
pub fn sanitize(payload: &str) -> String {
    payload
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, ':' | '.' | '-'))
        .collect()
}

/// Encode a recursive TXT query for `reference`
pub fn build_query(reference: &str, id: u16) -> Result<Vec<u8>, ResolveError> {
    let name = Name::from_ascii(reference)?;

    let mut message = Message::new();
    message
        .set_id(id)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(true)
        .add_query(Query::query(name, RecordType::TXT));

    Ok(message.to_vec()?)
}

/// Decode an answer packet and concatenate the first answer's TXT character-strings
pub fn extract_txt(packet: &[u8], id: u16) -> Result<String, ResolveError> {
    let message = Message::from_vec(packet)?;
    if message.id() != id {
        return Err(ResolveError::Malformed(format!(
            "transaction id {} does not match query {}",
            message.id(),
            id
        )));
    }

    let answer = message.answers().first().ok_or(ResolveError::NoAnswer)?;
    match answer.data() {
        Some(RData::TXT(txt)) => Ok(txt
            .txt_data()
            .iter()
            .map(|part| String::from_utf8_lossy(part))
            .collect()),
        _ => Err(ResolveError::NoAnswer),
    }
}

/// One-shot resolver for symbolic proxy references
pub struct ProxyResolver {
    config: ResolverConfig,
}

impl ProxyResolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve `reference`, absorbing every failure into `None`
    pub async fn resolve(&self, reference: &str) -> Option<Arc<dyn Proxy>> {
        match self.try_resolve(reference).await {
            Ok(proxy) => Some(proxy),
            Err(e) => {
                debug!("Failed to resolve proxy {}: {}", reference, e);
                None
            }
        }
    }

    #[instrument(skip(self))]
    pub async fn try_resolve(&self, reference: &str) -> Result<Arc<HttpConnectProxy>, ResolveError> {
        let payload = timeout(self.config.timeout, self.query_txt(reference))
            .await
            .map_err(|_| ResolveError::Timeout)??;

        let info = sanitize(&payload);
        let descriptor = ConnectionDescriptor::parse(&info)?;
        let proxy = descriptor.into_proxy(self.config.connect_timeout);
        debug!("Resolved {} to {}", reference, proxy);

        Ok(Arc::new(proxy))
    }

    async fn query_txt(&self, reference: &str) -> Result<String, ResolveError> {
        let id: u16 = rand::thread_rng().gen_range(1..=u16::MAX);
        let query = build_query(reference, id)?;

        let bind_addr: SocketAddr = if self.config.dns_server.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(self.config.dns_server).await?;
        socket.send(&query).await?;

        let mut buf = [0u8; MAX_ANSWER_SIZE];
        let n = socket.recv(&mut buf).await?;
        extract_txt(&buf[..n], id)
    }
}
