//! Downstream client connection
//!
//! Reads the pending request head from an accepted connection and carries the state a
//! forward attempt needs: the downstream writer, whether any response bytes already
//! reached the client, and why the last attempt fell back.

use std::fmt;

use bytes::{Bytes, BytesMut};
use http::StatusCode;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, warn};
use url::Url;

use super::{ForwardOutcome, Protocol};
use crate::error::{RelayError, Result};
use crate::tunnel::Channel;

const MAX_HEAD_SIZE: usize = 64 * 1024;
const MAX_HEADERS: usize = 96;
const MAX_BUFFERED_BODY: u64 = 1024 * 1024;

/// Parsed request line and headers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    pub host: String,
    pub headers: Vec<(String, String)>,
    raw: Bytes,
    head_len: usize,
}

impl RequestHead {
    /// Parse a buffered request head; `None` means more bytes are needed
    pub fn parse(buf: &[u8]) -> Result<Option<Self>> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf) {
            Ok(httparse::Status::Partial) => Ok(None),
            Ok(httparse::Status::Complete(head_len)) => {
                let method = req.method.unwrap_or_default().to_string();
                let path = req.path.unwrap_or_default().to_string();
                let headers: Vec<(String, String)> = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();

                let host = headers
                    .iter()
                    .find(|(name, _)| name.eq_ignore_ascii_case("host"))
                    .map(|(_, value)| value.clone())
                    .or_else(|| authority_of(&method, &path))
                    .ok_or_else(|| RelayError::InvalidRequest("Missing host".to_string()))?;

                Ok(Some(Self {
                    method,
                    path,
                    host,
                    headers,
                    raw: Bytes::copy_from_slice(buf),
                    head_len,
                }))
            }
            Err(e) => Err(RelayError::InvalidRequest(format!(
                "Malformed request head: {}",
                e
            ))),
        }
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    pub fn protocol(&self) -> Protocol {
        if self.is_connect() {
            Protocol::Https
        } else {
            Protocol::Http
        }
    }

    /// Request bytes as received, including any body bytes read with the head
    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    /// Bytes that followed the head in the same reads
    pub fn body(&self) -> &[u8] {
        &self.raw[self.head_len..]
    }

    /// Declared body length; `None` when absent or unparsable
    pub fn content_length(&self) -> Option<u64> {
        self.header("content-length")
            .and_then(|value| value.trim().parse().ok())
    }

    /// Declared body bytes not read yet
    fn missing_body(&self) -> u64 {
        self.content_length()
            .unwrap_or(0)
            .saturating_sub(self.body().len() as u64)
    }

    /// The whole request body, if it has been read along with the head
    ///
    /// Chunked bodies and bodies still in flight are never complete here.
    pub fn buffered_body(&self) -> Option<&[u8]> {
        if self.header("transfer-encoding").is_some() {
            return None;
        }
        match self.content_length() {
            Some(len) if self.missing_body() == 0 => Some(&self.body()[..len as usize]),
            Some(_) => None,
            None => Some(&[]),
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Host and port the request is ultimately addressed to
    pub fn target(&self) -> Result<(String, u16)> {
        if self.is_connect() {
            return parse_host_port(&self.path, "https");
        }

        let authority = authority_of(&self.method, &self.path).unwrap_or_else(|| self.host.clone());
        parse_host_port(&authority, "http")
    }
}

/// Authority of an absolute-form or authority-form request target
fn authority_of(method: &str, path: &str) -> Option<String> {
    if method.eq_ignore_ascii_case("CONNECT") {
        return Some(path.to_string());
    }
    let uri: http::Uri = path.parse().ok()?;
    uri.authority().map(|a| a.as_str().to_string())
}

fn parse_host_port(authority: &str, scheme: &str) -> Result<(String, u16)> {
    // URL parsing handles bracketed IPv6 like "[::1]:8080".
    let url = Url::parse(&format!("{}://{}", scheme, authority)).map_err(|e| {
        RelayError::InvalidRequest(format!("Invalid target '{}': {}", authority, e))
    })?;

    let host = url.host_str().ok_or_else(|| {
        RelayError::InvalidRequest(format!("Invalid target '{}': missing host", authority))
    })?;
    let host = host
        .strip_prefix('[')
        .and_then(|h| h.strip_suffix(']'))
        .unwrap_or(host);

    let port = url.port_or_known_default().ok_or_else(|| {
        RelayError::InvalidRequest(format!("Invalid target '{}': missing port", authority))
    })?;

    Ok((host.to_string(), port))
}

/// An accepted client connection with its pending request
pub struct ClientConnection {
    peer: String,
    request: RequestHead,
    downstream: Box<dyn Channel>,
    forward_started: bool,
    fallback_reason: Option<String>,
}

impl ClientConnection {
    pub fn new(peer: impl Into<String>, request: RequestHead, downstream: Box<dyn Channel>) -> Self {
        Self {
            peer: peer.into(),
            request,
            downstream,
            forward_started: false,
            fallback_reason: None,
        }
    }

    /// Read from `stream` until a complete request head has arrived
    pub async fn read_request<S: Channel>(stream: S, peer: impl Into<String>) -> Result<Self> {
        let mut stream: Box<dyn Channel> = Box::new(stream);
        let mut buf = BytesMut::with_capacity(4096);

        loop {
            if buf.len() >= MAX_HEAD_SIZE {
                return Err(RelayError::InvalidRequest(
                    "Request head too large".to_string(),
                ));
            }

            let n = stream.read_buf(&mut buf).await?;
            if n == 0 {
                return Err(RelayError::InvalidRequest(
                    "Connection closed before request head".to_string(),
                ));
            }

            if let Some(request) = RequestHead::parse(&buf)? {
                let request = Self::read_body(&mut stream, buf, request).await?;
                let client = Self::new(peer, request, stream);
                debug!("Accepted {}", client);
                return Ok(client);
            }
        }
    }

    /// Keep reading until a declared body of bounded size is buffered
    async fn read_body(
        stream: &mut Box<dyn Channel>,
        mut buf: BytesMut,
        mut request: RequestHead,
    ) -> Result<RequestHead> {
        if request.content_length().unwrap_or(0) > MAX_BUFFERED_BODY {
            return Ok(request);
        }

        while request.missing_body() > 0 {
            if stream.read_buf(&mut buf).await? == 0 {
                return Err(RelayError::InvalidRequest(
                    "Connection closed before request body".to_string(),
                ));
            }
            if let Some(parsed) = RequestHead::parse(&buf)? {
                request = parsed;
            }
        }
        Ok(request)
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn request(&self) -> &RequestHead {
        &self.request
    }

    pub fn protocol(&self) -> Protocol {
        self.request.protocol()
    }

    /// Whether any response bytes were written to the client
    pub fn forward_started(&self) -> bool {
        self.forward_started
    }

    pub fn mark_forward_started(&mut self) {
        self.forward_started = true;
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        self.downstream.write_all(data).await?;
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.downstream.flush().await?;
        Ok(())
    }

    pub fn downstream_mut(&mut self) -> &mut Box<dyn Channel> {
        &mut self.downstream
    }

    /// Give up on the current upstream so the caller can try another one
    pub fn fall_back(&mut self, reason: impl Into<String>) -> ForwardOutcome {
        let reason = reason.into();
        match &self.fallback_reason {
            Some(first) => warn!(
                "[{}] fallback requested twice ({}), keeping: {}",
                self, reason, first
            ),
            None => {
                debug!("[{}] fall back: {}", self, reason);
                self.fallback_reason = Some(reason.clone());
            }
        }
        ForwardOutcome::Fallback { reason }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        self.fallback_reason.as_deref()
    }

    /// Reset per-attempt state before handing the client to another upstream
    pub fn begin_attempt(&mut self) {
        self.fallback_reason = None;
    }

    /// Answer with a bare status response when no upstream could serve the request
    pub async fn respond_error(&mut self, status: StatusCode, message: &str) -> Result<()> {
        let response = format!(
            "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            message.len(),
            message
        );
        self.write_all(response.as_bytes()).await?;
        self.flush().await
    }
}

impl fmt::Display for ClientConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {}",
            self.peer, self.request.method, self.request.host
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_absolute_form_request() {
        let head = RequestHead::parse(
            b"GET http://example.com:8080/index.html HTTP/1.1\r\nHost: example.com:8080\r\nUser-Agent: test\r\n\r\n",
        )
        .unwrap()
        .unwrap();

        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "http://example.com:8080/index.html");
        assert_eq!(head.host, "example.com:8080");
        assert_eq!(head.header("user-agent"), Some("test"));
        assert_eq!(head.protocol(), Protocol::Http);
        assert_eq!(head.target().unwrap(), ("example.com".to_string(), 8080));
    }

    #[test]
    fn test_parse_partial_head() {
        assert!(RequestHead::parse(b"GET http://example.com/ HTTP/1.1\r\nHost: exa")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = RequestHead::parse(b"\x00\x01 nonsense\r\n\r\n").unwrap_err();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[test]
    fn test_body_bytes_after_head() {
        let head = RequestHead::parse(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n\x16\x03\x01")
            .unwrap()
            .unwrap();
        assert_eq!(head.body(), b"\x16\x03\x01");
        assert_eq!(head.raw().len(), head.body().len() + 36);
    }

    #[test]
    fn test_host_from_absolute_uri_when_header_missing() {
        let head = RequestHead::parse(b"GET http://example.org/a HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.host, "example.org");
        assert_eq!(head.target().unwrap(), ("example.org".to_string(), 80));
    }

    #[test]
    fn test_connect_target_defaults_and_ipv6() {
        let head = RequestHead::parse(b"CONNECT example.com HTTP/1.1\r\n\r\n")
            .unwrap()
            .unwrap();
        assert!(head.is_connect());
        assert_eq!(head.protocol(), Protocol::Https);
        assert_eq!(head.target().unwrap(), ("example.com".to_string(), 443));

        let head = RequestHead::parse(b"CONNECT [::1]:8443 HTTP/1.1\r\nHost: [::1]:8443\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.target().unwrap(), ("::1".to_string(), 8443));
    }

    #[tokio::test]
    async fn test_read_request_across_reads() {
        let (mut browser, local) = tokio::io::duplex(4096);

        let reader = tokio::spawn(async move { ClientConnection::read_request(local, "test").await });

        browser
            .write_all(b"GET http://example.com/ HTTP/1.1\r\n")
            .await
            .unwrap();
        tokio::task::yield_now().await;
        browser.write_all(b"Host: example.com\r\n\r\n").await.unwrap();

        let client = reader.await.unwrap().unwrap();
        assert_eq!(client.request().host, "example.com");
        assert!(!client.forward_started());
        assert!(client.request().raw().ends_with(b"\r\n\r\n"));
        assert!(client.request().body().is_empty());
    }

    #[tokio::test]
    async fn test_read_request_keeps_bytes_after_head() {
        let stream = tokio_test::io::Builder::new()
            .read(b"CONNECT example.com:443 HTTP/1.1\r\n")
            .read(b"Host: example.com:443\r\n\r\n\x16\x03\x01")
            .build();

        let client = ClientConnection::read_request(stream, "test").await.unwrap();
        assert_eq!(client.protocol(), Protocol::Https);
        assert_eq!(client.request().body(), b"\x16\x03\x01");
        assert_eq!(client.to_string(), "test CONNECT example.com:443");
    }

    #[tokio::test]
    async fn test_read_request_waits_for_declared_body() {
        let stream = tokio_test::io::Builder::new()
            .read(b"POST http://example.com/form HTTP/1.1\r\nHost: example.com\r\nContent-Length: 9\r\n\r\nname")
            .read(b"=test")
            .build();

        let client = ClientConnection::read_request(stream, "test").await.unwrap();
        assert_eq!(client.request().content_length(), Some(9));
        assert_eq!(client.request().buffered_body(), Some(&b"name=test"[..]));
    }

    #[test]
    fn test_buffered_body() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.buffered_body(), Some(&b""[..]));

        // Bytes past the declared length belong to the next request
        let head = RequestHead::parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 2\r\n\r\nokGET")
            .unwrap()
            .unwrap();
        assert_eq!(head.buffered_body(), Some(&b"ok"[..]));

        let head = RequestHead::parse(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5000000\r\n\r\nok")
            .unwrap()
            .unwrap();
        assert_eq!(head.buffered_body(), None);

        let head = RequestHead::parse(
            b"POST / HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n2\r\nok\r\n0\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert_eq!(head.buffered_body(), None);
    }

    #[tokio::test]
    async fn test_read_request_leaves_large_body_streaming() {
        let stream = tokio_test::io::Builder::new()
            .read(b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5000000\r\n\r\nok")
            .build();

        let client = ClientConnection::read_request(stream, "test").await.unwrap();
        assert_eq!(client.request().body(), b"ok");
    }

    #[tokio::test]
    async fn test_read_request_eof() {
        let (browser, local) = tokio::io::duplex(4096);
        drop(browser);
        let err = ClientConnection::read_request(local, "test")
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RelayError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_fall_back_keeps_first_reason() {
        let (_browser, local) = tokio::io::duplex(64);
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: a\r\n\r\n")
            .unwrap()
            .unwrap();
        let mut client = ClientConnection::new("test", head, Box::new(local));

        assert!(client.fall_back("first").is_fallback());
        client.fall_back("second");
        assert_eq!(client.fallback_reason(), Some("first"));

        client.begin_attempt();
        assert_eq!(client.fallback_reason(), None);
    }
}
