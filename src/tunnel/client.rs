//! Multiplexed tunnel client
//!
//! One client owns one authenticated channel to a relay. Outgoing frames are written under
//! an async lock so stream ids hit the wire in allocation order; incoming frames are decoded
//! by a single dispatch task that applies flow control and routes per-stream frames into
//! per-stream queues.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use super::connector::{Channel, ChannelConnector, NegotiatedChannel};
use super::frame::{
    Frame, FrameDecoder, FrameEncoder, HeaderBlock, Setting, DEFAULT_WINDOW_SIZE,
    SETTINGS_INITIAL_WINDOW_SIZE,
};
use crate::error::{RelayError, Result};

/// Sub-protocol the relay must confirm during channel setup
pub const TUNNEL_PROTOCOL: &str = "spdy/3";

const READ_BUFFER_SIZE: usize = 16 * 1024;
const MAX_WINDOW_SIZE: u32 = 0x7fff_ffff;
const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Tunnel lifecycle; `Closed` is terminal
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting = 0,
    Open = 1,
    Closed = 2,
}

impl From<u8> for TunnelState {
    fn from(val: u8) -> Self {
        match val {
            1 => TunnelState::Open,
            2 => TunnelState::Closed,
            _ => TunnelState::Connecting,
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelState::Connecting => write!(f, "connecting"),
            TunnelState::Open => write!(f, "open"),
            TunnelState::Closed => write!(f, "closed"),
        }
    }
}

/// Receive-side flow control for the whole tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowControl {
    window_size: u32,
    current_window: u32,
}

impl Default for FlowControl {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            current_window: 0,
        }
    }
}

impl FlowControl {
    pub fn window_size(&self) -> u32 {
        self.window_size
    }

    /// Bytes received since the last window update
    pub fn current_window(&self) -> u32 {
        self.current_window
    }

    /// Apply a SETTINGS frame; returns the new window size if it changed
    ///
    /// Sizes outside `1..=2^31-1` cannot be announced in a WINDOW_UPDATE and are ignored.
    pub fn apply_settings(&mut self, entries: &[Setting]) -> Option<u32> {
        let value = entries
            .iter()
            .find(|e| e.id == SETTINGS_INITIAL_WINDOW_SIZE)
            .map(|e| e.value)?;
        if value == 0 || value > MAX_WINDOW_SIZE {
            warn!("Ignoring invalid initial window size {}", value);
            return None;
        }
        self.window_size = value;
        Some(value)
    }

    /// Account for a received DATA payload; returns the delta to announce once half the
    /// window has been consumed
    pub fn on_data(&mut self, len: usize) -> Option<u32> {
        if len == 0 {
            return None;
        }
        let len = u32::try_from(len).unwrap_or(u32::MAX);
        self.current_window = self.current_window.saturating_add(len);
        if self.current_window >= (self.window_size / 2).max(1) {
            self.current_window = 0;
            Some(self.window_size)
        } else {
            None
        }
    }
}

type StreamMap = DashMap<u32, mpsc::UnboundedSender<Frame>>;

/// Receiving side of one logical stream
///
/// Dropping the handle deregisters the stream, so an abandoned exchange stops
/// accumulating frames.
pub struct StreamHandle {
    stream_id: u32,
    frames: mpsc::UnboundedReceiver<Frame>,
    streams: Arc<StreamMap>,
}

impl StreamHandle {
    pub fn id(&self) -> u32 {
        self.stream_id
    }

    /// Next frame in wire order, or `None` once the stream ended or the tunnel closed
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.frames.recv().await
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.streams.remove(&self.stream_id);
    }
}

struct Outbound {
    writer: WriteHalf<Box<dyn Channel>>,
    encoder: FrameEncoder,
    buf: BytesMut,
    next_stream_id: u32,
}

impl Outbound {
    fn allocate_stream_id(&mut self) -> u32 {
        let id = self.next_stream_id;
        self.next_stream_id += 2;
        id
    }

    async fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        self.buf.clear();
        self.encoder.encode(frame, &mut self.buf)?;
        self.writer.write_all(&self.buf).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

/// Client side of a multiplexed relay tunnel
pub struct TunnelClient {
    endpoint: String,
    state: AtomicU8,
    outbound: tokio::sync::Mutex<Option<Outbound>>,
    reader: Mutex<Option<ReadHalf<Box<dyn Channel>>>>,
    flow: Mutex<FlowControl>,
    streams: Arc<StreamMap>,
    dispatch: Mutex<Option<JoinHandle<()>>>,
}

impl TunnelClient {
    /// Open a channel to `host:port` and confirm the tunnel sub-protocol
    #[instrument(skip(connector))]
    pub async fn connect(connector: &dyn ChannelConnector, host: &str, port: u16) -> Result<Arc<Self>> {
        let endpoint = format!("{}:{}", host, port);
        debug!(state = %TunnelState::Connecting, "Opening tunnel channel to {}", endpoint);

        let NegotiatedChannel { channel, protocol } = connector.open(host, port).await?;
        if protocol.as_deref() != Some(TUNNEL_PROTOCOL) {
            return Err(RelayError::Negotiation {
                expected: TUNNEL_PROTOCOL.to_string(),
                negotiated: protocol,
            });
        }

        info!("Tunnel to {} is open", endpoint);
        Ok(Arc::new(Self::from_channel(endpoint, channel)))
    }

    fn from_channel(endpoint: String, channel: Box<dyn Channel>) -> Self {
        let (reader, writer) = tokio::io::split(channel);
        Self {
            endpoint,
            state: AtomicU8::new(TunnelState::Open as u8),
            outbound: tokio::sync::Mutex::new(Some(Outbound {
                writer,
                encoder: FrameEncoder::new(),
                buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
                next_stream_id: 1,
            })),
            reader: Mutex::new(Some(reader)),
            flow: Mutex::new(FlowControl::default()),
            streams: Arc::new(DashMap::new()),
            dispatch: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> TunnelState {
        TunnelState::from(self.state.load(Ordering::Acquire))
    }

    pub fn window_size(&self) -> u32 {
        self.flow.lock().window_size()
    }

    pub fn current_window(&self) -> u32 {
        self.flow.lock().current_window()
    }

    /// Streams whose queues are still registered
    pub fn open_streams(&self) -> usize {
        self.streams.len()
    }

    /// Start the dispatch loop on its own task
    pub fn spawn_dispatch(self: &Arc<Self>) {
        let handle = tokio::spawn(self.clone().run_dispatch_loop());
        *self.dispatch.lock() = Some(handle);
    }

    /// Open a stream carrying `headers`; the reply arrives through the returned handle
    pub async fn open_stream(&self, headers: HeaderBlock) -> Result<StreamHandle> {
        self.open_stream_with_body(headers, Bytes::new()).await
    }

    /// Open a stream and send `body` as DATA frames; FIN goes on the last frame written
    pub async fn open_stream_with_body(
        &self,
        headers: HeaderBlock,
        body: Bytes,
    ) -> Result<StreamHandle> {
        if self.state() != TunnelState::Open {
            return Err(RelayError::TunnelClosed);
        }

        let mut guard = self.outbound.lock().await;
        let outbound = guard.as_mut().ok_or(RelayError::TunnelClosed)?;

        let stream_id = outbound.allocate_stream_id();
        let (tx, rx) = mpsc::unbounded_channel();
        self.streams.insert(stream_id, tx);
        let handle = StreamHandle {
            stream_id,
            frames: rx,
            streams: self.streams.clone(),
        };

        outbound
            .write_frame(&Frame::SynStream {
                stream_id,
                headers,
                fin: body.is_empty(),
            })
            .await?;

        let mut body = body;
        while !body.is_empty() {
            let chunk = body.split_to(body.len().min(MAX_DATA_CHUNK));
            outbound
                .write_frame(&Frame::Data {
                    stream_id,
                    data: chunk,
                    fin: body.is_empty(),
                })
                .await?;
        }
        debug!(stream_id, "Opened stream on {}", self.endpoint);

        Ok(handle)
    }

    /// Encode and write one frame
    pub async fn send(&self, frame: &Frame) -> Result<()> {
        let mut guard = self.outbound.lock().await;
        let outbound = guard.as_mut().ok_or(RelayError::TunnelClosed)?;
        outbound.write_frame(frame).await
    }

    /// Read, decode and route frames until the channel closes or fails
    pub async fn run_dispatch_loop(self: Arc<Self>) {
        let Some(mut reader) = self.reader.lock().take() else {
            warn!("Dispatch loop for {} is already running", self.endpoint);
            return;
        };

        let mut decoder = FrameDecoder::new();
        let mut buf = vec![0u8; READ_BUFFER_SIZE];

        let result: Result<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    return Ok(());
                }
                decoder.feed(&buf[..n]);
                while let Some(frame) = decoder.next_frame()? {
                    self.dispatch_frame(frame).await?;
                }
            }
        }
        .await;

        match result {
            Ok(()) => info!("Tunnel {} closed by peer", self.endpoint),
            Err(e) => error!("Tunnel {} dispatch loop failed: {}", self.endpoint, e),
        }

        self.state.store(TunnelState::Closed as u8, Ordering::Release);
        self.streams.clear();
    }

    async fn dispatch_frame(&self, frame: Frame) -> Result<()> {
        match &frame {
            Frame::Settings { entries } => {
                if let Some(window_size) = self.flow.lock().apply_settings(entries) {
                    info!("Tunnel {} window size set to {}", self.endpoint, window_size);
                }
            }
            Frame::Data {
                stream_id, data, ..
            } => {
                let update = self.flow.lock().on_data(data.len());
                if let Some(delta) = update {
                    self.send(&Frame::WindowUpdate {
                        stream_id: *stream_id,
                        delta,
                    })
                    .await?;
                }
            }
            Frame::Ping { id } => {
                self.send(&Frame::Ping { id: *id }).await?;
            }
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                info!(
                    "Tunnel {} received GOAWAY (last stream {}, status {})",
                    self.endpoint, last_good_stream_id, status
                );
            }
            _ => {}
        }

        let Some(stream_id) = frame.stream_id() else {
            return Ok(());
        };
        let terminal = frame.is_terminal();

        {
            match self.streams.get(&stream_id) {
                Some(queue) => {
                    // A dropped receiver removes its own entry
                    let _ = queue.send(frame);
                }
                None => debug!(stream_id, kind = frame.kind(), "Dropping frame for unknown stream"),
            }
        }

        if terminal {
            self.streams.remove(&stream_id);
        }

        Ok(())
    }

    /// Best-effort shutdown; errors are swallowed
    pub async fn close(&self) {
        self.state.store(TunnelState::Closed as u8, Ordering::Release);

        if let Some(mut outbound) = self.outbound.lock().await.take() {
            let _ = outbound.writer.shutdown().await;
        }
        self.reader.lock().take();

        let dispatch = self.dispatch.lock().take();
        if let Some(handle) = dispatch {
            handle.abort();
        }

        self.streams.clear();
        debug!("Tunnel {} closed", self.endpoint);
    }
}

impl fmt::Display for TunnelClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TunnelClient[{} {}]", self.endpoint, self.state())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::testing::{FakeRelay, StaticConnector};
    use std::time::Duration;
    use tokio::time::timeout;

    async fn open_pair() -> (Arc<TunnelClient>, FakeRelay) {
        let (connector, relay) = StaticConnector::pair(Some(TUNNEL_PROTOCOL));
        let client = TunnelClient::connect(&connector, "relay.test", 443)
            .await
            .unwrap();
        client.spawn_dispatch();
        (client, relay)
    }

    #[test]
    fn test_flow_control_half_window() {
        let mut flow = FlowControl::default();
        assert_eq!(flow.window_size(), 65536);

        assert_eq!(flow.on_data(16384), None);
        assert_eq!(flow.current_window(), 16384);
        assert_eq!(flow.on_data(16384), Some(65536));
        assert_eq!(flow.current_window(), 0);
        assert_eq!(flow.on_data(100), None);
    }

    #[test]
    fn test_flow_control_settings() {
        let mut flow = FlowControl::default();
        assert_eq!(
            flow.apply_settings(&[Setting {
                flags: 0,
                id: 4,
                value: 100
            }]),
            None
        );
        assert_eq!(flow.window_size(), 65536);

        assert_eq!(
            flow.apply_settings(&[Setting {
                flags: 0,
                id: SETTINGS_INITIAL_WINDOW_SIZE,
                value: 1000
            }]),
            Some(1000)
        );
        assert_eq!(flow.on_data(499), None);
        assert_eq!(flow.on_data(1), Some(1000));
    }

    #[test]
    fn test_flow_control_never_announces_zero_delta() {
        let mut flow = FlowControl::default();
        let window = |value| {
            [Setting {
                flags: 0,
                id: SETTINGS_INITIAL_WINDOW_SIZE,
                value,
            }]
        };

        assert_eq!(flow.apply_settings(&window(0)), None);
        assert_eq!(flow.apply_settings(&window(0x8000_0000)), None);
        assert_eq!(flow.window_size(), 65536);
        assert_eq!(flow.on_data(1), None);

        assert_eq!(flow.apply_settings(&window(1)), Some(1));
        assert_eq!(flow.on_data(0), None);
        assert_eq!(flow.on_data(1), Some(1));
        assert_eq!(flow.on_data(1), Some(1));
    }

    #[test]
    fn test_tunnel_state_from_u8() {
        assert_eq!(TunnelState::from(0), TunnelState::Connecting);
        assert_eq!(TunnelState::from(1), TunnelState::Open);
        assert_eq!(TunnelState::from(2), TunnelState::Closed);
        assert_eq!(TunnelState::Closed.to_string(), "closed");
    }

    #[tokio::test]
    async fn test_connect_rejects_wrong_protocol() {
        let (connector, _relay) = StaticConnector::pair(Some("http/1.1"));
        let err = TunnelClient::connect(&connector, "relay.test", 443)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            RelayError::Negotiation { negotiated: Some(ref p), .. } if p == "http/1.1"
        ));

        let (connector, _relay) = StaticConnector::pair(None);
        assert!(TunnelClient::connect(&connector, "relay.test", 443)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_open_stream_sends_syn_stream_with_odd_ids() {
        let (client, mut relay) = open_pair().await;
        assert_eq!(client.state(), TunnelState::Open);

        let first = client
            .open_stream(vec![(":method".into(), "GET".into())])
            .await
            .unwrap();
        let second = client.open_stream(Vec::new()).await.unwrap();
        assert_eq!(first.id(), 1);
        assert_eq!(second.id(), 3);
        assert_eq!(client.open_streams(), 2);

        match relay.read_frame().await {
            Frame::SynStream {
                stream_id,
                headers,
                fin,
            } => {
                assert_eq!(stream_id, 1);
                assert!(fin);
                assert_eq!(headers, vec![(":method".to_string(), "GET".to_string())]);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        assert_eq!(relay.read_frame().await.stream_id(), Some(3));
    }

    #[tokio::test]
    async fn test_open_stream_with_body_sends_data_with_fin() {
        let (client, mut relay) = open_pair().await;

        let body = Bytes::from(vec![b'b'; MAX_DATA_CHUNK + 10]);
        let _stream = client
            .open_stream_with_body(Vec::new(), body)
            .await
            .unwrap();

        assert!(matches!(
            relay.read_frame().await,
            Frame::SynStream { fin: false, .. }
        ));
        match relay.read_frame().await {
            Frame::Data { data, fin, .. } => {
                assert_eq!(data.len(), MAX_DATA_CHUNK);
                assert!(!fin);
            }
            other => panic!("unexpected frame {:?}", other),
        }
        match relay.read_frame().await {
            Frame::Data { data, fin, .. } => {
                assert_eq!(data.len(), 10);
                assert!(fin);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_window_update_after_half_window() {
        let (client, mut relay) = open_pair().await;
        let mut stream = client.open_stream(Vec::new()).await.unwrap();
        relay.read_frame().await;

        for _ in 0..2 {
            relay
                .write_frame(&Frame::Data {
                    stream_id: 1,
                    data: Bytes::from(vec![b'x'; 16384]),
                    fin: false,
                })
                .await;
        }

        assert_eq!(
            relay.read_frame().await,
            Frame::WindowUpdate {
                stream_id: 1,
                delta: 65536
            }
        );

        relay
            .write_frame(&Frame::Data {
                stream_id: 1,
                data: Bytes::from(vec![b'y'; 1000]),
                fin: false,
            })
            .await;
        relay.write_frame(&Frame::Ping { id: 2 }).await;

        // The ping echo proves no second window update was emitted
        assert_eq!(relay.read_frame().await, Frame::Ping { id: 2 });
        assert_eq!(client.current_window(), 1000);

        for _ in 0..3 {
            assert!(matches!(
                stream.next_frame().await,
                Some(Frame::Data { .. })
            ));
        }
    }

    #[tokio::test]
    async fn test_settings_change_window_size() {
        let (client, mut relay) = open_pair().await;

        relay
            .write_frame(&Frame::Settings {
                entries: vec![Setting {
                    flags: 0,
                    id: SETTINGS_INITIAL_WINDOW_SIZE,
                    value: 1000,
                }],
            })
            .await;
        relay.write_frame(&Frame::Ping { id: 4 }).await;
        assert_eq!(relay.read_frame().await, Frame::Ping { id: 4 });
        assert_eq!(client.window_size(), 1000);

        relay
            .write_frame(&Frame::Data {
                stream_id: 9,
                data: Bytes::from(vec![0u8; 500]),
                fin: false,
            })
            .await;
        assert_eq!(
            relay.read_frame().await,
            Frame::WindowUpdate {
                stream_id: 9,
                delta: 1000
            }
        );
    }

    #[tokio::test]
    async fn test_zero_window_setting_is_ignored() {
        let (client, mut relay) = open_pair().await;

        relay
            .write_frame(&Frame::Settings {
                entries: vec![Setting {
                    flags: 0,
                    id: SETTINGS_INITIAL_WINDOW_SIZE,
                    value: 0,
                }],
            })
            .await;
        relay
            .write_frame(&Frame::Data {
                stream_id: 1,
                data: Bytes::from_static(b"x"),
                fin: false,
            })
            .await;
        relay.write_frame(&Frame::Ping { id: 8 }).await;

        // Only the ping echo comes back: no window update for a single byte
        assert_eq!(relay.read_frame().await, Frame::Ping { id: 8 });
        assert_eq!(client.window_size(), 65536);
        assert_eq!(client.current_window(), 1);
    }

    #[tokio::test]
    async fn test_terminal_frame_deregisters_stream() {
        let (client, mut relay) = open_pair().await;
        let mut stream = client.open_stream(Vec::new()).await.unwrap();
        relay.read_frame().await;

        relay
            .write_frame(&Frame::Data {
                stream_id: 1,
                data: Bytes::from_static(b"done"),
                fin: true,
            })
            .await;
        relay.write_frame(&Frame::Ping { id: 6 }).await;
        relay.read_frame().await;

        assert_eq!(client.open_streams(), 0);
        assert!(matches!(
            stream.next_frame().await,
            Some(Frame::Data { fin: true, .. })
        ));
        assert_eq!(stream.next_frame().await, None);
    }

    #[tokio::test]
    async fn test_abandoned_stream_is_removed() {
        let (client, _relay) = open_pair().await;

        for _ in 0..8 {
            let stream = client.open_stream(Vec::new()).await.unwrap();
            drop(stream);
        }
        assert_eq!(client.open_streams(), 0);
    }

    #[tokio::test]
    async fn test_peer_close_ends_streams() {
        let (client, relay) = open_pair().await;
        let mut stream = client.open_stream(Vec::new()).await.unwrap();

        drop(relay);

        let next = timeout(Duration::from_secs(1), stream.next_frame())
            .await
            .expect("stream should end when the tunnel closes");
        assert_eq!(next, None);
        assert_eq!(client.state(), TunnelState::Closed);
        assert!(matches!(
            client.open_stream(Vec::new()).await,
            Err(RelayError::TunnelClosed)
        ));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _relay) = open_pair().await;
        client.close().await;
        client.close().await;

        assert_eq!(client.state(), TunnelState::Closed);
        assert!(matches!(
            client.send(&Frame::Ping { id: 1 }).await,
            Err(RelayError::TunnelClosed)
        ));
    }
}
