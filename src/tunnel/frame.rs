//! Multiplexed tunnel frames
//!
//! Binary layout follows SPDY/3 framing: an 8 byte header (control bit, version and type
//! for control frames, stream id for data frames, then flags and a 24 bit length) followed
//! by the payload. Name/value header blocks are zlib compressed with one context per
//! direction, so an encoder or decoder belongs to exactly one tunnel.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use super::compression::{HeaderDeflater, HeaderInflater};

/// Protocol version carried in every control frame
pub const VERSION: u16 = 3;

/// FIN flag on SYN_STREAM, SYN_REPLY, HEADERS and DATA frames
pub const FLAG_FIN: u8 = 0x01;

/// SETTINGS id for the initial per-stream window size
pub const SETTINGS_INITIAL_WINDOW_SIZE: u32 = 7;

/// Window size assumed until the peer says otherwise
pub const DEFAULT_WINDOW_SIZE: u32 = 65536;

const HEADER_LEN: usize = 8;
const MAX_LENGTH: usize = 0x00ff_ffff;
const STREAM_ID_MASK: u32 = 0x7fff_ffff;

const TYPE_SYN_STREAM: u16 = 1;
const TYPE_SYN_REPLY: u16 = 2;
const TYPE_RST_STREAM: u16 = 3;
const TYPE_SETTINGS: u16 = 4;
const TYPE_PING: u16 = 6;
const TYPE_GOAWAY: u16 = 7;
const TYPE_HEADERS: u16 = 8;
const TYPE_WINDOW_UPDATE: u16 = 9;

/// Ordered name/value pairs; names are lower-case on the wire
pub type HeaderBlock = Vec<(String, String)>;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u16),

    #[error("frame type {frame_type} is too short ({len} bytes)")]
    Truncated { frame_type: u16, len: usize },

    #[error("invalid header block: {0}")]
    InvalidHeaderBlock(String),

    #[error("frame payload of {0} bytes exceeds the 24 bit length field")]
    TooLarge(usize),

    #[error("header compression failed: {0}")]
    Compression(String),
}

/// One SETTINGS entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Setting {
    pub flags: u8,
    pub id: u32,
    pub value: u32,
}

/// A decoded tunnel frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    SynStream {
        stream_id: u32,
        headers: HeaderBlock,
        fin: bool,
    },
    SynReply {
        stream_id: u32,
        headers: HeaderBlock,
        fin: bool,
    },
    RstStream {
        stream_id: u32,
        status: u32,
    },
    Settings {
        entries: Vec<Setting>,
    },
    Ping {
        id: u32,
    },
    GoAway {
        last_good_stream_id: u32,
        status: u32,
    },
    Headers {
        stream_id: u32,
        headers: HeaderBlock,
        fin: bool,
    },
    WindowUpdate {
        stream_id: u32,
        delta: u32,
    },
    Data {
        stream_id: u32,
        data: Bytes,
        fin: bool,
    },
    /// Control frame of a type this client does not act on
    Unknown {
        frame_type: u16,
        flags: u8,
    },
}

impl Frame {
    /// Stream this frame belongs to, if it is a per-stream frame
    pub fn stream_id(&self) -> Option<u32> {
        match self {
            Frame::SynStream { stream_id, .. }
            | Frame::SynReply { stream_id, .. }
            | Frame::RstStream { stream_id, .. }
            | Frame::Headers { stream_id, .. }
            | Frame::WindowUpdate { stream_id, .. }
            | Frame::Data { stream_id, .. } => Some(*stream_id),
            Frame::Settings { .. }
            | Frame::Ping { .. }
            | Frame::GoAway { .. }
            | Frame::Unknown { .. } => None,
        }
    }

    /// Whether the peer will send nothing more on this frame's stream
    pub fn is_terminal(&self) -> bool {
        match self {
            Frame::SynReply { fin, .. } | Frame::Headers { fin, .. } | Frame::Data { fin, .. } => {
                *fin
            }
            Frame::RstStream { .. } => true,
            _ => false,
        }
    }

    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::SynStream { .. } => "SYN_STREAM",
            Frame::SynReply { .. } => "SYN_REPLY",
            Frame::RstStream { .. } => "RST_STREAM",
            Frame::Settings { .. } => "SETTINGS",
            Frame::Ping { .. } => "PING",
            Frame::GoAway { .. } => "GOAWAY",
            Frame::Headers { .. } => "HEADERS",
            Frame::WindowUpdate { .. } => "WINDOW_UPDATE",
            Frame::Data { .. } => "DATA",
            Frame::Unknown { .. } => "UNKNOWN",
        }
    }
}

/// Serializes frames for one direction of a tunnel
#[derive(Debug, Default)]
pub struct FrameEncoder {
    deflater: HeaderDeflater,
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serialize `frame` onto `dst`
    pub fn encode(&mut self, frame: &Frame, dst: &mut BytesMut) -> Result<(), FrameError> {
        match frame {
            Frame::Data {
                stream_id,
                data,
                fin,
            } => {
                check_len(data.len())?;
                dst.reserve(HEADER_LEN + data.len());
                dst.put_u32(stream_id & STREAM_ID_MASK);
                put_flags_len(dst, fin_flag(*fin), data.len());
                dst.put_slice(data);
                Ok(())
            }
            Frame::SynStream {
                stream_id,
                headers,
                fin,
            } => {
                let mut payload = BytesMut::new();
                payload.put_u32(stream_id & STREAM_ID_MASK);
                payload.put_u32(0); // associated stream
                payload.put_u16(0); // priority, slot
                self.encode_header_block(headers, &mut payload)?;
                put_control(dst, TYPE_SYN_STREAM, fin_flag(*fin), &payload)
            }
            Frame::SynReply {
                stream_id,
                headers,
                fin,
            } => {
                let mut payload = BytesMut::new();
                payload.put_u32(stream_id & STREAM_ID_MASK);
                self.encode_header_block(headers, &mut payload)?;
                put_control(dst, TYPE_SYN_REPLY, fin_flag(*fin), &payload)
            }
            Frame::Headers {
                stream_id,
                headers,
                fin,
            } => {
                let mut payload = BytesMut::new();
                payload.put_u32(stream_id & STREAM_ID_MASK);
                self.encode_header_block(headers, &mut payload)?;
                put_control(dst, TYPE_HEADERS, fin_flag(*fin), &payload)
            }
            Frame::RstStream { stream_id, status } => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(stream_id & STREAM_ID_MASK);
                payload.put_u32(*status);
                put_control(dst, TYPE_RST_STREAM, 0, &payload)
            }
            Frame::Settings { entries } => {
                let mut payload = BytesMut::with_capacity(4 + entries.len() * 8);
                payload.put_u32(entries.len() as u32);
                for entry in entries {
                    payload.put_u32((u32::from(entry.flags) << 24) | (entry.id & 0x00ff_ffff));
                    payload.put_u32(entry.value);
                }
                put_control(dst, TYPE_SETTINGS, 0, &payload)
            }
            Frame::Ping { id } => put_control(dst, TYPE_PING, 0, &id.to_be_bytes()),
            Frame::GoAway {
                last_good_stream_id,
                status,
            } => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(last_good_stream_id & STREAM_ID_MASK);
                payload.put_u32(*status);
                put_control(dst, TYPE_GOAWAY, 0, &payload)
            }
            Frame::WindowUpdate { stream_id, delta } => {
                let mut payload = BytesMut::with_capacity(8);
                payload.put_u32(stream_id & STREAM_ID_MASK);
                payload.put_u32(delta & STREAM_ID_MASK);
                put_control(dst, TYPE_WINDOW_UPDATE, 0, &payload)
            }
            Frame::Unknown { frame_type, flags } => put_control(dst, *frame_type, *flags, &[]),
        }
    }

    fn encode_header_block(
        &mut self,
        headers: &HeaderBlock,
        dst: &mut BytesMut,
    ) -> Result<(), FrameError> {
        let mut block = BytesMut::new();
        block.put_u32(headers.len() as u32);
        for (name, value) in headers {
            block.put_u32(name.len() as u32);
            block.put_slice(name.as_bytes());
            block.put_u32(value.len() as u32);
            block.put_slice(value.as_bytes());
        }
        dst.put_slice(&self.deflater.deflate(&block)?);
        Ok(())
    }
}

/// Incremental decoder: feed raw channel bytes, pull whole frames
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    inflater: HeaderInflater,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes read from the channel
    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes buffered but not yet forming a complete frame
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Decode the next complete frame, or `None` when more input is needed
    pub fn next_frame(&mut self) -> Result<Option<Frame>, FrameError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let len = ((self.buf[5] as usize) << 16) | ((self.buf[6] as usize) << 8) | self.buf[7] as usize;
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        let mut frame = self.buf.split_to(HEADER_LEN + len);
        let first = frame.get_u32();
        let flags = frame.get_u8();
        frame.advance(3);
        let fin = flags & FLAG_FIN != 0;

        if first & 0x8000_0000 == 0 {
            return Ok(Some(Frame::Data {
                stream_id: first & STREAM_ID_MASK,
                data: frame.freeze(),
                fin,
            }));
        }

        let version = ((first >> 16) & 0x7fff) as u16;
        if version != VERSION {
            return Err(FrameError::UnsupportedVersion(version));
        }
        let frame_type = (first & 0xffff) as u16;
        let mut payload = frame.freeze();

        let decoded = match frame_type {
            TYPE_SYN_STREAM => {
                require(frame_type, &payload, 10)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                payload.advance(6);
                Frame::SynStream {
                    stream_id,
                    headers: self.decode_header_block(&payload)?,
                    fin,
                }
            }
            TYPE_SYN_REPLY => {
                require(frame_type, &payload, 4)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                Frame::SynReply {
                    stream_id,
                    headers: self.decode_header_block(&payload)?,
                    fin,
                }
            }
            TYPE_HEADERS => {
                require(frame_type, &payload, 4)?;
                let stream_id = payload.get_u32() & STREAM_ID_MASK;
                Frame::Headers {
                    stream_id,
                    headers: self.decode_header_block(&payload)?,
                    fin,
                }
            }
            TYPE_RST_STREAM => {
                require(frame_type, &payload, 8)?;
                Frame::RstStream {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    status: payload.get_u32(),
                }
            }
            TYPE_SETTINGS => {
                require(frame_type, &payload, 4)?;
                let count = payload.get_u32() as usize;
                require(frame_type, &payload, count.saturating_mul(8))?;
                let entries = (0..count)
                    .map(|_| {
                        let head = payload.get_u32();
                        Setting {
                            flags: (head >> 24) as u8,
                            id: head & 0x00ff_ffff,
                            value: payload.get_u32(),
                        }
                    })
                    .collect();
                Frame::Settings { entries }
            }
            TYPE_PING => {
                require(frame_type, &payload, 4)?;
                Frame::Ping {
                    id: payload.get_u32(),
                }
            }
            TYPE_GOAWAY => {
                require(frame_type, &payload, 4)?;
                let last_good_stream_id = payload.get_u32() & STREAM_ID_MASK;
                let status = if payload.remaining() >= 4 {
                    payload.get_u32()
                } else {
                    0
                };
                Frame::GoAway {
                    last_good_stream_id,
                    status,
                }
            }
            TYPE_WINDOW_UPDATE => {
                require(frame_type, &payload, 8)?;
                Frame::WindowUpdate {
                    stream_id: payload.get_u32() & STREAM_ID_MASK,
                    delta: payload.get_u32() & STREAM_ID_MASK,
                }
            }
            other => Frame::Unknown {
                frame_type: other,
                flags,
            },
        };

        Ok(Some(decoded))
    }

    fn decode_header_block(&mut self, compressed: &[u8]) -> Result<HeaderBlock, FrameError> {
        let mut src = Bytes::from(self.inflater.inflate(compressed)?);
        let count = read_u32(&mut src)? as usize;
        let mut headers = Vec::with_capacity(count.min(64));
        for _ in 0..count {
            let name = read_string(&mut src)?;
            let value = read_string(&mut src)?;
            headers.push((name, value));
        }
        Ok(headers)
    }
}

fn fin_flag(fin: bool) -> u8 {
    if fin {
        FLAG_FIN
    } else {
        0
    }
}

fn check_len(len: usize) -> Result<(), FrameError> {
    if len > MAX_LENGTH {
        Err(FrameError::TooLarge(len))
    } else {
        Ok(())
    }
}

fn put_flags_len(dst: &mut BytesMut, flags: u8, len: usize) {
    dst.put_u8(flags);
    dst.put_u8((len >> 16) as u8);
    dst.put_u16(len as u16);
}

fn put_control(dst: &mut BytesMut, frame_type: u16, flags: u8, payload: &[u8]) -> Result<(), FrameError> {
    check_len(payload.len())?;
    dst.reserve(HEADER_LEN + payload.len());
    dst.put_u16(0x8000 | VERSION);
    dst.put_u16(frame_type);
    put_flags_len(dst, flags, payload.len());
    dst.put_slice(payload);
    Ok(())
}

fn require(frame_type: u16, payload: &Bytes, len: usize) -> Result<(), FrameError> {
    if payload.remaining() < len {
        Err(FrameError::Truncated {
            frame_type,
            len: payload.remaining(),
        })
    } else {
        Ok(())
    }
}

fn read_u32(src: &mut Bytes) -> Result<u32, FrameError> {
    if src.remaining() < 4 {
        return Err(FrameError::InvalidHeaderBlock("truncated length".into()));
    }
    Ok(src.get_u32())
}

fn read_string(src: &mut Bytes) -> Result<String, FrameError> {
    let len = read_u32(src)? as usize;
    if src.remaining() < len {
        return Err(FrameError::InvalidHeaderBlock(format!(
            "string of {} bytes with {} remaining",
            len,
            src.remaining()
        )));
    }
    let raw = src.split_to(len);
    String::from_utf8(raw.to_vec())
        .map_err(|_| FrameError::InvalidHeaderBlock("non UTF-8 header".into()))
}
