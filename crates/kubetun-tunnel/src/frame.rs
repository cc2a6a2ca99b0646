//! Tunnel wire format.
//!
//! ```text
//! +-----------+---------+----------+---------------+-----------------+
//! | len u32BE | kind u8 | flags u8 | stream u32 BE | payload         |
//! +-----------+---------+----------+---------------+-----------------+
//! ```
//!
//! `len` counts everything after itself (6 + payload). Flag bit 0 marks a
//! stream initiated by the agent; it is derived from the stream ID parity
//! on encode and checked on decode.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Largest payload a single frame may carry.
pub const MAX_PAYLOAD: usize = 1024 * 1024;

/// Largest DATA payload a writer emits.
pub const MAX_DATA_CHUNK: usize = 16 * 1024;

/// Set when the stream was opened by the agent.
pub const FLAG_AGENT_INITIATED: u8 = 0x01;

const HEADER_LEN: usize = 6;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Open = 1,
    OpenAck = 2,
    OpenRefused = 3,
    Data = 4,
    Window = 5,
    Fin = 6,
    Reset = 7,
    Ping = 8,
    Pong = 9,
    Request = 10,
    Response = 11,
    GoAway = 12,
}

impl FrameKind {
    fn from_u8(b: u8) -> Option<Self> {
        Some(match b {
            1 => FrameKind::Open,
            2 => FrameKind::OpenAck,
            3 => FrameKind::OpenRefused,
            4 => FrameKind::Data,
            5 => FrameKind::Window,
            6 => FrameKind::Fin,
            7 => FrameKind::Reset,
            8 => FrameKind::Ping,
            9 => FrameKind::Pong,
            10 => FrameKind::Request,
            11 => FrameKind::Response,
            12 => FrameKind::GoAway,
            _ => return None,
        })
    }

    /// Whether the frame's ID field names a stream (as opposed to the
    /// connection or a control request).
    pub fn is_stream_frame(&self) -> bool {
        matches!(
            self,
            FrameKind::Open
                | FrameKind::OpenAck
                | FrameKind::OpenRefused
                | FrameKind::Data
                | FrameKind::Window
                | FrameKind::Fin
                | FrameKind::Reset
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub flags: u8,
    /// Stream ID for stream frames, request ID for control frames, 0 otherwise.
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(kind: FrameKind, id: u32, payload: Bytes) -> Self {
        let flags = if kind.is_stream_frame() && id != 0 && id % 2 == 0 {
            FLAG_AGENT_INITIATED
        } else {
            0
        };
        Self {
            kind,
            flags,
            id,
            payload,
        }
    }

    pub fn empty(kind: FrameKind, id: u32) -> Self {
        Self::new(kind, id, Bytes::new())
    }

    pub fn data(id: u32, payload: Bytes) -> Self {
        Self::new(FrameKind::Data, id, payload)
    }

    pub fn window(id: u32, credit: u32) -> Self {
        Self::new(FrameKind::Window, id, Bytes::copy_from_slice(&credit.to_be_bytes()))
    }

    pub fn reset(id: u32, reason: &str) -> Self {
        Self::new(FrameKind::Reset, id, Bytes::copy_from_slice(reason.as_bytes()))
    }

    pub fn ping(nonce: u64) -> Self {
        Self::new(FrameKind::Ping, 0, Bytes::copy_from_slice(&nonce.to_be_bytes()))
    }

    /// Credit carried by a WINDOW frame.
    pub fn credit(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    /// Payload as text, for RESET and OPEN_REFUSED reasons.
    pub fn reason(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// tokio-util codec for [`Frame`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, Self::Error> {
        if src.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if !(HEADER_LEN..=HEADER_LEN + MAX_PAYLOAD).contains(&len) {
            return Err(invalid(format!("frame length {len} out of range")));
        }
        if src.len() < 4 + len {
            src.reserve(4 + len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let mut body = src.split_to(len);
        let kind_byte = body.get_u8();
        let flags = body.get_u8();
        let id = body.get_u32();
        let kind = FrameKind::from_u8(kind_byte)
            .ok_or_else(|| invalid(format!("unknown frame kind {kind_byte}")))?;

        if kind.is_stream_frame() && id != 0 {
            let agent_initiated = id % 2 == 0;
            if agent_initiated != (flags & FLAG_AGENT_INITIATED != 0) {
                return Err(invalid(format!("direction flag does not match stream {id}")));
            }
        }

        Ok(Some(Frame {
            kind,
            flags,
            id,
            payload: body.freeze(),
        }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if frame.payload.len() > MAX_PAYLOAD {
            return Err(invalid(format!("payload of {} bytes too large", frame.payload.len())));
        }
        dst.reserve(4 + HEADER_LEN + frame.payload.len());
        dst.put_u32((HEADER_LEN + frame.payload.len()) as u32);
        dst.put_u8(frame.kind as u8);
        dst.put_u8(frame.flags);
        dst.put_u32(frame.id);
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

fn invalid(msg: String) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidData, msg)
}
