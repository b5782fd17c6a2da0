//! Framing and the [`Marshal`] trait.
//!
//! Every unit on the wire is a frame:
//!
//! ```text
//! +----------------+------------------------+-----------------+
//! | channel (u16)  | payload length (u32)   | payload bytes   |
//! | little-endian  | little-endian          | length bytes    |
//! +----------------+------------------------+-----------------+
//! ```
//!
//! The length is explicit even though a UDP datagram already has one, so
//! the same decoder works for datagrams and for frames peeled off a TCP
//! byte stream ([`FrameCodec`]).

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio_util::codec::Decoder;

use crate::ProtocolError;

/// Size of the `[u16 channel][u32 length]` frame header.
pub const FRAME_HEADER_LEN: usize = 6;

/// Largest payload [`FrameCodec`] accepts by default (1 MiB).
pub const MAX_FRAME_PAYLOAD: usize = 1 << 20;

// ---------------------------------------------------------------------------
// Marshal
// ---------------------------------------------------------------------------

/// A type with a fixed little-endian byte layout.
///
/// Encoding must be symmetric: for every valid value `x`,
/// `T::unmarshal(&x.to_bytes())` yields `x` again.
pub trait Marshal: Sized {
    /// Appends the wire form of `self` to `buf`.
    fn marshal(&self, buf: &mut BytesMut);

    /// Parses a value from a complete payload.
    ///
    /// # Errors
    /// Returns a [`ProtocolError`] if the bytes are truncated or contain an
    /// unknown discriminant. Never returns a partially filled value.
    fn unmarshal(data: &[u8]) -> Result<Self, ProtocolError>;

    /// Encodes `self` into a fresh buffer.
    fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.marshal(&mut buf);
        buf.freeze()
    }
}

/// Fails with [`ProtocolError::Truncated`] unless `buf` holds `needed` bytes.
pub(crate) fn ensure_remaining(
    buf: &impl Buf,
    needed: usize,
    what: &'static str,
) -> Result<(), ProtocolError> {
    if buf.remaining() < needed {
        return Err(ProtocolError::Truncated {
            what,
            needed,
            available: buf.remaining(),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ChannelId
// ---------------------------------------------------------------------------

/// Identifier of a logical sub-stream multiplexed over one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u16);

impl ChannelId {
    /// `ControllerConnectedMessage` frames (reliable transport).
    pub const CONTROLLER_CONNECTED: ChannelId = ChannelId(1);
    /// `RemoteMessage<ControllerNameMessage>` frames (reliable transport).
    pub const CONTROLLER_NAME: ChannelId = ChannelId(2);
    /// `RemoteMessage<GamepadMessage>` frames (unreliable transport).
    pub const GAMEPAD: ChannelId = ChannelId(3);
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Frame
// ---------------------------------------------------------------------------

/// An undecoded frame: channel plus raw payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Channel the payload belongs to.
    pub channel: ChannelId,
    /// Payload bytes, exactly as long as the header declared.
    pub payload: Bytes,
}

impl Frame {
    /// Builds a frame around an already-encoded payload.
    pub fn new(channel: ChannelId, payload: impl Into<Bytes>) -> Self {
        Self {
            channel,
            payload: payload.into(),
        }
    }

    /// Appends a frame on `channel` to `buf`, with whatever `body` writes as
    /// its payload. The length field is filled in after `body` returns.
    ///
    /// # Errors
    /// [`ProtocolError::FrameTooLarge`] if the payload exceeds
    /// [`MAX_FRAME_PAYLOAD`]. `buf` is left as it was.
    pub fn write(
        channel: ChannelId,
        buf: &mut BytesMut,
        body: impl FnOnce(&mut BytesMut),
    ) -> Result<(), ProtocolError> {
        let start = buf.len();
        buf.put_u16_le(channel.0);
        buf.put_u32_le(0);
        let payload_at = buf.len();
        body(buf);

        let length = buf.len() - payload_at;
        let declared = u32::try_from(length)
            .ok()
            .filter(|_| length <= MAX_FRAME_PAYLOAD);
        let Some(declared) = declared else {
            buf.truncate(start);
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: MAX_FRAME_PAYLOAD,
            });
        };
        buf[start + 2..payload_at].copy_from_slice(&declared.to_le_bytes());
        Ok(())
    }

    /// Appends header and payload to `buf`.
    ///
    /// # Errors
    /// See [`Frame::write`].
    pub fn encode(&self, buf: &mut BytesMut) -> Result<(), ProtocolError> {
        buf.reserve(FRAME_HEADER_LEN + self.payload.len());
        Self::write(self.channel, buf, |buf| buf.put_slice(&self.payload))
    }

    /// Encodes into a fresh buffer.
    ///
    /// # Errors
    /// See [`Frame::write`].
    pub fn to_bytes(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decodes exactly one frame from the start of `data`.
    ///
    /// Bytes after the declared payload are ignored.
    ///
    /// # Errors
    /// [`ProtocolError::Truncated`] if the header or the declared payload
    /// does not fit in `data`.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut buf = data;
        ensure_remaining(&buf, FRAME_HEADER_LEN, "frame header")?;
        let channel = ChannelId(buf.get_u16_le());
        let length = buf.get_u32_le() as usize;
        ensure_remaining(&buf, length, "frame payload")?;
        Ok(Self {
            channel,
            payload: Bytes::copy_from_slice(&buf[..length]),
        })
    }

    /// Reads the channel id without decoding the rest of the frame.
    pub fn peek_channel(data: &[u8]) -> Option<ChannelId> {
        match data {
            [lo, hi, ..] => Some(ChannelId(u16::from_le_bytes([*lo, *hi]))),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Datagram
// ---------------------------------------------------------------------------

/// A typed frame: a [`Marshal`] payload tagged with its channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram<T> {
    /// Channel the payload is sent on.
    pub channel: ChannelId,
    /// The message itself.
    pub payload: T,
}

impl<T> Datagram<T> {
    /// Pairs a payload with a channel.
    pub fn new(channel: ChannelId, payload: T) -> Self {
        Self { channel, payload }
    }
}

impl<T: Marshal> Datagram<T> {
    /// Frames the payload.
    ///
    /// # Errors
    /// [`ProtocolError::FrameTooLarge`] if the encoded payload exceeds
    /// [`MAX_FRAME_PAYLOAD`].
    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        let mut buf = BytesMut::new();
        Frame::write(self.channel, &mut buf, |buf| self.payload.marshal(buf))?;
        Ok(buf.freeze())
    }

    /// Decodes one frame and its payload.
    ///
    /// # Errors
    /// Fails if either the frame or the payload is malformed.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let frame = Frame::decode(data)?;
        let payload = T::unmarshal(&frame.payload)?;
        Ok(Self {
            channel: frame.channel,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// FrameCodec
// ---------------------------------------------------------------------------

/// Peels frames off a byte stream one at a time.
///
/// Used with `tokio_util::codec::FramedRead` on the reliable transport.
/// A declared length above the limit means the stream is out of sync, so
/// it is reported as an error rather than skipped.
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_payload: usize,
}

impl FrameCodec {
    /// A codec with the default 1 MiB payload limit.
    pub fn new() -> Self {
        Self {
            max_payload: MAX_FRAME_PAYLOAD,
        }
    }

    /// A codec with a custom payload limit.
    pub fn with_max_payload(max_payload: usize) -> Self {
        Self { max_payload }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        let channel = ChannelId(u16::from_le_bytes([src[0], src[1]]));
        let length = u32::from_le_bytes([src[2], src[3], src[4], src[5]]) as usize;
        if length > self.max_payload {
            return Err(ProtocolError::FrameTooLarge {
                length,
                max: self.max_payload,
            });
        }

        let total = FRAME_HEADER_LEN + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(total);
        frame.advance(FRAME_HEADER_LEN);
        Ok(Some(Frame {
            channel,
            payload: frame.freeze(),
        }))
    }
}
