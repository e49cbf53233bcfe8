//! Length-prefixed binary protocol.
//!
//! Every frame starts with a fixed 16-byte little-endian header followed by
//! `len` body bytes:
//!
//! ```text
//! +-----------+-------------+------------+-----------+------------------+
//! | i32 sign  | i32 msgType | u32 flags  | i32 len   | body (len bytes) |
//! +-----------+-------------+------------+-----------+------------------+
//! ```

use crate::accumulator::ByteAccumulator;
use crate::codec::{Decoded, FrameCodec, FrameState};
use crate::error::WireError;
use crate::json::{from_json_str, to_json_string, JsonCodec};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Header size in bytes
pub const HEADER_SIZE: usize = 16;

/// Sign value written into every header unless overridden
pub const DEFAULT_HEADER_SIGN: i32 = 0;

/// Default cap on a single body
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 128 * 1024;

bitflags! {
    /// Message flags bitmask
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct Flags: u32 {
        /// Body is UTF-8 text
        const STRING = 1 << 0;
        /// Body is a JSON document
        const JSON = 1 << 1;
        /// Reserved: body is compressed
        const COMPRESSED = 1 << 3;
        /// Reserved: body is encrypted
        const ENCRYPTED = 1 << 4;
        /// Receiver should handle this message in arrival order
        const ORDERED = 1 << 5;
    }
}

/// Fixed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlvHeader {
    /// Protocol sign
    pub sign: i32,
    /// Application message type
    pub msg_type: i32,
    /// Message flags
    pub flags: Flags,
    /// Declared body length
    pub len: i32,
}

impl TlvHeader {
    /// Encode the header (little-endian)
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.sign);
        buf.put_i32_le(self.msg_type);
        buf.put_u32_le(self.flags.bits());
        buf.put_i32_le(self.len);
    }

    /// Decode a header from at least [`HEADER_SIZE`] bytes
    pub fn decode(mut buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            sign: buf.get_i32_le(),
            msg_type: buf.get_i32_le(),
            // unknown bits are reserved and carried through untouched
            flags: Flags::from_bits_retain(buf.get_u32_le()),
            len: buf.get_i32_le(),
        })
    }
}

/// One binary-protocol message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetMessage {
    /// Application message type
    pub msg_type: i32,
    /// Message flags
    pub flags: Flags,
    /// Raw body
    pub body: Bytes,
}

impl NetMessage {
    /// Create a message from raw parts
    pub fn new(msg_type: i32, flags: Flags, body: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            flags,
            body: body.into(),
        }
    }

    /// Text message
    pub fn text(msg_type: i32, content: impl Into<String>) -> Self {
        Self::new(msg_type, Flags::STRING, Bytes::from(content.into()))
    }

    /// Binary message
    pub fn binary(msg_type: i32, body: impl Into<Bytes>) -> Self {
        Self::new(msg_type, Flags::empty(), body)
    }

    /// JSON message serialized through `codec`
    pub fn json<T: Serialize>(
        msg_type: i32,
        value: &T,
        codec: &dyn JsonCodec,
    ) -> Result<Self, WireError> {
        let text = to_json_string(codec, value)?;
        Ok(Self::new(msg_type, Flags::STRING | Flags::JSON, Bytes::from(text)))
    }

    /// Mark the message for ordered handling on the receiving side
    pub fn ordered(mut self) -> Self {
        self.flags |= Flags::ORDERED;
        self
    }

    /// Whether the body is text
    pub fn is_string(&self) -> bool {
        self.flags.contains(Flags::STRING)
    }

    /// Whether the body is JSON
    pub fn is_json(&self) -> bool {
        self.flags.contains(Flags::JSON)
    }

    /// Whether the sender asked for ordered handling
    pub fn is_ordered(&self) -> bool {
        self.flags.contains(Flags::ORDERED)
    }

    /// Body as UTF-8 text
    pub fn content(&self) -> Result<&str, WireError> {
        Ok(std::str::from_utf8(&self.body)?)
    }

    /// Body parsed as JSON through `codec`
    pub fn to_json<T: DeserializeOwned>(&self, codec: &dyn JsonCodec) -> Result<T, WireError> {
        from_json_str(codec, self.content()?)
    }

    fn header(&self, sign: i32) -> TlvHeader {
        TlvHeader {
            sign,
            msg_type: self.msg_type,
            flags: self.flags,
            len: self.body.len() as i32,
        }
    }
}

/// Continuation state of the TLV decoder
#[derive(Debug, Default)]
pub struct TlvState {
    stage: FrameState,
    header: Option<TlvHeader>,
    body: Bytes,
}

/// Codec for [`NetMessage`]
#[derive(Debug, Clone)]
pub struct TlvCodec {
    sign: i32,
    max_message_size: usize,
}

impl Default for TlvCodec {
    fn default() -> Self {
        Self {
            sign: DEFAULT_HEADER_SIGN,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl TlvCodec {
    /// Codec with the default sign and size cap
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a different header sign
    pub fn with_sign(mut self, sign: i32) -> Self {
        self.sign = sign;
        self
    }

    /// Change the body size cap; zero keeps the current value
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        if max > 0 {
            self.max_message_size = max;
        }
        self
    }

    /// Configured header sign
    pub fn sign(&self) -> i32 {
        self.sign
    }
}

impl FrameCodec for TlvCodec {
    type Message = NetMessage;
    type State = TlvState;

    fn encode(&self, message: &NetMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        if message.body.len() > i32::MAX as usize {
            return Err(WireError::Size {
                size: message.body.len(),
                limit: i32::MAX as usize,
            });
        }
        dst.reserve(HEADER_SIZE + message.body.len());
        message.header(self.sign).encode(dst);
        dst.put_slice(&message.body);
        Ok(())
    }

    fn decode(
        &self,
        state: &mut TlvState,
        src: &mut ByteAccumulator,
        out: &mut Decoded<NetMessage>,
    ) -> Result<bool, WireError> {
        loop {
            match state.stage {
                FrameState::WaitingForHeader => {
                    let Some(mut header) = src.peek(HEADER_SIZE).and_then(TlvHeader::decode) else {
                        break;
                    };
                    if header.sign != self.sign {
                        return Err(WireError::Sign {
                            expected: self.sign,
                            found: header.sign,
                        });
                    }
                    if header.len < 0 {
                        return Err(WireError::Length(header.len));
                    }
                    src.advance(HEADER_SIZE);

                    if header.len as usize > self.max_message_size {
                        warn!(
                            "Clamping oversized frame body: {} > {}",
                            header.len, self.max_message_size
                        );
                        header.len = 0;
                    }

                    state.stage = if header.len > 0 {
                        FrameState::WaitingForBody
                    } else {
                        FrameState::Ready
                    };
                    state.header = Some(header);
                }
                FrameState::WaitingForBody => {
                    let len = state.header.map(|h| h.len as usize).unwrap_or_default();
                    let Some(body) = src.take(len) else {
                        break;
                    };
                    state.body = body;
                    state.stage = FrameState::Ready;
                }
                FrameState::Ready => {
                    if let Some(header) = state.header.take() {
                        out.emit(NetMessage {
                            msg_type: header.msg_type,
                            flags: header.flags,
                            body: std::mem::take(&mut state.body),
                        });
                    }
                    state.stage = FrameState::WaitingForHeader;
                }
            }
        }

        Ok(src.is_empty())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
