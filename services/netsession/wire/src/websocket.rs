//! WebSocket framing (RFC 6455).
//!
//! The first frame on every connection is the HTTP upgrade handshake. A
//! server-side codec answers it with `101 Switching Protocols`; a client-side
//! codec recognises that reply and masks everything it sends afterwards.
//!
//! Fragmented messages (continuation frames) are not supported and close the
//! connection like any other unknown opcode.

use crate::accumulator::ByteAccumulator;
use crate::codec::{line_at, BlankLineScan, Decoded, FrameCodec, FrameState};
use crate::error::WireError;
use base64::{engine::general_purpose, Engine as _};
use bytes::{BufMut, Bytes, BytesMut};
use sha1::{Digest, Sha1};
use std::fmt;
use tracing::debug;

/// Magic GUID appended to the client key before hashing
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on a handshake block or frame payload
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

const OP_TEXT: u8 = 0x1;
const OP_BINARY: u8 = 0x2;
const OP_CLOSE: u8 = 0x8;
const OP_PING: u8 = 0x9;
const OP_PONG: u8 = 0xA;

/// `Sec-WebSocket-Accept` value for a client key
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.trim().as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    general_purpose::STANDARD.encode(hasher.finalize())
}

/// Client upgrade request text
pub fn handshake_request(path: &str, key: &str, host: &str, origin: &str) -> String {
    Handshake::request(path, key, host, origin).to_string()
}

/// Server reply to an upgrade request
pub fn handshake_reply(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\nUpgrade: WebSocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: {}\r\n\r\n",
        accept
    )
}

/// An upgrade request or reply
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Request line or status line
    pub start_line: String,
    /// Header lines in arrival order
    pub headers: Vec<(String, String)>,
}

impl Handshake {
    /// Build a client upgrade request
    pub fn request(path: &str, key: &str, host: &str, origin: &str) -> Self {
        let headers = [
            ("Upgrade", "WebSocket"),
            ("Connection", "Upgrade"),
            ("Sec-WebSocket-Version", "13"),
            ("Sec-WebSocket-Key", key),
            ("Host", host),
            ("Origin", origin),
        ];
        Self {
            start_line: format!("GET {} HTTP/1.1", path),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    /// Parse the text before the blank line. Lines without a colon are skipped.
    pub fn parse(text: &str) -> Self {
        let mut lines = text.split("\r\n").filter(|l| !l.is_empty());
        let start_line = lines.next().unwrap_or_default().trim().to_string();
        let headers = lines
            .filter_map(|line| {
                let (name, value) = line.split_once(':')?;
                Some((name.trim().to_string(), value.trim().to_string()))
            })
            .collect();
        Self {
            start_line,
            headers,
        }
    }

    /// First header value with this exact name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    /// Whether this is the server's `101 Switching Protocols` reply
    pub fn is_switching_protocols(&self) -> bool {
        self.start_line.starts_with("HTTP/") && self.start_line.contains(" 101")
    }

    /// Requested path of an upgrade request
    pub fn path(&self) -> Option<&str> {
        if self.is_switching_protocols() {
            return None;
        }
        self.start_line.split(' ').nth(1)
    }

    /// Client key of an upgrade request
    pub fn key(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Key")
    }

    /// Accept value of a server reply
    pub fn accept(&self) -> Option<&str> {
        self.header("Sec-WebSocket-Accept")
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\r\n", self.start_line)?;
        for (name, value) in &self.headers {
            write!(f, "{}: {}\r\n", name, value)?;
        }
        f.write_str("\r\n")
    }
}

/// One WebSocket message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebMessage {
    /// Upgrade request or reply
    Handshake(Handshake),
    /// Text frame
    Text(String),
    /// Binary frame
    Binary(Bytes),
    /// Ping frame; the codec answers with a pong automatically
    Ping(Bytes),
    /// Pong frame
    Pong(Bytes),
    /// Close frame. Only sent; a received close ends the session instead
    Close,
}

#[derive(Debug, Clone, Copy)]
struct FrameHead {
    opcode: u8,
    mask: Option<[u8; 4]>,
    len: usize,
}

/// Continuation state of the WebSocket decoder
#[derive(Debug, Default)]
pub struct WebSocketState {
    handshaken: bool,
    scan: BlankLineScan,
    stage: FrameState,
    head: Option<FrameHead>,
    payload: Bytes,
}

/// Codec for [`WebMessage`]
#[derive(Debug, Clone)]
pub struct WebSocketCodec {
    max_message_size: usize,
    client: bool,
}

impl Default for WebSocketCodec {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            client: false,
        }
    }
}

impl WebSocketCodec {
    /// Server-side codec
    pub fn new() -> Self {
        Self::default()
    }

    /// Client-side codec: outgoing frames are masked
    pub fn client() -> Self {
        Self {
            client: true,
            ..Self::default()
        }
    }

    /// Change the size cap; zero keeps the current value
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        if max > 0 {
            self.max_message_size = max;
        }
        self
    }

    /// Whether this codec plays the client role
    pub fn is_client(&self) -> bool {
        self.client
    }

    fn write_frame(&self, opcode: u8, payload: &[u8], dst: &mut BytesMut) {
        let mask_bit = if self.client { 0x80 } else { 0 };
        dst.reserve(payload.len() + 14);
        dst.put_u8(0x80 | opcode);

        let len = payload.len();
        if len < 126 {
            dst.put_u8(mask_bit | len as u8);
        } else if len <= u16::MAX as usize {
            dst.put_u8(mask_bit | 126);
            dst.put_u16(len as u16);
        } else {
            dst.put_u8(mask_bit | 127);
            dst.put_u64(len as u64);
        }

        if self.client {
            let key: [u8; 4] = rand::random();
            dst.put_slice(&key);
            dst.extend(payload.iter().enumerate().map(|(i, b)| b ^ key[i % 4]));
        } else {
            dst.put_slice(payload);
        }
    }

    fn decode_handshake(
        &self,
        state: &mut WebSocketState,
        src: &mut ByteAccumulator,
        out: &mut Decoded<WebMessage>,
    ) -> Result<bool, WireError> {
        let Some(end) = state.scan.find(src.chunk()) else {
            if src.remaining() > self.max_message_size {
                return Err(WireError::Size {
                    size: src.remaining(),
                    limit: self.max_message_size,
                });
            }
            return Ok(false);
        };
        if end + 4 > self.max_message_size {
            return Err(WireError::Size {
                size: end + 4,
                limit: self.max_message_size,
            });
        }

        let head = &src.chunk()[..end];
        let text = std::str::from_utf8(head)
            .map_err(|e| WireError::HeaderLine(line_at(head, e.valid_up_to())))?;
        let handshake = Handshake::parse(text);
        src.advance(end + 4);

        if !handshake.is_switching_protocols() {
            if let Some(key) = handshake.key() {
                let accept = compute_accept_key(key);
                out.reply(Bytes::from(handshake_reply(&accept)));
            }
        }
        debug!("WebSocket handshake received: {}", handshake.start_line);

        state.handshaken = true;
        out.emit(WebMessage::Handshake(handshake));
        Ok(true)
    }

    fn parse_head(&self, src: &ByteAccumulator) -> Result<Option<(FrameHead, usize)>, WireError> {
        let Some(base) = src.peek(2) else {
            return Ok(None);
        };
        let opcode = base[0] & 0x0F;
        if !matches!(opcode, OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG) {
            return Err(WireError::Opcode(opcode));
        }
        let masked = base[1] & 0x80 != 0;
        let len7 = base[1] & 0x7F;

        let ext = match len7 {
            126 => 2,
            127 => 8,
            _ => 0,
        };
        let head_len = 2 + ext + if masked { 4 } else { 0 };
        let Some(raw) = src.peek(head_len) else {
            return Ok(None);
        };

        let len = match len7 {
            126 => u16::from_be_bytes([raw[2], raw[3]]) as u64,
            127 => {
                let mut b = [0u8; 8];
                b.copy_from_slice(&raw[2..10]);
                u64::from_be_bytes(b)
            }
            n => n as u64,
        };
        if len > self.max_message_size as u64 {
            return Err(WireError::Size {
                size: len.min(usize::MAX as u64) as usize,
                limit: self.max_message_size,
            });
        }

        let mask = masked.then(|| {
            let at = 2 + ext;
            [raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]
        });

        Ok(Some((
            FrameHead {
                opcode,
                mask,
                len: len as usize,
            },
            head_len,
        )))
    }
}

impl FrameCodec for WebSocketCodec {
    type Message = WebMessage;
    type State = WebSocketState;

    fn encode(&self, message: &WebMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        match message {
            WebMessage::Handshake(handshake) => {
                dst.put_slice(handshake.to_string().as_bytes());
            }
            WebMessage::Text(text) => self.write_frame(OP_TEXT, text.as_bytes(), dst),
            WebMessage::Binary(data) => self.write_frame(OP_BINARY, data, dst),
            WebMessage::Ping(data) => self.write_frame(OP_PING, data, dst),
            WebMessage::Pong(data) => self.write_frame(OP_PONG, data, dst),
            WebMessage::Close => self.write_frame(OP_CLOSE, &[], dst),
        }
        Ok(())
    }

    fn decode(
        &self,
        state: &mut WebSocketState,
        src: &mut ByteAccumulator,
        out: &mut Decoded<WebMessage>,
    ) -> Result<bool, WireError> {
        if !state.handshaken && !self.decode_handshake(state, src, out)? {
            return Ok(false);
        }

        loop {
            match state.stage {
                FrameState::WaitingForHeader => {
                    let Some((head, head_len)) = self.parse_head(src)? else {
                        break;
                    };
                    src.advance(head_len);
                    state.stage = if head.len > 0 {
                        FrameState::WaitingForBody
                    } else {
                        FrameState::Ready
                    };
                    state.head = Some(head);
                }
                FrameState::WaitingForBody => {
                    let Some(head) = state.head else {
                        state.stage = FrameState::WaitingForHeader;
                        continue;
                    };
                    let Some(payload) = src.take(head.len) else {
                        break;
                    };
                    state.payload = match head.mask {
                        Some(key) => payload
                            .iter()
                            .enumerate()
                            .map(|(i, b)| b ^ key[i % 4])
                            .collect::<Vec<u8>>()
                            .into(),
                        None => payload,
                    };
                    state.stage = FrameState::Ready;
                }
                FrameState::Ready => {
                    state.stage = FrameState::WaitingForHeader;
                    let Some(head) = state.head.take() else {
                        continue;
                    };
                    let payload = std::mem::take(&mut state.payload);
                    match head.opcode {
                        OP_TEXT => out.emit(WebMessage::Text(
                            std::str::from_utf8(&payload)?.to_string(),
                        )),
                        OP_BINARY => out.emit(WebMessage::Binary(payload)),
                        OP_PING => {
                            let mut pong = BytesMut::new();
                            self.write_frame(OP_PONG, &payload, &mut pong);
                            out.reply(pong.freeze());
                            out.emit(WebMessage::Ping(payload));
                        }
                        OP_PONG => out.emit(WebMessage::Pong(payload)),
                        _ => {
                            debug!("WebSocket close frame received");
                            out.request_close();
                            return Ok(src.is_empty());
                        }
                    }
                }
            }
        }

        Ok(src.is_empty())
    }

    fn max_message_size(&self) -> usize {
        self.max_message_size
    }
}
