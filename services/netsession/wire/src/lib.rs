//! Streaming frame codecs for netsession.
//!
//! This crate holds everything between raw socket bytes and application
//! messages, without performing any I/O itself:
//!
//! - **Reassembly**: [`ByteAccumulator`] keeps bytes that have been read but
//!   not yet consumed by a codec, across arbitrary TCP segment boundaries
//! - **Codec contract**: [`FrameCodec`] decodes zero or more messages per
//!   read and serializes outbound messages
//! - **Protocols**: a length-prefixed binary protocol ([`TlvCodec`]),
//!   WebSocket framing ([`WebSocketCodec`]) and HTTP/1.1 ([`HttpCodec`])
//!
//! ## Binary Wire Format
//!
//! ```text
//! +----------------------+----------------------------+
//! | i32 sign (LE)        | protocol constant, 0       |
//! +----------------------+----------------------------+
//! | i32 msg_type (LE)    | application message type   |
//! +----------------------+----------------------------+
//! | u32 flags (LE)       | STRING|JSON|...|ORDERED    |
//! +----------------------+----------------------------+
//! | i32 len (LE)         | body length                |
//! +----------------------+----------------------------+
//! | body                 | len bytes                  |
//! +----------------------+----------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accumulator;
pub mod codec;
pub mod error;
pub mod http;
pub mod json;
pub mod tlv;
pub mod websocket;

// Re-export main types
pub use accumulator::ByteAccumulator;
pub use codec::{Decoded, FrameCodec, FrameState};
pub use error::WireError;
pub use http::{HttpCodec, HttpMessage, HttpState, StartLine};
pub use json::{JsonCodec, SerdeJsonCodec};
pub use tlv::{Flags, NetMessage, TlvCodec, TlvHeader, TlvState, DEFAULT_HEADER_SIGN, HEADER_SIZE};
pub use websocket::{
    compute_accept_key, handshake_reply, handshake_request, Handshake, WebMessage, WebSocketCodec,
    WebSocketState, WEBSOCKET_GUID,
};
