//! The streaming codec contract shared by every protocol adapter.

use crate::accumulator::ByteAccumulator;
use crate::error::WireError;
use bytes::{Bytes, BytesMut};

/// Reassembly stage of the frame under construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameState {
    /// Not enough bytes for a complete header yet
    #[default]
    WaitingForHeader,
    /// Header parsed, waiting for the declared body
    WaitingForBody,
    /// Frame complete, ready to be emitted
    Ready,
}

/// Output of one decode call
#[derive(Debug)]
pub struct Decoded<M> {
    /// Messages to dispatch, in wire order
    pub messages: Vec<M>,
    /// Already-encoded frames the engine must write back before dispatching
    /// (handshake replies, pongs)
    pub replies: Vec<Bytes>,
    /// The peer asked to end the connection
    pub close: bool,
}

impl<M> Default for Decoded<M> {
    fn default() -> Self {
        Self {
            messages: Vec::new(),
            replies: Vec::new(),
            close: false,
        }
    }
}

impl<M> Decoded<M> {
    /// Create an empty output
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a decoded message
    pub fn emit(&mut self, message: M) {
        self.messages.push(message);
    }

    /// Queue an automatic reply
    pub fn reply(&mut self, frame: Bytes) {
        self.replies.push(frame);
    }

    /// Ask the engine to close the session once this output is handled
    pub fn request_close(&mut self) {
        self.close = true;
    }

    /// True when nothing was produced
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.replies.is_empty() && !self.close
    }
}

/// A streaming encoder/decoder for one protocol.
///
/// `decode` is called once per read completion and never concurrently for
/// the same session. It consumes as many complete frames as the accumulator
/// holds, leaves the cursor after the last consumed byte, and returns `true`
/// iff nothing is left over. Continuation state for a partially received
/// frame lives in `State`, which the session owns and hands back on every
/// call.
///
/// Errors for which [`WireError::is_protocol_violation`] holds mean the byte
/// stream is corrupt; messages already pushed to `out` are still delivered
/// before the session is closed.
pub trait FrameCodec: Send + Sync + 'static {
    /// Decoded and encodable message type
    type Message: Send + 'static;

    /// Per-session continuation state
    type State: Default + Send + 'static;

    /// Serialize `message` onto `dst`. Must not perform I/O.
    fn encode(&self, message: &Self::Message, dst: &mut BytesMut) -> Result<(), WireError>;

    /// Decode every complete frame available in `src`
    fn decode(
        &self,
        state: &mut Self::State,
        src: &mut ByteAccumulator,
        out: &mut Decoded<Self::Message>,
    ) -> Result<bool, WireError>;

    /// Largest frame body this codec accepts
    fn max_message_size(&self) -> usize;
}

/// Position of the first `\r\n\r\n` in `data`, if any
pub(crate) fn find_blank_line(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Resumable search for the blank line that ends a header block.
///
/// `data` must start at the same byte on every call until a match is found;
/// only bytes appended since the previous call (plus three of overlap) are
/// searched.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct BlankLineScan {
    scanned: usize,
}

impl BlankLineScan {
    pub(crate) fn find(&mut self, data: &[u8]) -> Option<usize> {
        let from = self.scanned.saturating_sub(3).min(data.len());
        match find_blank_line(&data[from..]) {
            Some(at) => {
                self.scanned = 0;
                Some(from + at)
            }
            None => {
                self.scanned = data.len();
                None
            }
        }
    }
}

/// The CRLF-delimited line of `head` containing byte `at`
pub(crate) fn line_at(head: &[u8], at: usize) -> String {
    let at = at.min(head.len());
    let start = head[..at]
        .windows(2)
        .rposition(|w| w == b"\r\n")
        .map(|i| i + 2)
        .unwrap_or(0);
    let end = head[at..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| at + i)
        .unwrap_or(head.len());
    String::from_utf8_lossy(&head[start..end]).into_owned()
}
