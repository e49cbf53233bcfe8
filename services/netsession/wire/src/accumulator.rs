//! Reassembly buffer for partially received frames.
//!
//! Bytes read from a socket are appended at the tail; codecs consume from a
//! read cursor. The consumed prefix is dropped lazily, either when the cursor
//! passes the midpoint of the buffer on the next append or when the engine
//! calls [`ByteAccumulator::compact`] after a decode cycle.

use bytes::{Buf, Bytes, BytesMut};

/// Growable byte buffer with a positional read cursor
#[derive(Debug, Default)]
pub struct ByteAccumulator {
    buf: BytesMut,
    pos: usize,
}

impl ByteAccumulator {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty accumulator with room for `capacity` bytes
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pos: 0,
        }
    }

    /// Append freshly received bytes after any unconsumed tail
    pub fn append(&mut self, data: &[u8]) {
        if self.pos > 0 && (self.pos >= self.buf.len() || self.pos * 2 >= self.buf.len()) {
            self.compact();
        }
        self.buf.extend_from_slice(data);
    }

    /// Number of bytes between the cursor and the end
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True when every appended byte has been consumed
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Current cursor offset from the start of the retained bytes
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the cursor, clamped to the end of the buffer
    pub fn set_position(&mut self, pos: usize) {
        self.pos = pos.min(self.buf.len());
    }

    /// Look at the next `len` bytes without consuming them
    pub fn peek(&self, len: usize) -> Option<&[u8]> {
        if self.remaining() < len {
            return None;
        }
        Some(&self.buf[self.pos..self.pos + len])
    }

    /// All unconsumed bytes
    pub fn chunk(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Consume the next `len` bytes, or nothing if fewer are available
    pub fn take(&mut self, len: usize) -> Option<Bytes> {
        let bytes = Bytes::copy_from_slice(self.peek(len)?);
        self.pos += len;
        Some(bytes)
    }

    /// Skip up to `len` bytes
    pub fn advance(&mut self, len: usize) {
        self.pos = (self.pos + len).min(self.buf.len());
    }

    /// Drop the consumed prefix, keeping only the unconsumed tail
    pub fn compact(&mut self) {
        if self.pos == 0 {
            return;
        }
        if self.pos >= self.buf.len() {
            self.buf.clear();
        } else {
            self.buf.advance(self.pos);
        }
        self.pos = 0;
    }

    /// Discard everything
    pub fn clear(&mut self) {
        self.buf.clear();
        self.pos = 0;
    }
}
