//! Wire protocol error types.

use thiserror::Error;

/// Wire protocol errors
#[derive(Error, Debug)]
pub enum WireError {
    /// Header sign did not match the protocol constant
    #[error("header sign mismatch: expected {expected}, found {found}")]
    Sign {
        /// Sign the codec is configured with
        expected: i32,
        /// Sign read from the wire
        found: i32,
    },

    /// Size limit exceeded
    #[error("size limit exceeded: {size} > {limit}")]
    Size {
        /// Declared or scanned size
        size: usize,
        /// Configured maximum
        limit: usize,
    },

    /// Negative length field in a binary header
    #[error("invalid length field: {0}")]
    Length(i32),

    /// Unknown or unsupported WebSocket opcode
    #[error("unknown opcode {0:#x}")]
    Opcode(u8),

    /// Malformed HTTP request or status line
    #[error("malformed start line: {0}")]
    StartLine(String),

    /// Malformed HTTP header line
    #[error("malformed header line: {0}")]
    HeaderLine(String),

    /// Unparsable Content-Length value
    #[error("invalid content length: {0}")]
    ContentLength(String),

    /// Text payload was not valid UTF-8
    #[error("invalid utf-8 payload")]
    Utf8(#[from] std::str::Utf8Error),

    /// The codec cannot serialize this message
    #[error("unsupported message: {0}")]
    Unsupported(&'static str),

    /// JSON collaborator failure
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl WireError {
    /// Whether this error means the byte stream can no longer be trusted.
    ///
    /// Stream protocols have no way to resynchronise after a corrupt frame,
    /// so the session owning the stream must be closed.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            WireError::Sign { .. }
                | WireError::Size { .. }
                | WireError::Length(_)
                | WireError::Opcode(_)
                | WireError::StartLine(_)
                | WireError::HeaderLine(_)
                | WireError::ContentLength(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_violation_classification() {
        assert!(WireError::Sign { expected: 0, found: 7 }.is_protocol_violation());
        assert!(WireError::Opcode(0x3).is_protocol_violation());
        assert!(WireError::Size { size: 10, limit: 5 }.is_protocol_violation());
        assert!(!WireError::Unsupported("raw").is_protocol_violation());
    }

    #[test]
    fn test_display() {
        let err = WireError::Sign { expected: 0, found: 42 };
        assert_eq!(err.to_string(), "header sign mismatch: expected 0, found 42");
    }
}
