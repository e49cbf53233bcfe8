//! Error taxonomy for sessions.

use bitflags::bitflags;
use netsession_wire::WireError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

bitflags! {
    /// Where an error was raised. Flags compose, e.g. `SEND | CODEC`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ErrorKind: u32 {
        /// Accepting connections failed
        const LISTEN = 1 << 0;
        /// Establishing an outbound connection failed
        const CONNECT = 1 << 1;
        /// Reading from the transport failed
        const RECEIVE = 1 << 2;
        /// Writing to the transport failed
        const SEND = 1 << 3;
        /// Encoding or decoding failed
        const CODEC = 1 << 4;
        /// An application callback failed
        const PROCESS = 1 << 5;
    }
}

impl ErrorKind {
    /// Transport-level failure on an established session
    pub fn is_network_error(self) -> bool {
        self.intersects(ErrorKind::RECEIVE | ErrorKind::SEND) && !self.contains(ErrorKind::PROCESS)
    }

    /// Encoding or decoding failure
    pub fn is_codec_error(self) -> bool {
        self.contains(ErrorKind::CODEC)
    }

    /// Failure inside application code
    pub fn is_process_error(self) -> bool {
        self.contains(ErrorKind::PROCESS)
    }
}

bitflags! {
    /// I/O direction(s)
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct IoDirection: u8 {
        /// Inbound
        const RECEIVE = 1 << 0;
        /// Outbound
        const SEND = 1 << 1;
        /// Both directions
        const BOTH = Self::RECEIVE.bits() | Self::SEND.bits();
    }
}

/// Which inactivity counts as idle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdleKind {
    /// Nothing received for the threshold
    Receive,
    /// Nothing sent for the threshold
    Send,
    /// Nothing received and nothing sent
    #[default]
    Both,
    /// Nothing received or nothing sent
    Either,
}

/// Session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Transport I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Codec failure
    #[error("codec error: {0}")]
    Wire(#[from] WireError),

    /// Inbound queue at capacity
    #[error("incoming queue is full")]
    IncomingQueueFull,

    /// Outbound queue at capacity
    #[error("outgoing queue is full")]
    OutgoingQueueFull,

    /// Outbound connect exceeded its deadline
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// Operation requires an open session
    #[error("session is not open")]
    NotOpen,

    /// TLS setup or handshake failure
    #[error("TLS error: {0}")]
    Tls(String),

    /// No tokio runtime to run the I/O tasks on
    #[error("no async runtime available")]
    NoRuntime,

    /// An application callback returned an error
    #[error("callback failed: {0}")]
    Callback(String),

    /// An application callback panicked
    #[error("callback panicked: {0}")]
    Panic(String),
}
