//! HTTP/1.1 message framing.
//!
//! A message is a request line or status line, CRLF-separated headers, a
//! blank line and exactly `Content-Length` body bytes. Chunked transfer
//! encoding is not supported. Header names are case-sensitive.

use crate::accumulator::ByteAccumulator;
use crate::codec::{line_at, BlankLineScan, Decoded, FrameCodec, FrameState};
use crate::error::WireError;
use bytes::{BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tracing::debug;

/// Default cap on a header block or body
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 256 * 1024;

/// Content type header name
pub const CONTENT_TYPE: &str = "Content-Type";
/// Content length header name
pub const CONTENT_LENGTH: &str = "Content-Length";
/// Connection header name
pub const CONNECTION: &str = "Connection";

const DEFAULT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
const DEFAULT_VERSION: &str = "HTTP/1.1";

/// First line of an HTTP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartLine {
    /// `METHOD target VERSION`
    Request {
        /// Upper-cased method
        method: String,
        /// Request target, as sent
        target: String,
        /// Protocol version
        version: String,
    },
    /// `VERSION code reason`
    Status {
        /// Protocol version
        version: String,
        /// Status code
        code: u16,
        /// Reason phrase
        reason: String,
    },
}

impl StartLine {
    fn parse(line: &str) -> Result<Self, WireError> {
        let line = line.trim();
        let malformed = || WireError::StartLine(line.to_string());

        if line.starts_with("HTTP/") {
            let mut parts = line.splitn(3, ' ');
            let version = parts.next().ok_or_else(malformed)?;
            let code = parts
                .next()
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(malformed)?;
            let reason = parts.next().unwrap_or_default();
            return Ok(StartLine::Status {
                version: version.to_string(),
                code,
                reason: reason.to_string(),
            });
        }

        let tokens: Vec<&str> = line.split(' ').collect();
        if tokens.len() != 3 || tokens.iter().any(|t| t.is_empty()) {
            return Err(malformed());
        }
        Ok(StartLine::Request {
            method: tokens[0].to_uppercase(),
            target: tokens[1].to_string(),
            version: tokens[2].to_string(),
        })
    }
}

/// One HTTP request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpMessage {
    /// Request line or status line
    pub start: StartLine,
    /// Headers, case-sensitive names
    pub headers: BTreeMap<String, String>,
    /// Body bytes
    pub body: Bytes,
}

impl HttpMessage {
    /// Empty request
    pub fn request(method: &str, target: &str) -> Self {
        Self {
            start: StartLine::Request {
                method: method.to_uppercase(),
                target: target.to_string(),
                version: DEFAULT_VERSION.to_string(),
            },
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// Empty response
    pub fn response(code: u16, reason: &str) -> Self {
        Self {
            start: StartLine::Status {
                version: DEFAULT_VERSION.to_string(),
                code,
                reason: reason.to_string(),
            },
            headers: BTreeMap::new(),
            body: Bytes::new(),
        }
    }

    /// Set a header
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.insert(name.to_string(), value.to_string());
        self
    }

    /// Set the body
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Header value by exact name
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// Whether this is a request
    pub fn is_request(&self) -> bool {
        matches!(self.start, StartLine::Request { .. })
    }

    /// Request method
    pub fn method(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { method, .. } => Some(method),
            StartLine::Status { .. } => None,
        }
    }

    /// Request target
    pub fn path(&self) -> Option<&str> {
        match &self.start {
            StartLine::Request { target, .. } => Some(target),
            StartLine::Status { .. } => None,
        }
    }

    /// Response status code
    pub fn status(&self) -> Option<u16> {
        match &self.start {
            StartLine::Status { code, .. } => Some(*code),
            StartLine::Request { .. } => None,
        }
    }

    /// Whether the declared content type is textual
    pub fn is_text(&self) -> bool {
        self.header(CONTENT_TYPE)
            .map(|t| t.to_ascii_lowercase().contains("text"))
            .unwrap_or(false)
    }

    /// Body as UTF-8 text
    pub fn content(&self) -> Result<&str, WireError> {
        Ok(std::str::from_utf8(&self.body)?)
    }
}

/// Continuation state of the HTTP decoder
#[derive(Debug, Default)]
pub struct HttpState {
    stage: FrameState,
    scan: BlankLineScan,
    pending: Option<(StartLine, BTreeMap<String, String>, usize)>,
    body: Bytes,
}

/// Codec for [`HttpMessage`]
#[derive(Debug, Clone)]
pub struct HttpCodec {
    max_message_size: usize,
    custom_headers: BTreeMap<String, String>,
}

impl Default for HttpCodec {
    fn default() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            custom_headers: BTreeMap::new(),
        }
    }
}

impl HttpCodec {
    /// Codec with default limits and no custom headers
    pub fn new() -> Self {
        Self::default()
    }

    /// Change the size cap; zero keeps the current value
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        if max > 0 {
            self.max_message_size = max;
        }
        self
    }

    /// Headers applied to every outgoing message, overriding its own
    pub fn with_custom_headers<I, K, V>(mut self, headers: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.custom_headers
            .extend(headers.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    fn parse_head(&self, head: &[u8]) -> Result<(StartLine, BTreeMap<String, String>, usize), WireError> {
        let text = std::str::from_utf8(head).map_err(|e| {
            let at = e.valid_up_to();
            let first_line_end = head
                .windows(2)
                .position(|w| w == b"\r\n")
                .unwrap_or(head.len());
            if at < first_line_end {
                WireError::StartLine(line_at(head, at))
            } else {
                WireError::HeaderLine(line_at(head, at))
            }
        })?;
        let mut lines = text.split("\r\n").filter(|l| !l.is_empty());
        let start = StartLine::parse(lines.next().unwrap_or_default())?;

        let mut headers = BTreeMap::new();
        for line in lines {
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| WireError::HeaderLine(line.to_string()))?;
            headers.insert(name.to_string(), value.trim_start_matches(' ').to_string());
        }

        let len = match headers.get(CONTENT_LENGTH) {
            Some(value) => value
                .trim()
                .parse::<usize>()
                .map_err(|_| WireError::ContentLength(value.clone()))?,
            None => 0,
        };
        if len > self.max_message_size {
            return Err(WireError::Size {
                size: len,
                limit: self.max_message_size,
            });
        }

        Ok((start, headers, len))
    }
}

impl FrameCodec for HttpCodec {
    type Message = HttpMessage;
    type State = HttpState;

    fn encode(&self, message: &HttpMessage, dst: &mut BytesMut) -> Result<(), WireError> {
        let mut headers = message.headers.clone();
        headers.extend(self.custom_headers.clone());
        headers
            .entry(CONTENT_TYPE.to_string())
            .or_insert_with(|| DEFAULT_CONTENT_TYPE.to_string());
        headers.insert(CONTENT_LENGTH.to_string(), message.body.len().to_string());

        let start = match &message.start {
            StartLine::Request {
                method,
                target,
                version,
            } => format!("{} {} {}", method, target, version),
            StartLine::Status {
                version,
                code,
                reason,
            } => {
                headers
                    .entry(CONNECTION.to_string())
                    .or_insert_with(|| "keep-alive".to_string());
                format!("{} {} {}", version, code, reason)
            }
        };

        dst.reserve(start.len() + message.body.len() + 64 * (headers.len() + 1));
        dst.put_slice(start.as_bytes());
        dst.put_slice(b"\r\n");
        for (name, value) in &headers {
            dst.put_slice(name.as_bytes());
            dst.put_slice(b": ");
            dst.put_slice(value.as_bytes());
            dst.put_slice(b"\r\n");
        }
        dst.put_slice(b"\r\n");
        dst.put_slice(&message.body);
        Ok(())
    }

    fn decode(
        &self,
        state: &mut HttpState,
        src: &mut ByteAccumulator,
        out: &mut Decoded<HttpMessage>,
    ) -> Result<bool, WireError> {
        loop {
            match state.stage {
                FrameState::WaitingForHeader => {
                    if src.is_empty() {
                        break;
                    }
                    let Some(end) = state.scan.find(src.chunk()) else {
                        if src.remaining() > self.max_message_size {
                            return Err(WireError::Size {
                                size: src.remaining(),
                                limit: self.max_message_size,
                            });
                        }
                        break;
                    };
                    let head = self.parse_head(&src.chunk()[..end])?;
                    src.advance(end + 4);
                    debug!("HTTP head parsed, body length {}", head.2);

                    state.stage = if head.2 > 0 {
                        FrameState::WaitingForBody
                    } else {
                        FrameState::Ready
                    };
                    state.pending = Some(head);
                }
                FrameState::WaitingForBody => {
                    let len = state.pending.as_ref().map(|p| p.2).unwrap_or_default();
                    let Some(body) = src.take(len) else {
                        break;
                    };
                    state.body = body;
                    state.stage = FrameState::Ready;
                }
                FrameState::Ready => {
                    if let Some((start, headers, _)) = state.pending.take() {
                        out.emit(HttpMessage {
                            start,
                            headers,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_chunks(codec: &HttpCodec, chunks: &[&[u8]]) -> Result<Vec<HttpMessage>, WireError> {
        let mut acc = ByteAccumulator::new();
        let mut state = HttpState::default();
        let mut out = Decoded::new();
        for chunk in chunks {
            acc.append(chunk);
            codec.decode(&mut state, &mut acc, &mut out)?;
            acc.compact();
        }
        Ok(out.messages)
    }

    #[test]
    fn test_request_without_body() {
        let codec = HttpCodec::new();
        let msgs = decode_chunks(
            &codec,
            &[b"get /index.html HTTP/1.1\r\nHost: example.com\r\nAccept:*/*\r\n\r\n"],
        )
        .unwrap();

        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].method(), Some("GET"));
        assert_eq!(msgs[0].path(), Some("/index.html"));
        assert_eq!(msgs[0].header("Host"), Some("example.com"));
        assert_eq!(msgs[0].header("Accept"), Some("*/*"));
        assert_eq!(msgs[0].header("host"), None);
        assert!(msgs[0].body.is_empty());
    }

    #[test]
    fn test_body_split_across_reads() {
        let codec = HttpCodec::new();
        let msgs = decode_chunks(
            &codec,
            &[
                b"POST /echo HTTP/1.1\r\nContent-Le",
                b"ngth: 11\r\n\r\nhello",
                b" world",
                b"GET / HTTP/1.1\r\n\r\n",
            ],
        )
        .unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content().unwrap(), "hello world");
        assert_eq!(msgs[1].method(), Some("GET"));
    }

    #[test]
    fn test_response_round_trip() {
        let codec = HttpCodec::new().with_custom_headers([("Server", "netsession")]);
        let response = HttpMessage::response(200, "OK").with_body("héllo");

        let mut buf = BytesMut::new();
        codec.encode(&response, &mut buf).unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Length: 6\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.contains("Content-Type: text/plain; charset=utf-8\r\n"));
        assert!(text.contains("Server: netsession\r\n"));

        let msgs = decode_chunks(&codec, &[&buf[..]]).unwrap();
        assert_eq!(msgs[0].status(), Some(200));
        assert_eq!(msgs[0].content().unwrap(), "héllo");
        assert!(msgs[0].is_text());
    }

    #[test]
    fn test_request_encode_has_no_connection_header() {
        let codec = HttpCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(&HttpMessage::request("put", "/item"), &mut buf)
            .unwrap();
        let text = std::str::from_utf8(&buf).unwrap();
        assert!(text.starts_with("PUT /item HTTP/1.1\r\n"));
        assert!(!text.contains("Connection:"));
        assert!(text.ends_with("Content-Length: 0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n"));
    }

    #[test]
    fn test_malformed_request_line() {
        let err = decode_chunks(&HttpCodec::new(), &[b"GARBAGE\r\n\r\n"]).unwrap_err();
        assert!(matches!(err, WireError::StartLine(_)));
        assert!(err.is_protocol_violation());
    }

    #[test]
    fn test_malformed_header_line() {
        let err =
            decode_chunks(&HttpCodec::new(), &[b"GET / HTTP/1.1\r\nno colon here\r\n\r\n"]).unwrap_err();
        assert!(matches!(err, WireError::HeaderLine(_)));
    }

    #[test]
    fn test_non_utf8_head_is_malformed() {
        let err = decode_chunks(
            &HttpCodec::new(),
            &[b"GET / HTTP/1.1\r\nX-Bad: \xff\xfe\r\n\r\nGET /ok HTTP/1.1\r\n\r\n"],
        )
        .unwrap_err();
        assert!(matches!(err, WireError::HeaderLine(_)));
        assert!(err.is_protocol_violation());

        let err = decode_chunks(&HttpCodec::new(), &[b"G\xffT / HTTP/1.1\r\n\r\n"]).unwrap_err();
        assert!(matches!(err, WireError::StartLine(_)));
    }

    #[test]
    fn test_head_trickled_byte_by_byte() {
        let raw = b"POST /drip HTTP/1.1\r\nContent-Length: 2\r\n\r\nokGET / HTTP/1.1\r\n\r\n";
        let chunks: Vec<&[u8]> = raw.chunks(1).collect();
        let msgs = decode_chunks(&HttpCodec::new(), &chunks).unwrap();

        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].path(), Some("/drip"));
        assert_eq!(msgs[0].content().unwrap(), "ok");
        assert_eq!(msgs[1].method(), Some("GET"));
    }

    #[test]
    fn test_bad_and_oversized_content_length() {
        let err = decode_chunks(
            &HttpCodec::new(),
            &[b"POST / HTTP/1.1\r\nContent-Length: lots\r\n\r\n"],
        )
        .unwrap_err();
        assert!(matches!(err, WireError::ContentLength(_)));

        let err = decode_chunks(
            &HttpCodec::new().with_max_message_size(8),
            &[b"POST / HTTP/1.1\r\nContent-Length: 9\r\n\r\n"],
        )
        .unwrap_err();
        assert!(matches!(err, WireError::Size { size: 9, limit: 8 }));
    }

    #[test]
    fn test_unterminated_header_block_over_limit() {
        let codec = HttpCodec::new().with_max_message_size(32);
        let err = decode_chunks(&codec, &[&[b'x'; 40][..]]).unwrap_err();
        assert!(err.is_protocol_violation());
    }
}
