//! Message framing for stdio transports
//!
//! Two codecs are supported:
//! - newline-delimited JSON (one message per line)
//! - `Content-Length` header framing, as used by language servers
//!
//! Both decoders keep their state across reads, so a frame split over several
//! chunks is only yielded once it is complete.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};
use tracing::{debug, trace};

/// Header lines longer than this are treated as garbage
const MAX_HEADER_LINE: usize = 8 * 1024;

/// Largest body accepted from a server
const MAX_BODY_LEN: usize = 64 * 1024 * 1024;

/// Longest newline-delimited message accepted from a server
const MAX_LINE_LEN: usize = MAX_BODY_LEN;

/// Framing protocol for a stdio transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Framing {
    /// One JSON message per line
    #[serde(rename = "ndjson", alias = "newline")]
    Ndjson,
    /// `Content-Length: N` header block followed by N bytes of JSON
    #[default]
    #[serde(rename = "content-length", alias = "content_length")]
    ContentLength,
}

impl Framing {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ndjson => "ndjson",
            Self::ContentLength => "content-length",
        }
    }
}

/// Errors produced while decoding frames
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Malformed(String),
}

/// Newline-delimited JSON codec
#[derive(Debug, Default)]
pub struct NdjsonCodec {
    /// Bytes already scanned without finding a newline
    scanned: usize,
}

impl Decoder for NdjsonCodec {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        loop {
            let Some(offset) = src[self.scanned..].iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_LINE_LEN {
                    let len = src.len();
                    src.clear();
                    self.scanned = 0;
                    return Err(FrameError::Malformed(format!(
                        "line of {} bytes exceeds maximum length",
                        len
                    )));
                }
                self.scanned = src.len();
                return Ok(None);
            };
            let line = src.split_to(self.scanned + offset + 1);
            self.scanned = 0;

            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<Value>(trimmed) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => {
                    // Servers sometimes log to stdout; skip anything that is not JSON
                    debug!(line = %trimmed, "Skipping non-JSON line on MCP stdout");
                }
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        if let Some(value) = self.decode(src)? {
            return Ok(Some(value));
        }
        let rest = src.split();
        self.scanned = 0;
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        serde_json::from_str(trimmed)
            .map(Some)
            .map_err(|e| FrameError::Malformed(format!("truncated message at EOF: {}", e)))
    }
}

impl Encoder<Value> for NdjsonCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&item).map_err(|e| FrameError::Malformed(e.to_string()))?;
        dst.reserve(body.len() + 1);
        dst.put_slice(&body);
        dst.put_u8(b'\n');
        Ok(())
    }
}

#[derive(Debug, Default)]
enum ContentLengthState {
    #[default]
    Headers,
    Body(usize),
}

/// `Content-Length` framed codec
#[derive(Debug, Default)]
pub struct ContentLengthCodec {
    state: ContentLengthState,
    content_length: Option<usize>,
    saw_header: bool,
    /// Dropping an oversized diagnostic line up to its newline
    discarding: bool,
}

impl ContentLengthCodec {
    fn reset_headers(&mut self) {
        self.state = ContentLengthState::Headers;
        self.content_length = None;
        self.saw_header = false;
    }

    /// Consume complete header lines; returns true once the block is finished
    ///
    /// A block starts at a `Content-Length` or `Content-Type` header. Anything
    /// else outside a block is diagnostic output and skipped, and a block that
    /// ends without a `Content-Length` is dropped.
    fn decode_headers(&mut self, src: &mut BytesMut) -> Result<bool, FrameError> {
        loop {
            let Some(newline) = src.iter().position(|b| *b == b'\n') else {
                if src.len() > MAX_HEADER_LINE {
                    if self.saw_header {
                        return Err(FrameError::Malformed(
                            "header line exceeds maximum length".to_string(),
                        ));
                    }
                    debug!(bytes = src.len(), "Discarding oversized output between MCP frames");
                    src.clear();
                    self.discarding = true;
                }
                return Ok(false);
            };

            let line = src.split_to(newline + 1);
            if std::mem::take(&mut self.discarding) {
                continue;
            }
            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);

            if text.is_empty() {
                if let Some(length) = self.content_length {
                    self.state = ContentLengthState::Body(length);
                    return Ok(true);
                }
                if self.saw_header {
                    debug!("Dropping MCP header block without Content-Length");
                    self.reset_headers();
                }
                continue;
            }

            match parse_header(text) {
                Some((name, value)) if self.saw_header || is_frame_header(name) => {
                    self.saw_header = true;
                    if name.eq_ignore_ascii_case("Content-Length") {
                        let length = value.parse::<usize>().map_err(|_| {
                            FrameError::Malformed(format!("invalid Content-Length '{}'", value))
                        })?;
                        if length > MAX_BODY_LEN {
                            return Err(FrameError::Malformed(format!(
                                "Content-Length {} exceeds limit",
                                length
                            )));
                        }
                        self.content_length = Some(length);
                    } else {
                        trace!(header = %name, "Ignoring MCP frame header");
                    }
                }
                _ => {
                    if self.saw_header {
                        debug!(line = %text, "Dropping interrupted MCP header block");
                        self.reset_headers();
                    } else {
                        debug!(line = %text, "Skipping diagnostic output between MCP frames");
                    }
                }
            }
        }
    }
}

fn is_frame_header(name: &str) -> bool {
    name.eq_ignore_ascii_case("Content-Length") || name.eq_ignore_ascii_case("Content-Type")
}

/// Split `Name: value` when `Name` looks like an HTTP-style header token
fn parse_header(line: &str) -> Option<(&str, &str)> {
    let (name, value) = line.split_once(':')?;
    let is_token = !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    is_token.then(|| (name, value.trim()))
}

impl Decoder for ContentLengthCodec {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        if let ContentLengthState::Headers = self.state {
            if !self.decode_headers(src)? {
                return Ok(None);
            }
        }

        let ContentLengthState::Body(length) = self.state else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let body = src.split_to(length);
        self.reset_headers();

        serde_json::from_slice(&body)
            .map(Some)
            .map_err(|e| FrameError::Malformed(format!("invalid JSON body: {}", e)))
    }
}

impl Encoder<Value> for ContentLengthCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), FrameError> {
        let body = serde_json::to_vec(&item).map_err(|e| FrameError::Malformed(e.to_string()))?;
        let header = format!("Content-Length: {}\r\n\r\n", body.len());
        dst.reserve(header.len() + body.len());
        dst.put_slice(header.as_bytes());
        dst.put_slice(&body);
        Ok(())
    }
}

/// Codec selected at runtime from a [`Framing`]
#[derive(Debug)]
pub enum FrameCodec {
    Ndjson(NdjsonCodec),
    ContentLength(ContentLengthCodec),
}

impl FrameCodec {
    pub fn new(framing: Framing) -> Self {
        match framing {
            Framing::Ndjson => Self::Ndjson(NdjsonCodec::default()),
            Framing::ContentLength => Self::ContentLength(ContentLengthCodec::default()),
        }
    }
}

impl Decoder for FrameCodec {
    type Item = Value;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        match self {
            Self::Ndjson(codec) => codec.decode(src),
            Self::ContentLength(codec) => codec.decode(src),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Value>, FrameError> {
        match self {
            Self::Ndjson(codec) => codec.decode_eof(src),
            Self::ContentLength(codec) => match codec.decode(src)? {
                Some(value) => Ok(Some(value)),
                None => {
                    let leftover = src.remaining();
                    let in_frame = codec.saw_header
                        || matches!(codec.state, ContentLengthState::Body(_));
                    if in_frame {
                        src.clear();
                        codec.reset_headers();
                        return Err(FrameError::Malformed(format!(
                            "stream ended inside a frame ({} bytes pending)",
                            leftover
                        )));
                    }
                    if leftover > 0 {
                        debug!(bytes = leftover, "Discarding trailing output at end of MCP stream");
                        src.clear();
                    }
                    Ok(None)
                }
            },
        }
    }
}

impl Encoder<Value> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<(), FrameError> {
        match self {
            Self::Ndjson(codec) => codec.encode(item, dst),
            Self::ContentLength(codec) => codec.encode(item, dst),
        }
    }
}
