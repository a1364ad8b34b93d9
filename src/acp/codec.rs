//! NDJSON codec for agent streams.
//!
//! Wraps [`tokio_util::codec::AnyDelimiterCodec`] with a maximum line length
//! and decodes each line to a [`serde_json::Value`]. A bad line never poisons
//! the stream: invalid UTF-8, invalid JSON and over-long lines decode to
//! [`Frame::Malformed`] so the reader can log and skip them while
//! [`FramedRead`] keeps going.
//!
//! # Usage
//!
//! ```rust,ignore
//! use tokio_util::codec::FramedRead;
//! use agent_conduit::acp::codec::JsonLineCodec;
//!
//! let frames = FramedRead::new(child_stdout, JsonLineCodec::new());
//! ```
//!
//! [`FramedRead`]: tokio_util::codec::FramedRead

use bytes::{Bytes, BytesMut};
use serde_json::Value;
use tokio_util::codec::{AnyDelimiterCodec, AnyDelimiterCodecError, Decoder, Encoder};

use crate::{AppError, Result};

/// Maximum line length accepted on the inbound stream: 1 MiB.
pub const MAX_LINE_BYTES: usize = 1_048_576;

/// One decoded line.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// A well-formed JSON value together with its raw text.
    Value {
        /// Parsed value.
        value: Value,
        /// The line as received, without the newline.
        raw: String,
    },
    /// A line that could not be decoded; the channel continues after it.
    Malformed {
        /// The offending line, lossily decoded (empty when it was discarded
        /// for length).
        raw: String,
        /// Decode failure description.
        error: String,
    },
}

/// Newline-delimited JSON codec for both directions.
///
/// Lines are framed as raw bytes, so invalid UTF-8 is a per-line decode
/// failure rather than a stream error.
#[derive(Debug)]
pub struct JsonLineCodec {
    lines: AnyDelimiterCodec,
    max: usize,
}

impl JsonLineCodec {
    /// Create a codec with the default [`MAX_LINE_BYTES`] limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_length(MAX_LINE_BYTES)
    }

    /// Create a codec with a custom inbound line limit.
    #[must_use]
    pub fn with_max_length(max: usize) -> Self {
        Self {
            lines: AnyDelimiterCodec::new_with_max_length(b"\n".to_vec(), b"\n".to_vec(), max),
            max,
        }
    }
}

impl Default for JsonLineCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for JsonLineCodec {
    type Item = Frame;
    type Error = AppError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.lines.decode(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = to_frame(&line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return map_codec_error(e, self.max).map(Some),
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        loop {
            match self.lines.decode_eof(src) {
                Ok(Some(line)) => {
                    if let Some(frame) = to_frame(&line) {
                        return Ok(Some(frame));
                    }
                }
                Ok(None) => return Ok(None),
                Err(e) => return map_codec_error(e, self.max).map(Some),
            }
        }
    }
}

impl Encoder<Value> for JsonLineCodec {
    type Error = AppError;

    /// Encode `item` as compact JSON followed by `\n`.
    ///
    /// `serde_json` escapes control characters inside strings, so the
    /// encoded frame never contains an embedded newline.
    fn encode(&mut self, item: Value, dst: &mut BytesMut) -> Result<()> {
        let line = serde_json::to_string(&item)
            .map_err(|e| AppError::Acp(format!("failed to serialise outbound frame: {e}")))?;
        self.lines.encode(line, dst).map_err(|e| match e {
            AnyDelimiterCodecError::Io(io) => AppError::Io(io.to_string()),
            AnyDelimiterCodecError::MaxChunkLengthExceeded => {
                AppError::Acp("outbound frame exceeds line limit".into())
            }
        })
    }
}

/// Decode one line; blank lines produce no frame.
fn to_frame(line: &Bytes) -> Option<Frame> {
    let line: &[u8] = line;
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    let text = match std::str::from_utf8(line) {
        Ok(text) => text,
        Err(e) => {
            return Some(Frame::Malformed {
                raw: String::from_utf8_lossy(line).into_owned(),
                error: format!("invalid utf-8: {e}"),
            })
        }
    };
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    Some(match serde_json::from_str::<Value>(trimmed) {
        Ok(value) => Frame::Value {
            value,
            raw: text.to_owned(),
        },
        Err(e) => Frame::Malformed {
            error: format!("malformed json: {e}"),
            raw: text.to_owned(),
        },
    })
}

/// Over-long lines become a malformed frame; the inner codec discards the
/// rest of the line on the next call. I/O errors stay fatal.
fn map_codec_error(e: AnyDelimiterCodecError, max: usize) -> Result<Frame> {
    match e {
        AnyDelimiterCodecError::MaxChunkLengthExceeded => Ok(Frame::Malformed {
            raw: String::new(),
            error: format!("line too long: exceeded {max} bytes"),
        }),
        AnyDelimiterCodecError::Io(io_err) => Err(AppError::Io(io_err.to_string())),
    }
}
