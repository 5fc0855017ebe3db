//! ==============================================================================
//! codec.rs - newline-delimited json frames
//! ==============================================================================
//!
//! purpose:
//!     turns the raw byte stream from the microcontroller into json values and
//!     back. one frame = one line = one json object.
//!
//! wire format:
//!     device -> host   {"sensor":"DHT11","temperature":25.5,"humidity":60.0}\r\n
//!     host -> device   {"min_temperature":40.0}\n
//!
//!     arduino's Serial.println() terminates with CRLF, so a trailing '\r' is
//!     stripped. blank lines are skipped silently (boot noise after a reset).
//!
//! relationships:
//!     - used by: session.rs (FrameBuffer sits between the port and the loop)
//!
//! ==============================================================================

use serde::Serialize;
use serde_json::Value;

use crate::error::FrameError;

/// line delimiter in both directions
pub const DELIMITER: u8 = b'\n';

/// longest line we are willing to buffer before giving up on it
pub const MAX_FRAME_LEN: usize = 1024;

/// bytes of an undecodable line that end up in the log
const PREVIEW_LEN: usize = 16;

/// decode the first complete line in `buffer`
///
/// returns the decoded frame (or the reason it could not be decoded) and the
/// bytes that were not consumed. `None` means no complete line is available yet;
/// the returned remainder must be kept for the next read. leading blank lines
/// are consumed without producing a frame.
pub fn decode(buffer: &[u8]) -> (Option<Result<Value, FrameError>>, &[u8]) {
    let mut rest = buffer;

    while let Some(pos) = rest.iter().position(|&b| b == DELIMITER) {
        let line = trim_line(&rest[..pos]);
        let after = &rest[pos + 1..];

        if line.is_empty() {
            rest = after;
            continue;
        }

        return (Some(parse_line(line)), after);
    }

    (None, rest)
}

/// serialize `value` as one frame (json + delimiter)
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut bytes = serde_json::to_vec(value)?;
    bytes.push(DELIMITER);
    Ok(bytes)
}

fn trim_line(line: &[u8]) -> &[u8] {
    let start = line.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(line.len());
    let end = line.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |p| p + 1);
    &line[start..end]
}

fn parse_line(line: &[u8]) -> Result<Value, FrameError> {
    let text = std::str::from_utf8(line).map_err(|_| FrameError::Utf8 {
        preview: hex::encode(&line[..line.len().min(PREVIEW_LEN)]),
    })?;
    Ok(serde_json::from_str(text)?)
}

// ==============================================================================
// frame buffer - accumulates partial reads
// ==============================================================================

/// stateful wrapper around `decode` for a byte stream that arrives in chunks
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// pop the next complete frame, if any
    ///
    /// an incomplete line longer than MAX_FRAME_LEN is dropped and reported as
    /// `FrameError::Oversized`.
    pub fn next_frame(&mut self) -> Option<Result<Value, FrameError>> {
        let (frame, rest) = decode(&self.buf);
        let consumed = self.buf.len() - rest.len();
        self.buf.drain(..consumed);

        if frame.is_none() && self.buf.len() > MAX_FRAME_LEN {
            let len = self.buf.len();
            self.buf.clear();
            return Some(Err(FrameError::Oversized { len, limit: MAX_FRAME_LEN }));
        }

        frame
    }
}
