//! In-band terminal resize messages.
//!
//! The browser sends a binary frame whose first byte is `0x01`, followed by a
//! JSON object such as `{"cols":120,"rows":40}`, sometimes with trailing
//! whitespace or NUL padding.

use serde::Deserialize;
use thiserror::Error;

/// First byte of a binary frame carrying a resize request.
pub const RESIZE_SENTINEL: u8 = 0x01;

/// Bytes stripped from both ends of the resize payload.
const PADDING: &[u8] = b" \n\r\t\x00\x01";

/// Anything larger than this is not a window size.
const MAX_PAYLOAD_LEN: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResizeError {
    #[error("empty resize payload")]
    Empty,

    #[error("resize payload too large ({0} bytes)")]
    TooLarge(usize),

    #[error("malformed resize payload: {0}")]
    Malformed(String),

    #[error("invalid terminal size {rows}x{cols}")]
    InvalidSize { rows: u16, cols: u16 },
}

/// Requested terminal dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TtySize {
    #[serde(alias = "Rows")]
    pub rows: u16,
    #[serde(alias = "Cols")]
    pub cols: u16,
}

fn trim_matching<'a>(mut data: &'a [u8], set: &[u8]) -> &'a [u8] {
    while let [first, rest @ ..] = data {
        if set.contains(first) {
            data = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = data {
        if set.contains(last) {
            data = rest;
        } else {
            break;
        }
    }
    data
}

/// Strip NUL padding from both ends of a frame.
pub fn trim_nul(data: &[u8]) -> &[u8] {
    trim_matching(data, b"\x00")
}

/// True if `frame` (already NUL-trimmed) is a resize request.
pub fn is_resize_frame(frame: &[u8]) -> bool {
    frame.first() == Some(&RESIZE_SENTINEL)
}

/// Parse the bytes following the sentinel into a size.
pub fn parse_resize(payload: &[u8]) -> Result<TtySize, ResizeError> {
    // Padding set includes the sentinel itself; some clients repeat it.
    let payload = trim_matching(payload, PADDING);
    if payload.is_empty() {
        return Err(ResizeError::Empty);
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(ResizeError::TooLarge(payload.len()));
    }
    let size: TtySize =
        serde_json::from_slice(payload).map_err(|e| ResizeError::Malformed(e.to_string()))?;
    if size.rows == 0 || size.cols == 0 {
        return Err(ResizeError::InvalidSize {
            rows: size.rows,
            cols: size.cols,
        });
    }
    Ok(size)
}
