//! Message frame codec.
//!
//! One [`Message`] is one socket frame: a MessagePack array of four elements.
//!
//! ```text
//! [ type: str, correlation_id: str, payload: bin, properties: map<str, str> ]
//! ```
//!
//! Every element is length-prefixed by MessagePack itself, so arbitrary binary
//! payloads round-trip byte-exact. The positional layout is the interop
//! contract between controller and cloud; append new elements at the end only.

use std::io::Cursor;

use bytes::Bytes;
use serde::Deserialize;

use super::Message;
use crate::error::{ConnectorError, Result};

/// Default upper bound for a single frame (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Serialize `message` into a single frame.
pub fn encode(message: &Message, max_frame_size: usize) -> Result<Bytes> {
    let frame = rmp_serde::to_vec(message)
        .map_err(|e| ConnectorError::MalformedFrame(format!("encode: {e}")))?;
    if frame.len() > max_frame_size {
        return Err(ConnectorError::MalformedFrame(format!(
            "frame of {} bytes exceeds limit of {max_frame_size}",
            frame.len()
        )));
    }
    Ok(Bytes::from(frame))
}

/// Parse one frame. Truncated input, trailing bytes, and oversized frames
/// are all rejected.
pub fn decode(frame: &[u8], max_frame_size: usize) -> Result<Message> {
    if frame.len() > max_frame_size {
        return Err(ConnectorError::MalformedFrame(format!(
            "frame of {} bytes exceeds limit of {max_frame_size}",
            frame.len()
        )));
    }

    let mut cursor = Cursor::new(frame);
    let message = Message::deserialize(&mut rmp_serde::Deserializer::new(&mut cursor))
        .map_err(|e| ConnectorError::MalformedFrame(e.to_string()))?;

    let consumed = usize::try_from(cursor.position()).unwrap_or(usize::MAX);
    if consumed != frame.len() {
        return Err(ConnectorError::MalformedFrame(format!(
            "{} trailing bytes after message",
            frame.len().saturating_sub(consumed)
        )));
    }
    Ok(message)
}
