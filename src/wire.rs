//! Framed message codec
//!
//! # TCP Protocol Specification
//!
//! All hub traffic uses a length-prefixed framing protocol:
//!
//! ```text
//! ┌────────────────┬────────────────┬────────────────┬─────────────────┐
//! │ Length (2 B)   │ Request (2 B)  │ Count (2 B)    │ Payload         │
//! │ Big-endian u16 │ Big-endian u16 │ Big-endian u16 │ NUL-terminated  │
//! │                │                │                │ strings         │
//! └────────────────┴────────────────┴────────────────┴─────────────────┘
//! ```
//!
//! ## Framing
//!
//! - **Length field**: payload bytes only, excluding the 6-byte header
//! - **Request field**: correlation id echoed in replies; 0 means no reply
//!   is expected
//! - **Count field**: number of NUL-terminated components in the payload
//! - **Maximum payload size**: 65535 bytes
//! - **Byte order**: network byte order (big-endian) for all header fields
//!
//! A frame carries one message of `count` UTF-8 components. Component 0 is
//! the namespace (`COMM`, `NOTIFY`, `VAR`, `WATCH`, `LOG`), component 1 the
//! verb, the rest are arguments. A count of zero is a legal frame (the
//! dispatcher rejects the resulting empty message).

use crate::error::{Error, Result};
use std::io::{self, Read};

/// Fixed frame header size in bytes.
pub const HEADER_LEN: usize = 6;

/// Largest payload expressible in the 16-bit length field.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// A decoded hub message: an ordered sequence of text components plus a
/// request correlation id.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Message {
    pub request_id: u16,
    pub components: Vec<String>,
}

impl Message {
    /// Build an unsolicited message (request id 0).
    pub fn new<I>(components: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        Self {
            request_id: 0,
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    /// Build a reply carrying the originating request's correlation id.
    pub fn with_request_id<I>(request_id: u16, components: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        let mut message = Self::new(components);
        message.request_id = request_id;
        message
    }

    /// Component at `index`, if present.
    pub fn component(&self, index: usize) -> Option<&str> {
        self.components.get(index).map(String::as_str)
    }
}

/// Encode a message into a single wire frame.
///
/// Encoding is total for any message whose payload fits the 16-bit length
/// field; larger payloads return [`Error::MessageTooLarge`].
pub fn encode(message: &Message) -> Result<Vec<u8>> {
    let payload_len: usize = message.components.iter().map(|c| c.len() + 1).sum();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Error::MessageTooLarge(payload_len));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload_len);
    frame.extend_from_slice(&(payload_len as u16).to_be_bytes());
    frame.extend_from_slice(&message.request_id.to_be_bytes());
    frame.extend_from_slice(&(message.components.len() as u16).to_be_bytes());
    for component in &message.components {
        frame.extend_from_slice(component.as_bytes());
        frame.push(0);
    }

    Ok(frame)
}

/// Decode a complete frame (header included).
pub fn decode(frame: &[u8]) -> Result<Message> {
    if frame.len() < HEADER_LEN {
        return Err(Error::Framing("frame shorter than header".into()));
    }

    let payload_len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
    let request_id = u16::from_be_bytes([frame[2], frame[3]]);
    let count = u16::from_be_bytes([frame[4], frame[5]]) as usize;

    if frame.len() - HEADER_LEN != payload_len {
        return Err(Error::Framing(format!(
            "declared payload length {} does not match frame size {}",
            payload_len,
            frame.len() - HEADER_LEN
        )));
    }

    Ok(Message {
        request_id,
        components: parse_components(count, &frame[HEADER_LEN..])?,
    })
}

/// Read one message from a stream.
///
/// Returns `Ok(None)` when the read times out before any byte of a frame
/// arrives (an idle peer); the caller should re-check its stop conditions
/// and try again. A timeout or close *inside* a frame is a framing error.
pub fn read_message<R: Read>(reader: &mut R) -> Result<Option<Message>> {
    let mut header = [0u8; HEADER_LEN];
    if !fill(reader, &mut header, false)? {
        return Ok(None);
    }

    let payload_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let request_id = u16::from_be_bytes([header[2], header[3]]);
    let count = u16::from_be_bytes([header[4], header[5]]) as usize;

    let mut payload = vec![0u8; payload_len];
    fill(reader, &mut payload, true)?;

    Ok(Some(Message {
        request_id,
        components: parse_components(count, &payload)?,
    }))
}

/// Read exactly `buf.len()` bytes.
///
/// When `frame_started` is false, a timeout before the first byte returns
/// `Ok(false)` instead of an error. Peer close always fails: either the
/// connection is gone (no bytes yet) or the frame was truncated.
fn fill<R: Read>(reader: &mut R, buf: &mut [u8], frame_started: bool) -> Result<bool> {
    let mut read = 0;
    while read < buf.len() {
        match reader.read(&mut buf[read..]) {
            Ok(0) => {
                return Err(if frame_started || read > 0 {
                    Error::Framing("connection closed mid-frame".into())
                } else {
                    Error::Framing("connection closed by peer".into())
                });
            }
            Ok(n) => read += n,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if is_timeout(e) => {
                if frame_started || read > 0 {
                    return Err(Error::Framing("receive timed out mid-frame".into()));
                }
                return Ok(false);
            }
            Err(e) => return Err(Error::Io(e)),
        }
    }
    Ok(true)
}

fn is_timeout(e: &io::Error) -> bool {
    matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut)
}

/// Split a payload into exactly `count` NUL-terminated UTF-8 components.
fn parse_components(count: usize, payload: &[u8]) -> Result<Vec<String>> {
    let mut components = Vec::with_capacity(count);
    let mut rest = payload;

    for _ in 0..count {
        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Framing("component not NUL-terminated".into()))?;
        let component = std::str::from_utf8(&rest[..nul])
            .map_err(|_| Error::Framing("component is not valid UTF-8".into()))?;
        components.push(component.to_string());
        rest = &rest[nul + 1..];
    }

    if !rest.is_empty() {
        return Err(Error::Framing(
            "payload extends past declared component count".into(),
        ));
    }

    Ok(components)
}
